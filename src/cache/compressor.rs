//! Codec engine: applies and reverses a compression strategy.
//!
//! Every frame is self-describing, so decoding only needs the codec tag
//! recorded in the envelope:
//!
//! ```text
//! Dictionary: u16 n | n × (u8 len | bytes) | token stream
//!             token stream: b (b != 0xFF) | FF 00 (literal 0xFF) | FF i (table[i - 1])
//! Hybrid:     u8 flags (bit 0 = keys factored) | zstd(body)
//! Adaptive:   u32 block_size | u32 count | count × (u32 len | zstd(block))
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut};
use thiserror::Error;
use tracing::debug;

use crate::cache::envelope::CodecTag;
use crate::cache::selector::Strategy;
use crate::config::CompressionConfig;

/// Escape byte of the dictionary token stream.
const ESC: u8 = 0xFF;

/// Token ids are `1..=255`.
const MAX_DICTIONARY_ENTRIES: usize = 255;

/// Shorter patterns cannot beat their two-byte token.
const MIN_ENTRY_LEN: usize = 3;

const HYBRID_PREPROCESSED: u8 = 0b0000_0001;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Zstd codec failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Corrupt {codec} frame: {reason}")]
    Corrupt { codec: CodecTag, reason: String },

    #[error("Dictionary has {0} entries, at most 255 are addressable")]
    TooManyPatterns(usize),

    #[error("Adaptive block size must be positive")]
    InvalidBlockSize,
}

impl CodecError {
    fn corrupt(codec: CodecTag, reason: impl Into<String>) -> Self {
        CodecError::Corrupt {
            codec,
            reason: reason.into(),
        }
    }
}

/// Output of [`Compressor::encode`]: the bytes to store and the codec that
/// actually produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub codec: CodecTag,
}

impl Encoded {
    fn identity(data: &[u8]) -> Self {
        Self {
            bytes: data.to_vec(),
            codec: CodecTag::None,
        }
    }
}

/// The codec engine.
#[derive(Debug, Clone)]
pub struct Compressor {
    config: CompressionConfig,
}

impl Compressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    /// Compress with `strategy`, falling back to the identity when the result
    /// would not be smaller than the input.
    pub fn encode(&self, data: &[u8], strategy: &Strategy) -> Result<Encoded, CodecError> {
        if matches!(strategy, Strategy::None) {
            return Ok(Encoded::identity(data));
        }

        let compressed = self.compress(data, strategy)?;
        if compressed.len() >= data.len() {
            debug!(
                requested = %strategy.codec(),
                original = data.len(),
                compressed = compressed.len(),
                "Compression did not reduce size, storing raw"
            );
            return Ok(Encoded::identity(data));
        }

        Ok(Encoded {
            bytes: compressed,
            codec: strategy.codec(),
        })
    }

    /// Apply `strategy` to `data` unconditionally.
    pub fn compress(&self, data: &[u8], strategy: &Strategy) -> Result<Vec<u8>, CodecError> {
        match strategy {
            Strategy::None => Ok(data.to_vec()),
            Strategy::Dictionary { patterns } => dictionary_encode(data, patterns),
            Strategy::Hybrid { preprocess } => self.hybrid_compress(data, *preprocess),
            Strategy::Adaptive { block_size } => self.adaptive_compress(data, *block_size),
        }
    }

    /// Reverse the codec identified by `codec`.
    pub fn decompress(&self, data: &[u8], codec: CodecTag) -> Result<Vec<u8>, CodecError> {
        match codec {
            CodecTag::None => Ok(data.to_vec()),
            CodecTag::Dictionary => dictionary_decode(data),
            CodecTag::Hybrid => self.hybrid_decompress(data),
            CodecTag::Adaptive => self.adaptive_decompress(data),
        }
    }

    fn hybrid_compress(&self, data: &[u8], preprocess: bool) -> Result<Vec<u8>, CodecError> {
        let (flags, body) = if preprocess {
            let keys = structural_keys(data);
            (HYBRID_PREPROCESSED, dictionary_encode(data, &keys)?)
        } else {
            (0, data.to_vec())
        };

        let compressed = self.zstd_compress(&body)?;
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.put_u8(flags);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    fn hybrid_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let (&flags, body) = data
            .split_first()
            .ok_or_else(|| CodecError::corrupt(CodecTag::Hybrid, "missing flags byte"))?;
        if flags & !HYBRID_PREPROCESSED != 0 {
            return Err(CodecError::corrupt(
                CodecTag::Hybrid,
                format!("unknown flags {flags:#04x}"),
            ));
        }

        let decompressed = self.zstd_decompress(body)?;
        if flags & HYBRID_PREPROCESSED != 0 {
            dictionary_decode(&decompressed)
        } else {
            Ok(decompressed)
        }
    }

    /// Chunked compression. Blocks are independent, so they could be
    /// compressed in parallel; they are compressed in order here.
    fn adaptive_compress(&self, data: &[u8], block_size: usize) -> Result<Vec<u8>, CodecError> {
        if block_size == 0 || block_size > u32::MAX as usize {
            return Err(CodecError::InvalidBlockSize);
        }

        let blocks = data.chunks(block_size);
        let mut out = Vec::with_capacity(data.len() / 2 + 8);
        out.put_u32_le(block_size as u32);
        out.put_u32_le(blocks.len() as u32);
        for block in blocks {
            let compressed = self.zstd_compress(block)?;
            out.put_u32_le(compressed.len() as u32);
            out.extend_from_slice(&compressed);
        }
        Ok(out)
    }

    fn adaptive_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let corrupt = |reason: &str| CodecError::corrupt(CodecTag::Adaptive, reason);

        let mut buf = data;
        if buf.remaining() < 8 {
            return Err(corrupt("truncated header"));
        }
        let block_size = buf.get_u32_le() as usize;
        let count = buf.get_u32_le() as usize;
        if block_size == 0 {
            return Err(corrupt("zero block size"));
        }

        let mut out = Vec::new();
        for index in 0..count {
            if buf.remaining() < 4 {
                return Err(corrupt("truncated block length"));
            }
            let len = buf.get_u32_le() as usize;
            if buf.remaining() < len {
                return Err(corrupt("truncated block"));
            }
            let block = self.zstd_decompress(&buf[..len])?;
            let is_last = index + 1 == count;
            if block.len() > block_size || (!is_last && block.len() != block_size) {
                return Err(corrupt("block length does not match block size"));
            }
            out.extend_from_slice(&block);
            buf.advance(len);
        }

        if buf.has_remaining() {
            return Err(corrupt("trailing bytes after last block"));
        }
        Ok(out)
    }

    /// Compress data with zstd.
    fn zstd_compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let compressed = zstd::encode_all(data, self.config.zstd_level)?;
        Ok(compressed)
    }

    /// Decompress zstd data.
    fn zstd_decompress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let decompressed = zstd::decode_all(data)?;
        Ok(decompressed)
    }
}

/// Replace occurrences of `patterns` with two-byte tokens, greedily taking
/// the longest match at each position.
fn dictionary_encode(data: &[u8], patterns: &[Vec<u8>]) -> Result<Vec<u8>, CodecError> {
    let mut table: Vec<&[u8]> = Vec::new();
    for pattern in patterns {
        let usable = (MIN_ENTRY_LEN..=u8::MAX as usize).contains(&pattern.len());
        if usable && !table.contains(&pattern.as_slice()) {
            table.push(pattern.as_slice());
        }
    }
    if table.len() > MAX_DICTIONARY_ENTRIES {
        return Err(CodecError::TooManyPatterns(table.len()));
    }

    // Candidates by first byte, longest first.
    let mut by_first: Vec<Vec<usize>> = vec![Vec::new(); 256];
    for (id, entry) in table.iter().enumerate() {
        by_first[entry[0] as usize].push(id);
    }
    for bucket in &mut by_first {
        bucket.sort_by(|&a, &b| table[b].len().cmp(&table[a].len()));
    }

    let header_len: usize = 2 + table.iter().map(|e| 1 + e.len()).sum::<usize>();
    let mut out = Vec::with_capacity(header_len + data.len());
    out.put_u16_le(table.len() as u16);
    for entry in &table {
        out.put_u8(entry.len() as u8);
        out.extend_from_slice(entry);
    }

    let mut pos = 0;
    while pos < data.len() {
        let rest = &data[pos..];
        let matched = by_first[rest[0] as usize]
            .iter()
            .copied()
            .find(|&id| rest.starts_with(table[id]));

        match matched {
            Some(id) => {
                out.put_u8(ESC);
                out.put_u8(id as u8 + 1);
                pos += table[id].len();
            }
            None => {
                out.put_u8(rest[0]);
                if rest[0] == ESC {
                    out.put_u8(0);
                }
                pos += 1;
            }
        }
    }

    Ok(out)
}

fn dictionary_decode(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let corrupt = |reason: &str| CodecError::corrupt(CodecTag::Dictionary, reason);

    let mut buf = data;
    if buf.remaining() < 2 {
        return Err(corrupt("truncated table header"));
    }
    let count = buf.get_u16_le() as usize;
    if count > MAX_DICTIONARY_ENTRIES {
        return Err(corrupt("table too large"));
    }

    let mut table: Vec<&[u8]> = Vec::with_capacity(count);
    for _ in 0..count {
        if !buf.has_remaining() {
            return Err(corrupt("truncated table entry"));
        }
        let len = buf.get_u8() as usize;
        if len == 0 || buf.remaining() < len {
            return Err(corrupt("invalid table entry"));
        }
        let (entry, rest) = buf.split_at(len);
        table.push(entry);
        buf = rest;
    }

    let mut out = Vec::with_capacity(buf.remaining() * 2);
    let mut tokens = buf.iter();
    while let Some(&b) = tokens.next() {
        if b != ESC {
            out.push(b);
            continue;
        }
        match tokens.next() {
            Some(0) => out.push(ESC),
            Some(&id) => {
                let entry = table
                    .get(id as usize - 1)
                    .ok_or_else(|| corrupt("token outside table"))?;
                out.extend_from_slice(entry);
            }
            None => return Err(corrupt("dangling escape byte")),
        }
    }

    Ok(out)
}

/// JSON object keys (`"name":` tokens) that occur more than once in `data`,
/// most valuable first.
fn structural_keys(data: &[u8]) -> Vec<Vec<u8>> {
    let mut counts: std::collections::HashMap<&[u8], usize> = std::collections::HashMap::new();

    let mut i = 0;
    while i < data.len() {
        if data[i] != b'"' {
            i += 1;
            continue;
        }
        // Find the closing quote, skipping escaped characters.
        let start = i;
        let mut j = i + 1;
        while j < data.len() && data[j] != b'"' {
            j += if data[j] == b'\\' { 2 } else { 1 };
        }
        if j >= data.len() {
            break;
        }
        if data.get(j + 1) == Some(&b':') {
            *counts.entry(&data[start..=j + 1]).or_insert(0) += 1;
        }
        i = j + 1;
    }

    let mut keys: Vec<(&[u8], usize)> = counts.into_iter().filter(|&(_, n)| n > 1).collect();
    keys.sort_by(|a, b| {
        (b.0.len() * b.1)
            .cmp(&(a.0.len() * a.1))
            .then_with(|| a.0.cmp(b.0))
    });
    keys.into_iter()
        .take(MAX_DICTIONARY_ENTRIES)
        .map(|(key, _)| key.to_vec())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> Compressor {
        Compressor::new(CompressionConfig::default())
    }

    fn series_json(points: usize) -> Vec<u8> {
        let values: Vec<serde_json::Value> = (0..points)
            .map(|i| serde_json::json!({"timestamp": i * 30, "value": (i % 7) as f64 * 0.5}))
            .collect();
        serde_json::to_vec(&values).unwrap()
    }

    #[test]
    fn test_zstd_roundtrip() {
        let compressor = compressor();
        let data = vec![42u8; 4096];

        let compressed = compressor.zstd_compress(&data).unwrap();
        assert!(compressed.len() < data.len());

        let decompressed = compressor.zstd_decompress(&compressed).unwrap();
        assert_eq!(decompressed, data);
    }

    #[test]
    fn test_dictionary_roundtrip_with_escape_bytes() {
        let data = b"\xFFabcabc\xFF\xFFabc-abcabc\xFF".to_vec();
        let patterns = vec![b"abc".to_vec(), b"abcabc".to_vec(), b"\xFFab".to_vec()];

        let encoded = dictionary_encode(&data, &patterns).unwrap();
        assert_eq!(dictionary_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_dictionary_skips_unusable_patterns() {
        let data = b"ababab".to_vec();
        let patterns = vec![Vec::new(), b"ab".to_vec(), b"ab".to_vec()];

        let encoded = dictionary_encode(&data, &patterns).unwrap();
        // Empty table: header plus verbatim body.
        assert_eq!(&encoded[..2], &[0, 0]);
        assert_eq!(dictionary_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_dictionary_shrinks_repetitive_payload() {
        let data = b"metric.cpu.user;".repeat(200);
        let patterns = vec![b"metric.cpu.user;".to_vec()];

        let encoded = compressor()
            .encode(&data, &Strategy::Dictionary { patterns })
            .unwrap();
        assert_eq!(encoded.codec, CodecTag::Dictionary);
        assert!(encoded.bytes.len() < data.len() / 4);
    }

    #[test]
    fn test_structural_keys_found() {
        let data = series_json(10);
        let keys = structural_keys(&data);
        assert!(keys.contains(&br#""timestamp":"#.to_vec()));
        assert!(keys.contains(&br#""value":"#.to_vec()));
    }

    #[test]
    fn test_hybrid_roundtrip_both_modes() {
        let compressor = compressor();
        let data = series_json(200);
        for preprocess in [true, false] {
            let strategy = Strategy::Hybrid { preprocess };
            let compressed = compressor.compress(&data, &strategy).unwrap();
            assert!(compressed.len() < data.len());
            let restored = compressor.decompress(&compressed, CodecTag::Hybrid).unwrap();
            assert_eq!(restored, data);
        }
    }

    #[test]
    fn test_adaptive_roundtrip_uneven_tail() {
        let compressor = compressor();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 97) as u8).collect();
        let compressed = compressor
            .compress(&data, &Strategy::Adaptive { block_size: 1024 })
            .unwrap();

        let mut header = &compressed[..8];
        assert_eq!(header.get_u32_le(), 1024);
        assert_eq!(header.get_u32_le(), 5);

        let restored = compressor.decompress(&compressed, CodecTag::Adaptive).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_adaptive_rejects_zero_block_size() {
        let err = compressor()
            .compress(b"abc", &Strategy::Adaptive { block_size: 0 })
            .unwrap_err();
        assert!(matches!(err, CodecError::InvalidBlockSize));
    }

    #[test]
    fn test_encode_falls_back_when_not_smaller() {
        // Incompressible input: zstd framing makes it larger.
        let data: Vec<u8> = (0..64u8).collect();
        let encoded = compressor()
            .encode(&data, &Strategy::Adaptive { block_size: 1024 })
            .unwrap();
        assert_eq!(encoded.codec, CodecTag::None);
        assert_eq!(encoded.bytes, data);
    }

    #[test]
    fn test_corrupt_frames_are_errors() {
        let compressor = compressor();
        assert!(compressor.decompress(&[], CodecTag::Dictionary).is_err());
        assert!(compressor.decompress(&[0, 0, 0xFF], CodecTag::Dictionary).is_err());
        assert!(compressor.decompress(&[0, 0, 0xFF, 9], CodecTag::Dictionary).is_err());
        assert!(compressor.decompress(&[], CodecTag::Hybrid).is_err());
        assert!(compressor.decompress(&[0x80, 1, 2], CodecTag::Hybrid).is_err());
        assert!(compressor.decompress(&[1, 0, 0], CodecTag::Adaptive).is_err());
        assert!(compressor
            .decompress(&[0, 4, 0, 0, 1, 0, 0, 0, 50, 0, 0, 0], CodecTag::Adaptive)
            .is_err());
    }
}
