//! Cache envelope types.
//!
//! An envelope is the stored representation of one cached query result: the
//! (possibly compressed) payload plus the metadata needed to validate and
//! decode it. Envelopes are the unit of movement between tiers.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::query::CacheKey;

/// Which codec produced an envelope's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecTag {
    /// Raw serialized payload.
    None,
    /// Pattern substitution table + token stream.
    Dictionary,
    /// Structural key factoring followed by zstd.
    Hybrid,
    /// Independently zstd-compressed fixed-size blocks.
    Adaptive,
}

impl CodecTag {
    pub const ALL: [CodecTag; 4] = [
        CodecTag::None,
        CodecTag::Dictionary,
        CodecTag::Hybrid,
        CodecTag::Adaptive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecTag::None => "none",
            CodecTag::Dictionary => "dictionary",
            CodecTag::Hybrid => "hybrid",
            CodecTag::Adaptive => "adaptive",
        }
    }
}

impl std::fmt::Display for CodecTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope metadata, persisted next to the payload by durable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeMeta {
    pub compressed: bool,
    pub codec: CodecTag,
    pub original_size: u64,
    pub stored_size: u64,
    /// Creation time, milliseconds since the Unix epoch.
    pub created_at_ms: u64,
    pub ttl_ms: u64,
}

impl EnvelopeMeta {
    /// Absolute expiry time in milliseconds.
    pub fn expires_at_ms(&self) -> u64 {
        self.created_at_ms.saturating_add(self.ttl_ms)
    }

    /// Whether the entry is logically absent at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms()
    }

    /// Fraction of the TTL consumed at `now_ms`, clamped to `[0, 1]`.
    pub fn ttl_consumed(&self, now_ms: u64) -> f64 {
        if self.ttl_ms == 0 {
            return 1.0;
        }
        let elapsed = now_ms.saturating_sub(self.created_at_ms) as f64;
        (elapsed / self.ttl_ms as f64).min(1.0)
    }
}

/// A stored cache entry. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEnvelope {
    pub key: CacheKey,
    pub bytes: Bytes,
    pub meta: EnvelopeMeta,
}

impl CacheEnvelope {
    /// Build an envelope for a freshly encoded payload.
    ///
    /// `compressed` is derived from the codec that actually ran, not the one
    /// that was requested.
    pub fn new(
        key: CacheKey,
        bytes: Vec<u8>,
        codec: CodecTag,
        original_size: usize,
        created_at_ms: u64,
        ttl: Duration,
    ) -> Self {
        let stored_size = bytes.len() as u64;
        Self {
            key,
            bytes: Bytes::from(bytes),
            meta: EnvelopeMeta {
                compressed: codec != CodecTag::None,
                codec,
                original_size: original_size as u64,
                stored_size,
                created_at_ms,
                ttl_ms: ttl.as_millis().min(u64::MAX as u128) as u64,
            },
        }
    }

    /// Reassemble an envelope from its durable parts.
    pub fn from_parts(key: CacheKey, bytes: Bytes, meta: EnvelopeMeta) -> Self {
        Self { key, bytes, meta }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.meta.is_expired(now_ms)
    }

    pub fn compressed(&self) -> bool {
        self.meta.compressed
    }

    pub fn codec(&self) -> CodecTag {
        self.meta.codec
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.meta.ttl_ms)
    }
}
