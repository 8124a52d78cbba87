//! File-backed durable store.
//!
//! Each entry is one file, sharded into 256 subdirectories by key digest:
//!
//! ```text
//! <base>/<shard>/<hex(key)>.entry
//! file = b"MCT1" | u32 header_len | header (JSON EnvelopeMeta) | payload
//! ```
//!
//! Writes go to a temporary file that is renamed into place, so readers
//! never observe a partially written entry. A creation-time index is rebuilt
//! from file headers on open.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::envelope::EnvelopeMeta;
use crate::cache::query::CacheKey;
use crate::storage::{DurableRecord, DurableStore, StoreError};

const MAGIC: &[u8; 4] = b"MCT1";
const ENTRY_EXT: &str = "entry";
const TMP_EXT: &str = "tmp";

/// Monotonic suffix for temporary file names.
static NEXT_TMP_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default)]
pub struct DiskStats {
    pub total_writes: AtomicU64,
    pub total_reads: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub total_bytes_read: AtomicU64,
}

#[derive(Debug, Default)]
struct Index {
    created: HashMap<CacheKey, u64>,
    by_created: BTreeSet<(u64, CacheKey)>,
}

impl Index {
    fn insert(&mut self, key: CacheKey, created_at_ms: u64) {
        if let Some(previous) = self.created.insert(key.clone(), created_at_ms) {
            self.by_created.remove(&(previous, key.clone()));
        }
        self.by_created.insert((created_at_ms, key));
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(previous) = self.created.remove(key) {
            self.by_created.remove(&(previous, key.clone()));
        }
    }
}

/// Durable backend storing one file per entry.
///
/// Mutations run on a spawned task, so a caller that stops waiting (timeout,
/// dropped request) never leaves a renamed file missing from the index or a
/// stray temporary file behind.
#[derive(Debug, Clone)]
pub struct DiskStore {
    inner: Arc<DiskInner>,
}

#[derive(Debug)]
struct DiskInner {
    base: PathBuf,
    index: RwLock<Index>,
    stats: DiskStats,
}

impl DiskStore {
    /// Open (or create) a store rooted at `base`, rebuilding the index.
    pub async fn open(base: PathBuf) -> Result<Self, StoreError> {
        fs::create_dir_all(&base).await?;

        let mut index = Index::default();
        let mut shards = fs::read_dir(&base).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                match path.extension().and_then(|e| e.to_str()) {
                    Some(ENTRY_EXT) => {}
                    Some(TMP_EXT) => {
                        // Left behind by a crash between write and rename.
                        let _ = fs::remove_file(&path).await;
                        continue;
                    }
                    _ => continue,
                }

                let key = match key_from_path(&path) {
                    Some(key) => key,
                    None => continue,
                };
                let data = fs::read(&path).await?;
                match decode_file(&path, Bytes::from(data)) {
                    Ok(record) => index.insert(key, record.meta.created_at_ms),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Removing unreadable entry");
                        let _ = fs::remove_file(&path).await;
                    }
                }
            }
        }

        info!(
            base = %base.display(),
            entries = index.created.len(),
            "Opened disk store"
        );

        Ok(Self {
            inner: Arc::new(DiskInner {
                base,
                index: RwLock::new(index),
                stats: DiskStats::default(),
            }),
        })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.inner.entry_path(key)
    }

    /// Number of indexed entries.
    pub async fn len(&self) -> usize {
        self.inner.index.read().await.created.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get disk I/O statistics.
    pub fn stats(&self) -> &DiskStats {
        &self.inner.stats
    }

    /// Run a mutation to completion on its own task.
    async fn detached<T, F>(&self, op: impl FnOnce(Arc<DiskInner>) -> F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        tokio::spawn(op(Arc::clone(&self.inner)))
            .await
            .map_err(|e| StoreError::Unavailable(format!("disk task failed: {e}")))?
    }
}

impl DiskInner {
    /// Generate the file path for a key.
    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        // Shard on the key digest so "mq:" prefixes don't pile into one directory.
        let digest = Sha256::digest(key.as_str().as_bytes());
        let shard = format!("{:02x}", digest[0]);
        self.base
            .join(shard)
            .join(format!("{}.{ENTRY_EXT}", hex_encode(key.as_str().as_bytes())))
    }

    async fn write_entry(&self, key: CacheKey, record: DurableRecord) -> Result<bool, StoreError> {
        let path = self.entry_path(&key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let created = record.meta.created_at_ms;
        let data = encode_file(&record)?;
        let tmp = path.with_extension(format!(
            "{}.{TMP_EXT}",
            NEXT_TMP_ID.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, &data).await?;

        // Rename and index update happen under the index lock so conditional
        // deletes see both or neither.
        let mut index = self.index.write().await;
        if index.created.get(&key).is_some_and(|&stored| stored > created) {
            drop(index);
            let _ = fs::remove_file(&tmp).await;
            debug!(key = %key, created, "Dropped write older than stored entry");
            return Ok(false);
        }
        if let Err(e) = fs::rename(&tmp, &path).await {
            drop(index);
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        index.insert(key.clone(), created);
        drop(index);

        self.stats.total_writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .total_bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        debug!(key = %key, path = %path.display(), size = data.len(), "Wrote entry to disk");
        Ok(true)
    }

    /// Remove the entry, or with `created_before_ms` only an entry created
    /// strictly before it. Returns whether an indexed entry was removed.
    async fn remove_entry(
        &self,
        key: CacheKey,
        created_before_ms: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut index = self.index.write().await;
        let created = index.created.get(&key).copied();
        let eligible = match (created_before_ms, created) {
            (None, _) => true,
            (Some(before), Some(created)) => created < before,
            (Some(_), None) => false,
        };
        if !eligible {
            return Ok(false);
        }

        let path = self.entry_path(&key);
        match fs::remove_file(&path).await {
            Ok(()) => debug!(key = %key, path = %path.display(), "Deleted entry file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.remove(&key);
        Ok(created.is_some())
    }
}

#[async_trait]
impl DurableStore for DiskStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<DurableRecord>, StoreError> {
        let path = self.entry_path(key);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stats = &self.inner.stats;
        stats.total_reads.fetch_add(1, Ordering::Relaxed);
        stats
            .total_bytes_read
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        debug!(key = %key, path = %path.display(), size = data.len(), "Read entry from disk");
        decode_file(&path, Bytes::from(data)).map(Some)
    }

    async fn put(&self, key: &CacheKey, record: DurableRecord) -> Result<bool, StoreError> {
        let key = key.clone();
        self.detached(move |inner| async move { inner.write_entry(key, record).await })
            .await
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        let key = key.clone();
        self.detached(move |inner| async move { inner.remove_entry(key, None).await })
            .await
            .map(|_| ())
    }

    async fn delete_if_created_before(
        &self,
        key: &CacheKey,
        created_before_ms: u64,
    ) -> Result<bool, StoreError> {
        let key = key.clone();
        self.detached(move |inner| async move {
            inner.remove_entry(key, Some(created_before_ms)).await
        })
        .await
    }

    async fn scan_older_than(&self, cutoff_ms: u64) -> Result<Vec<CacheKey>, StoreError> {
        let index = self.inner.index.read().await;
        Ok(index
            .by_created
            .iter()
            .take_while(|(created, _)| *created < cutoff_ms)
            .map(|(_, key)| key.clone())
            .collect())
    }
}

fn encode_file(record: &DurableRecord) -> Result<Vec<u8>, StoreError> {
    let header = serde_json::to_vec(&record.meta)
        .map_err(|e| StoreError::Unavailable(format!("cannot encode header: {e}")))?;

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + record.bytes.len());
    out.extend_from_slice(MAGIC);
    out.put_u32_le(header.len() as u32);
    out.extend_from_slice(&header);
    out.extend_from_slice(&record.bytes);
    Ok(out)
}

fn decode_file(path: &Path, mut data: Bytes) -> Result<DurableRecord, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if data.remaining() < MAGIC.len() + 4 || &data[..MAGIC.len()] != MAGIC {
        return Err(corrupt("bad magic".to_string()));
    }
    data.advance(MAGIC.len());

    let header_len = data.get_u32_le() as usize;
    if data.remaining() < header_len {
        return Err(corrupt("truncated header".to_string()));
    }
    let header = data.split_to(header_len);
    let meta: EnvelopeMeta =
        serde_json::from_slice(&header).map_err(|e| corrupt(format!("bad header: {e}")))?;

    if data.len() as u64 != meta.stored_size {
        return Err(corrupt(format!(
            "payload is {} bytes, header says {}",
            data.len(),
            meta.stored_size
        )));
    }

    Ok(DurableRecord { bytes: data, meta })
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

fn key_from_path(path: &Path) -> Option<CacheKey> {
    let stem = path.file_stem()?.to_str()?;
    let raw = String::from_utf8(hex_decode(stem)?).ok()?;
    Some(CacheKey::from_raw(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::envelope::CodecTag;
    use tempfile::TempDir;

    fn record(created_at_ms: u64, payload: &'static [u8]) -> DurableRecord {
        DurableRecord {
            bytes: Bytes::from_static(payload),
            meta: EnvelopeMeta {
                compressed: false,
                codec: CodecTag::None,
                original_size: payload.len() as u64,
                stored_size: payload.len() as u64,
                created_at_ms,
                ttl_ms: 60_000,
            },
        }
    }

    #[tokio::test]
    async fn test_write_and_read_entry() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().join("durable")).await.unwrap();
        let key = CacheKey::from_raw("mq:abc");

        store.put(&key, record(5, b"[1,2,3]")).await.unwrap();
        let read = store.get(&key).await.unwrap().unwrap();
        assert_eq!(read, record(5, b"[1,2,3]"));
        assert_eq!(store.stats().total_writes.load(Ordering::Relaxed), 1);
        assert_eq!(store.stats().total_reads.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().to_path_buf()).await.unwrap();
        let key = CacheKey::from_raw("mq:gone");

        store.put(&key, record(1, b"x")).await.unwrap();
        store.delete(&key).await.unwrap();
        store.delete(&key).await.unwrap();

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let old = CacheKey::from_raw("mq:old");
        let new = CacheKey::from_raw("mq:new");
        {
            let store = DiskStore::open(tmp.path().to_path_buf()).await.unwrap();
            store.put(&old, record(100, b"a")).await.unwrap();
            store.put(&new, record(900, b"b")).await.unwrap();
        }

        let store = DiskStore::open(tmp.path().to_path_buf()).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.scan_older_than(500).await.unwrap(), vec![old]);
    }

    #[tokio::test]
    async fn test_truncated_file_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().to_path_buf()).await.unwrap();
        let key = CacheKey::from_raw("mq:trunc");
        store.put(&key, record(1, b"payload")).await.unwrap();

        let path = store.entry_path(&key);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() - 2]).unwrap();

        assert!(matches!(
            store.get(&key).await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_put_still_completes() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().to_path_buf()).await.unwrap();
        let key = CacheKey::from_raw("mq:abandoned");

        // Poll once so the write starts, then abandon it as a timeout would.
        let mut put = store.put(&key, record(7, b"[1]"));
        assert!(futures::poll!(&mut put).is_pending());
        drop(put);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while store.is_empty().await {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(store.scan_older_than(8).await.unwrap(), vec![key.clone()]);
        assert_eq!(store.get(&key).await.unwrap(), Some(record(7, b"[1]")));

        let shard = store.entry_path(&key).parent().unwrap().to_path_buf();
        let leftovers: Vec<_> = std::fs::read_dir(shard)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(TMP_EXT))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_conditional_delete_and_stale_put() {
        let tmp = TempDir::new().unwrap();
        let store = DiskStore::open(tmp.path().to_path_buf()).await.unwrap();
        let key = CacheKey::from_raw("mq:cond");

        assert!(store.put(&key, record(100, b"new")).await.unwrap());
        assert!(!store.put(&key, record(50, b"old")).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Some(record(100, b"new")));

        assert!(!store.delete_if_created_before(&key, 100).await.unwrap());
        assert!(store.entry_path(&key).exists());

        assert!(store.delete_if_created_before(&key, 101).await.unwrap());
        assert!(!store.entry_path(&key).exists());
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_hex_roundtrip() {
        let encoded = hex_encode(b"mq:\x00\xff");
        assert_eq!(encoded, "6d713a00ff");
        assert_eq!(hex_decode(&encoded).unwrap(), b"mq:\x00\xff");
        assert!(hex_decode("abc").is_none());
        assert!(hex_decode("zz").is_none());
    }
}
