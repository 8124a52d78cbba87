//! Durable storage under the volatile tier.
//!
//! - [`memory`]: in-process backend, durable for the process lifetime only
//! - [`disk`]: one file per entry, survives restarts
//!
//! Any key/value store that can scan entries by creation time can implement
//! [`DurableStore`].

pub mod disk;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::cache::envelope::{CacheEnvelope, EnvelopeMeta};
use crate::cache::query::CacheKey;
use crate::config::DurableBackend;

pub use disk::DiskStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Durable store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Durable store unavailable: {0}")]
    Unavailable(String),
}

/// A payload plus its envelope metadata, as held by a durable backend.
#[derive(Debug, Clone, PartialEq)]
pub struct DurableRecord {
    pub bytes: Bytes,
    pub meta: EnvelopeMeta,
}

impl DurableRecord {
    pub fn into_envelope(self, key: CacheKey) -> CacheEnvelope {
        CacheEnvelope::from_parts(key, self.bytes, self.meta)
    }
}

impl From<&CacheEnvelope> for DurableRecord {
    fn from(envelope: &CacheEnvelope) -> Self {
        Self {
            bytes: envelope.bytes.clone(),
            meta: envelope.meta,
        }
    }
}

/// The durable tier's contract.
///
/// `put` must publish a record atomically: a concurrent `get` sees either the
/// previous record or the complete new one. Records are ordered by
/// `meta.created_at_ms`; a `put` older than the stored record is dropped.
///
/// Implementations must finish a mutation once started even if the calling
/// future is dropped, because callers bound every call with a timeout.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<DurableRecord>, StoreError>;

    /// Returns `false` when a newer record was already stored and kept.
    async fn put(&self, key: &CacheKey, record: DurableRecord) -> Result<bool, StoreError>;

    /// Idempotent.
    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError>;

    /// Delete `key` only if its record was created strictly before
    /// `created_before_ms`. Returns whether a record was removed.
    async fn delete_if_created_before(
        &self,
        key: &CacheKey,
        created_before_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Keys of entries created strictly before `cutoff_ms`.
    async fn scan_older_than(&self, cutoff_ms: u64) -> Result<Vec<CacheKey>, StoreError>;
}

pub type SharedDurableStore = Arc<dyn DurableStore>;

/// Open the backend named in the configuration.
pub async fn open(backend: &DurableBackend) -> Result<SharedDurableStore, StoreError> {
    match backend {
        DurableBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        DurableBackend::Disk { path } => Ok(Arc::new(DiskStore::open(path.clone()).await?)),
    }
}
