//! In-process durable backend.
//!
//! Records live in a map guarded by a short-held lock, with a secondary
//! index ordered by creation time for the retention scan.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cache::query::CacheKey;
use crate::storage::{DurableRecord, DurableStore, StoreError};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<CacheKey, DurableRecord>,
    /// (created_at_ms, key)
    by_created: BTreeSet<(u64, CacheKey)>,
}

/// Durable backend held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<DurableRecord>, StoreError> {
        Ok(self.inner.read().await.records.get(key).cloned())
    }

    async fn put(&self, key: &CacheKey, record: DurableRecord) -> Result<bool, StoreError> {
        let created = record.meta.created_at_ms;
        let mut inner = self.inner.write().await;
        if let Some(stored) = inner.records.get(key) {
            if stored.meta.created_at_ms > created {
                return Ok(false);
            }
        }
        if let Some(previous) = inner.records.insert(key.clone(), record) {
            inner
                .by_created
                .remove(&(previous.meta.created_at_ms, key.clone()));
        }
        inner.by_created.insert((created, key.clone()));
        Ok(true)
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.records.remove(key) {
            inner
                .by_created
                .remove(&(previous.meta.created_at_ms, key.clone()));
        }
        Ok(())
    }

    async fn delete_if_created_before(
        &self,
        key: &CacheKey,
        created_before_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let created = match inner.records.get(key) {
            Some(stored) if stored.meta.created_at_ms < created_before_ms => {
                stored.meta.created_at_ms
            }
            _ => return Ok(false),
        };
        inner.records.remove(key);
        inner.by_created.remove(&(created, key.clone()));
        Ok(true)
    }

    async fn scan_older_than(&self, cutoff_ms: u64) -> Result<Vec<CacheKey>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_created
            .iter()
            .take_while(|(created, _)| *created < cutoff_ms)
            .map(|(_, key)| key.clone())
            .collect())
    }
}
