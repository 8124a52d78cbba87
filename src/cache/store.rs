//! Tiered store: a volatile in-process tier in front of a durable tier.
//!
//! The store:
//! - Writes durable first, then publishes to the volatile tier
//! - Serves reads from the volatile tier and promotes durable hits
//! - Treats expired envelopes as absent and purges them from both tiers
//! - Evicts from the volatile tier when it exceeds its high watermark
//! - Purges durable entries past the retention window on sweep
//!
//! Envelopes of one key are ordered by `created_at_ms`. Publishing never
//! replaces a newer envelope, and purges only remove envelopes at or before
//! the one judged stale, so a concurrent write always survives a purge.
//!
//! Per-key lifecycle:
//!
//! ```text
//! Absent → Present (volatile + durable) → Expired (on TTL check) → Purged (on sweep) → Absent
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::clock::SharedClock;
use crate::cache::envelope::CacheEnvelope;
use crate::cache::evictor::{EntryUsage, Evictor};
use crate::cache::query::CacheKey;
use crate::config::{EvictionConfig, StoreConfig};
use crate::storage::{DurableRecord, SharedDurableStore, StoreError};

/// Outcome of a lookup.
#[derive(Debug, Clone)]
pub enum Lookup {
    Hit(Arc<CacheEnvelope>),
    Miss,
    /// The entry existed but its TTL had elapsed; it has been purged.
    Expired { created_at_ms: u64 },
}

/// One key removed by a sweep, with the bound its purge applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Purged {
    pub key: CacheKey,
    /// Only envelopes created strictly before this were removed.
    pub created_before_ms: u64,
}

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Durable entries older than the retention window.
    pub retention_purged: Vec<Purged>,
    /// Volatile entries whose TTL had elapsed (also deleted from durable).
    pub expired_purged: Vec<Purged>,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.retention_purged.len() + self.expired_purged.len()
    }
}

/// A volatile-tier slot. The envelope is swapped, never mutated.
#[derive(Debug)]
struct VolatileEntry {
    envelope: Arc<CacheEnvelope>,
    last_access_ms: AtomicU64,
}

impl VolatileEntry {
    fn new(envelope: Arc<CacheEnvelope>, now_ms: u64) -> Self {
        Self {
            envelope,
            last_access_ms: AtomicU64::new(now_ms),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.store(now_ms, Ordering::Relaxed);
    }
}

/// Per-tier counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub volatile_entries: usize,
    pub volatile_bytes: u64,
    pub volatile_capacity: usize,
    pub promotions: u64,
    pub evictions: u64,
}

/// Volatile tier over a durable store.
pub struct TieredStore {
    volatile: DashMap<CacheKey, VolatileEntry>,
    durable: SharedDurableStore,
    evictor: Evictor,
    clock: SharedClock,
    config: StoreConfig,
    max_retention: Duration,
    promotions: AtomicU64,
    evictions: AtomicU64,
}

impl TieredStore {
    pub fn new(
        durable: SharedDurableStore,
        config: StoreConfig,
        eviction: EvictionConfig,
        max_retention: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            volatile: DashMap::new(),
            durable,
            evictor: Evictor::new(eviction),
            clock,
            config,
            max_retention,
            promotions: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Look up `key`, validating its TTL.
    pub async fn get(&self, key: &CacheKey) -> Lookup {
        let now = self.now_ms();

        // Volatile tier. Clone the Arc out so no shard lock is held across await.
        let volatile_hit = self.volatile.get(key).map(|entry| {
            entry.touch(now);
            entry.envelope.clone()
        });
        if let Some(envelope) = volatile_hit {
            if !envelope.is_expired(now) {
                return Lookup::Hit(envelope);
            }
            debug!(key = %key, "Volatile entry expired");
            let created_at_ms = envelope.meta.created_at_ms;
            self.purge(key, created_at_ms).await;
            return Lookup::Expired { created_at_ms };
        }

        // Durable tier.
        let record = match self.durable_call(self.durable.get(key)).await {
            Ok(Some(record)) => record,
            Ok(None) => return Lookup::Miss,
            Err(e) => {
                warn!(key = %key, error = %e, "Durable read failed, treating as miss");
                return Lookup::Miss;
            }
        };

        let envelope = Arc::new(record.into_envelope(key.clone()));
        if envelope.is_expired(now) {
            debug!(key = %key, "Durable entry expired");
            let created_at_ms = envelope.meta.created_at_ms;
            self.purge(key, created_at_ms).await;
            return Lookup::Expired { created_at_ms };
        }

        if self.publish(envelope.clone(), now) {
            self.promotions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Promoted durable entry to volatile tier");
        }
        Lookup::Hit(envelope)
    }

    /// Store an envelope: durable first, then volatile.
    ///
    /// Returns `false` when a newer envelope for the key was already stored;
    /// nothing changes in that case. On a durable failure the volatile tier
    /// is left untouched so it never becomes the only copy.
    pub async fn put(&self, envelope: CacheEnvelope) -> Result<bool, StoreError> {
        let key = envelope.key.clone();
        let stored = self
            .durable_call(self.durable.put(&key, DurableRecord::from(&envelope)))
            .await?;
        if !stored {
            debug!(key = %key, "Superseded by a newer durable entry");
            return Ok(false);
        }

        self.publish(Arc::new(envelope), self.now_ms());
        self.enforce_capacity();
        Ok(true)
    }

    /// Remove `key` from both tiers. Idempotent; durable failures are logged.
    pub async fn delete(&self, key: &CacheKey) {
        self.volatile.remove(key);
        if let Err(e) = self.durable_call(self.durable.delete(key)).await {
            warn!(key = %key, error = %e, "Durable delete failed");
        }
    }

    /// Remove the envelope created at `created_at_ms`, and anything older,
    /// from both tiers. A newer envelope written concurrently is kept.
    ///
    /// Returns whether a durable record was removed; failures are logged.
    pub async fn purge(&self, key: &CacheKey, created_at_ms: u64) -> bool {
        self.purge_created_before(key, created_at_ms.saturating_add(1))
            .await
            .unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "Durable purge failed");
                false
            })
    }

    /// Volatile first, then durable: a write racing the purge lands its
    /// durable record after ours is judged, and its volatile publish is never
    /// matched by the volatile condition.
    async fn purge_created_before(
        &self,
        key: &CacheKey,
        created_before_ms: u64,
    ) -> Result<bool, StoreError> {
        self.volatile.remove_if(key, |_, entry| {
            entry.envelope.meta.created_at_ms < created_before_ms
        });
        self.durable_call(
            self.durable
                .delete_if_created_before(key, created_before_ms),
        )
        .await
    }

    /// Purge durable entries past the retention window and volatile entries
    /// past their TTL.
    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let now = self.now_ms();
        let mut report = SweepReport::default();

        // Volatile TTL pass. `retain` judges and removes each entry under its
        // shard lock, so only the expired envelope itself is dropped.
        let mut expired = Vec::new();
        self.volatile.retain(|key, entry| {
            let keep = !entry.envelope.is_expired(now);
            if !keep {
                expired.push((key.clone(), entry.envelope.meta.created_at_ms));
            }
            keep
        });
        for (key, created_at_ms) in expired {
            let created_before_ms = created_at_ms.saturating_add(1);
            if let Err(e) = self
                .durable_call(self.durable.delete_if_created_before(&key, created_before_ms))
                .await
            {
                warn!(key = %key, error = %e, "Durable delete of expired entry failed");
            }
            report.expired_purged.push(Purged {
                key,
                created_before_ms,
            });
        }

        // Durable retention pass.
        let cutoff = now.saturating_sub(self.max_retention.as_millis() as u64);
        let stale = self
            .durable_call(self.durable.scan_older_than(cutoff))
            .await?;
        for key in stale {
            match self.purge_created_before(&key, cutoff).await {
                Ok(true) => report.retention_purged.push(Purged {
                    key,
                    created_before_ms: cutoff,
                }),
                Ok(false) => debug!(key = %key, "Entry rewritten since scan, kept"),
                Err(e) => warn!(key = %key, error = %e, "Durable purge failed"),
            }
        }

        if report.total() > 0 {
            info!(
                retention = report.retention_purged.len(),
                expired = report.expired_purged.len(),
                "Sweep complete"
            );
        }
        Ok(report)
    }

    /// Whether `key` is currently held in the volatile tier.
    pub fn is_volatile(&self, key: &CacheKey) -> bool {
        self.volatile.contains_key(key)
    }

    pub fn volatile_len(&self) -> usize {
        self.volatile.len()
    }

    /// Get tier statistics for monitoring.
    pub fn tier_stats(&self) -> TierStats {
        TierStats {
            volatile_entries: self.volatile.len(),
            volatile_bytes: self
                .volatile
                .iter()
                .map(|entry| entry.envelope.meta.stored_size)
                .sum(),
            volatile_capacity: self.config.volatile_capacity,
            promotions: self.promotions.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Publish unless a newer envelope for the key is already present.
    fn publish(&self, envelope: Arc<CacheEnvelope>, now_ms: u64) -> bool {
        match self.volatile.entry(envelope.key.clone()) {
            Entry::Occupied(mut slot) => {
                if slot.get().envelope.meta.created_at_ms > envelope.meta.created_at_ms {
                    return false;
                }
                slot.insert(VolatileEntry::new(envelope, now_ms));
            }
            Entry::Vacant(slot) => {
                slot.insert(VolatileEntry::new(envelope, now_ms));
            }
        }
        true
    }

    /// Run one round of volatile eviction if above the high watermark.
    ///
    /// Returns the number of entries evicted.
    fn enforce_capacity(&self) -> usize {
        let capacity = self.config.volatile_capacity;
        let len = self.volatile.len();
        let high = (self.config.high_watermark * capacity as f64) as usize;
        if len <= high.max(1) && len <= capacity {
            return 0;
        }

        let low = (self.config.low_watermark * capacity as f64) as usize;
        let excess = len.saturating_sub(low);
        let now = self.now_ms();

        let snapshot: Vec<(CacheKey, EntryUsage)> = self
            .volatile
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    EntryUsage {
                        meta: entry.envelope.meta,
                        last_access_ms: entry.last_access_ms.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        let victims = self.evictor.select_victims(snapshot.into_iter(), excess, now);
        let evicted = victims
            .iter()
            .filter(|victim| self.volatile.remove(&victim.key).is_some())
            .count();

        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!(evicted, remaining = self.volatile.len(), "Volatile eviction round complete");
        evicted
    }

    /// Bound a durable call by the configured timeout.
    async fn durable_call<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let timeout = self.config.store_timeout();
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }
}
