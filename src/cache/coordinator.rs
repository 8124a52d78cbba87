//! Cache coordinator: the public facade over key encoding, analysis,
//! compression and the tiered store.
//!
//! ```text
//! set: descriptor → key → serialize → [analyze → select] → encode → envelope → store → stats
//! get: descriptor → key → store (TTL check) → decode → deserialize
//! ```
//!
//! Every failure except a malformed descriptor or an unserializable payload
//! degrades to a miss or a skipped write. Callers always recompute from
//! source in that case; the cache never takes the application down.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::analyzer::PayloadAnalyzer;
use crate::cache::clock::{SharedClock, SystemClock};
use crate::cache::compressor::{Compressor, Encoded};
use crate::cache::envelope::{CacheEnvelope, CodecTag};
use crate::cache::query::{CacheKey, MetricValue, QueryDescriptor};
use crate::cache::selector::{Strategy, StrategySelector};
use crate::cache::store::{Lookup, SweepReport, TierStats, TieredStore};
use crate::cache::sweeper::{self, SweeperHandle};
use crate::config::Config;
use crate::metrics::CacheMetrics;
use crate::storage::{SharedDurableStore, StoreError};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Payload cannot be serialized: {0}")]
    SerializationFailure(String),

    #[error("Durable store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Entry {key} does not decode with its codec tag: {reason}")]
    DecompressionMismatch { key: CacheKey, reason: String },

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Aggregate statistics over entries written by this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_original_bytes: u64,
    pub total_stored_bytes: u64,
    pub compressed_entry_count: u64,
    pub total_entry_count: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Stored bytes as a fraction of original bytes (1.0 when empty).
    pub fn compression_ratio(&self) -> f64 {
        if self.total_original_bytes == 0 {
            return 1.0;
        }
        self.total_stored_bytes as f64 / self.total_original_bytes as f64
    }

    pub fn bytes_saved(&self) -> u64 {
        self.total_original_bytes
            .saturating_sub(self.total_stored_bytes)
    }

    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

/// What one live entry contributes to the totals.
#[derive(Debug, Clone, Copy)]
struct Footprint {
    original: u64,
    stored: u64,
    compressed: bool,
    /// Creation time of the envelope this footprint describes.
    created_at_ms: u64,
}

/// Per-key contributions plus running totals.
///
/// Each key keeps the footprint of its newest envelope; an older one
/// recorded late is ignored. Totals are adjusted by adding the new footprint
/// before subtracting the replaced one, so they never underflow.
#[derive(Debug, Default)]
struct StatsLedger {
    footprints: DashMap<CacheKey, Footprint>,
    original: AtomicU64,
    stored: AtomicU64,
    compressed: AtomicU64,
    entries: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsLedger {
    /// Returns `false` when a newer footprint for `key` is already held.
    fn record(&self, key: CacheKey, footprint: Footprint) -> bool {
        match self.footprints.entry(key) {
            Entry::Occupied(mut slot) => {
                if slot.get().created_at_ms > footprint.created_at_ms {
                    return false;
                }
                self.add(&footprint);
                let previous = slot.insert(footprint);
                self.subtract(&previous);
            }
            Entry::Vacant(slot) => {
                self.add(&footprint);
                self.entries.fetch_add(1, Ordering::Relaxed);
                slot.insert(footprint);
            }
        }
        true
    }

    fn forget(&self, key: &CacheKey) {
        if let Some((_, previous)) = self.footprints.remove(key) {
            self.release(&previous);
        }
    }

    /// Forget `key` only if its footprint predates `created_before_ms`.
    fn forget_if_created_before(&self, key: &CacheKey, created_before_ms: u64) {
        if let Some((_, previous)) = self
            .footprints
            .remove_if(key, |_, fp| fp.created_at_ms < created_before_ms)
        {
            self.release(&previous);
        }
    }

    fn release(&self, f: &Footprint) {
        self.subtract(f);
        self.entries.fetch_sub(1, Ordering::Relaxed);
    }

    fn add(&self, f: &Footprint) {
        self.original.fetch_add(f.original, Ordering::Relaxed);
        self.stored.fetch_add(f.stored, Ordering::Relaxed);
        if f.compressed {
            self.compressed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn subtract(&self, f: &Footprint) {
        self.original.fetch_sub(f.original, Ordering::Relaxed);
        self.stored.fetch_sub(f.stored, Ordering::Relaxed);
        if f.compressed {
            self.compressed.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            total_original_bytes: self.original.load(Ordering::Relaxed),
            total_stored_bytes: self.stored.load(Ordering::Relaxed),
            compressed_entry_count: self.compressed.load(Ordering::Relaxed),
            total_entry_count: self.entries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.footprints.clear();
        for counter in [
            &self.original,
            &self.stored,
            &self.compressed,
            &self.entries,
            &self.hits,
            &self.misses,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// The cache facade. Construct one per cache; share it behind an `Arc`.
pub struct CacheCoordinator {
    store: TieredStore,
    analyzer: PayloadAnalyzer,
    selector: StrategySelector,
    compressor: Compressor,
    ledger: StatsLedger,
    metrics: CacheMetrics,
    config: Arc<Config>,
}

impl CacheCoordinator {
    /// Create a coordinator over `durable` using the system clock.
    pub fn new(config: Arc<Config>, durable: SharedDurableStore) -> Result<Self, CacheError> {
        Self::with_clock(config, durable, Arc::new(SystemClock))
    }

    /// Create a coordinator with an explicit clock.
    pub fn with_clock(
        config: Arc<Config>,
        durable: SharedDurableStore,
        clock: SharedClock,
    ) -> Result<Self, CacheError> {
        config
            .validate()
            .map_err(|e| CacheError::InvalidConfig(e.to_string()))?;

        let store = TieredStore::new(
            durable,
            config.store.clone(),
            config.eviction.clone(),
            config.sweep.max_retention(),
            clock,
        );

        Ok(Self {
            store,
            analyzer: PayloadAnalyzer::new(config.analyzer.clone()),
            selector: StrategySelector::new(config.selector.clone()),
            compressor: Compressor::new(config.compression.clone()),
            ledger: StatsLedger::default(),
            metrics: CacheMetrics::new()?,
            config,
        })
    }

    /// Cache `values` under `descriptor` for `ttl`.
    ///
    /// A durable-store failure is logged and the write skipped; it is not an
    /// error for the caller.
    pub async fn set(
        &self,
        descriptor: &QueryDescriptor,
        values: &[MetricValue],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = descriptor.cache_key()?;
        let (payload, tree) = serialize(values)?;

        let strategy = if payload.len() <= self.config.cache.compression_threshold {
            Strategy::None
        } else {
            let analysis = self.analyzer.analyze(&payload, &tree);
            debug!(
                key = %key,
                size = analysis.size,
                entropy = analysis.entropy_bits_per_symbol,
                patterns = analysis.patterns.len(),
                redundancy = analysis.redundancy_ratio,
                sampled = analysis.sampled,
                "Analyzed payload"
            );
            self.selector.select(&analysis)
        };

        let encoded = self.compressor.encode(&payload, &strategy).unwrap_or_else(|e| {
            warn!(key = %key, codec = %strategy.codec(), error = %e, "Compression failed, storing raw");
            Encoded {
                bytes: payload.clone(),
                codec: CodecTag::None,
            }
        });

        let ttl = ttl.min(self.config.sweep.max_retention());
        let envelope = CacheEnvelope::new(
            key.clone(),
            encoded.bytes,
            encoded.codec,
            payload.len(),
            self.store.now_ms(),
            ttl,
        );
        let footprint = Footprint {
            original: envelope.meta.original_size,
            stored: envelope.meta.stored_size,
            compressed: envelope.meta.compressed,
            created_at_ms: envelope.meta.created_at_ms,
        };

        match self.store.put(envelope).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(key = %key, "Newer entry already cached, write dropped");
                return Ok(());
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Durable store unavailable, cache write skipped");
                self.metrics.store_failures.inc();
                return Ok(());
            }
        }

        self.ledger.record(key.clone(), footprint);
        self.metrics.record_set(encoded.codec);
        self.refresh_gauges();

        debug!(
            key = %key,
            codec = %encoded.codec,
            original = footprint.original,
            stored = footprint.stored,
            ttl_ms = ttl.as_millis() as u64,
            "Cached query result"
        );
        Ok(())
    }

    /// Cache `values` with the configured default TTL.
    pub async fn set_default_ttl(
        &self,
        descriptor: &QueryDescriptor,
        values: &[MetricValue],
    ) -> Result<(), CacheError> {
        self.set(descriptor, values, self.config.cache.default_ttl())
            .await
    }

    /// Look up the series cached under `descriptor`.
    ///
    /// Only a malformed descriptor is an error; everything else that goes
    /// wrong is reported as a miss.
    pub async fn get(
        &self,
        descriptor: &QueryDescriptor,
    ) -> Result<Option<Vec<MetricValue>>, CacheError> {
        let key = descriptor.cache_key()?;

        let envelope = match self.store.get(&key).await {
            Lookup::Hit(envelope) => envelope,
            Lookup::Miss => {
                self.record_miss();
                return Ok(None);
            }
            Lookup::Expired { created_at_ms } => {
                self.ledger
                    .forget_if_created_before(&key, created_at_ms.saturating_add(1));
                self.metrics.expired.inc();
                self.refresh_gauges();
                self.record_miss();
                return Ok(None);
            }
        };

        match self.decode(&envelope) {
            Ok(values) => {
                self.ledger.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.hits.inc();
                Ok(Some(values))
            }
            Err(e) => {
                warn!(key = %key, codec = %envelope.codec(), error = %e, "Deleting undecodable entry");
                let created_at_ms = envelope.meta.created_at_ms;
                self.store.purge(&key, created_at_ms).await;
                self.ledger
                    .forget_if_created_before(&key, created_at_ms.saturating_add(1));
                self.metrics.corrupt_entries.inc();
                self.refresh_gauges();
                self.record_miss();
                Ok(None)
            }
        }
    }

    /// Drop whatever is cached under `descriptor`.
    pub async fn invalidate(&self, descriptor: &QueryDescriptor) -> Result<(), CacheError> {
        let key = descriptor.cache_key()?;
        self.store.delete(&key).await;
        self.ledger.forget(&key);
        self.refresh_gauges();
        debug!(key = %key, "Invalidated entry");
        Ok(())
    }

    /// Run one sweep over both tiers.
    pub async fn sweep_once(&self) -> Result<SweepReport, CacheError> {
        let report = self.store.sweep_once().await.inspect_err(|_| {
            self.metrics.store_failures.inc();
        })?;

        for purged in report
            .retention_purged
            .iter()
            .chain(report.expired_purged.iter())
        {
            self.ledger
                .forget_if_created_before(&purged.key, purged.created_before_ms);
        }
        self.metrics.sweep_purged.inc_by(report.total() as u64);
        self.refresh_gauges();
        Ok(report)
    }

    /// Start the periodic sweep task on the current tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        sweeper::spawn(Arc::clone(self), self.config.sweep.interval())
    }

    pub fn stats(&self) -> CacheStats {
        self.ledger.snapshot()
    }

    pub fn reset_stats(&self) {
        self.ledger.reset();
        self.refresh_gauges();
    }

    pub fn tier_stats(&self) -> TierStats {
        self.store.tier_stats()
    }

    pub fn tiers(&self) -> &TieredStore {
        &self.store
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn decode(&self, envelope: &CacheEnvelope) -> Result<Vec<MetricValue>, CacheError> {
        let mismatch = |reason: String| CacheError::DecompressionMismatch {
            key: envelope.key.clone(),
            reason,
        };

        if envelope.compressed() != (envelope.codec() != CodecTag::None) {
            return Err(mismatch(format!(
                "compressed flag {} disagrees with codec {}",
                envelope.compressed(),
                envelope.codec()
            )));
        }

        let raw: Cow<'_, [u8]> = if envelope.compressed() {
            Cow::Owned(
                self.compressor
                    .decompress(&envelope.bytes, envelope.codec())
                    .map_err(|e| mismatch(e.to_string()))?,
            )
        } else {
            Cow::Borrowed(&envelope.bytes)
        };

        if raw.len() as u64 != envelope.meta.original_size {
            return Err(mismatch(format!(
                "decoded {} bytes, expected {}",
                raw.len(),
                envelope.meta.original_size
            )));
        }

        serde_json::from_slice(&raw).map_err(|e| mismatch(e.to_string()))
    }

    fn record_miss(&self) {
        self.ledger.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.misses.inc();
    }

    fn refresh_gauges(&self) {
        let stats = self.ledger.snapshot();
        self.metrics
            .original_bytes
            .set(stats.total_original_bytes as i64);
        self.metrics.stored_bytes.set(stats.total_stored_bytes as i64);
        self.metrics.entries.set(stats.total_entry_count as i64);
    }
}

/// Serialize a series to JSON bytes plus the value tree the analyzer walks.
fn serialize(values: &[MetricValue]) -> Result<(Vec<u8>, serde_json::Value), CacheError> {
    // serde_json would silently write non-finite floats as `null`.
    if let Some(bad) = values.iter().find(|v| !v.value.is_finite()) {
        return Err(CacheError::SerializationFailure(format!(
            "value at t={} is not finite ({})",
            bad.timestamp, bad.value
        )));
    }

    let tree = serde_json::to_value(values)
        .map_err(|e| CacheError::SerializationFailure(e.to_string()))?;
    let bytes =
        serde_json::to_vec(&tree).map_err(|e| CacheError::SerializationFailure(e.to_string()))?;
    Ok((bytes, tree))
}
