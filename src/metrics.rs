//! Prometheus instrumentation for the cache.
//!
//! Each coordinator owns its own [`Registry`], so isolated instances (tests,
//! multiple caches in one process) never collide on metric names.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::envelope::CodecTag;

/// Metric name prefix.
const PREFIX: &str = "metrics_cache";

#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub expired: IntCounter,
    pub sets: IntCounterVec,
    pub store_failures: IntCounter,
    pub corrupt_entries: IntCounter,
    pub sweep_purged: IntCounter,
    pub original_bytes: IntGauge,
    pub stored_bytes: IntGauge,
    pub entries: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let c = IntCounter::new(format!("{PREFIX}_{name}"), help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            let g = IntGauge::new(format!("{PREFIX}_{name}"), help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };

        let hits = counter("hits_total", "Lookups answered from the cache")?;
        let misses = counter("misses_total", "Lookups that found nothing usable")?;
        let expired = counter("expired_total", "Lookups that found an expired entry")?;
        let store_failures = counter(
            "store_failures_total",
            "Durable store errors and timeouts",
        )?;
        let corrupt_entries = counter(
            "corrupt_entries_total",
            "Entries deleted because they failed to decode",
        )?;
        let sweep_purged = counter("sweep_purged_total", "Entries removed by the sweeper")?;
        let original_bytes = gauge(
            "original_bytes",
            "Serialized size of entries written by this process",
        )?;
        let stored_bytes = gauge(
            "stored_bytes",
            "Stored size of entries written by this process",
        )?;
        let entries = gauge("entries", "Entries written by this process")?;

        let sets = IntCounterVec::new(
            Opts::new(format!("{PREFIX}_sets_total"), "Entries stored, by codec"),
            &["codec"],
        )?;
        registry.register(Box::new(sets.clone()))?;
        for codec in CodecTag::ALL {
            sets.with_label_values(&[codec.as_str()]);
        }

        Ok(Self {
            registry,
            hits,
            misses,
            expired,
            sets,
            store_failures,
            corrupt_entries,
            sweep_purged,
            original_bytes,
            stored_bytes,
            entries,
        })
    }

    pub fn record_set(&self, codec: CodecTag) {
        self.sets.with_label_values(&[codec.as_str()]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("hits", &self.hits.get())
            .field("misses", &self.misses.get())
            .finish_non_exhaustive()
    }
}
