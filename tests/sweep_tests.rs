//! Tests for retention sweeps and the background sweeper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use metrics_cache_tier::cache::clock::{Clock, ManualClock};
use metrics_cache_tier::cache::envelope::{CodecTag, EnvelopeMeta};
use metrics_cache_tier::cache::query::{CacheKey, MetricValue, QueryDescriptor, TimeRange};
use metrics_cache_tier::cache::CacheCoordinator;
use metrics_cache_tier::config::{Config, DurableBackend};
use metrics_cache_tier::cache::store::Purged;
use metrics_cache_tier::storage::{self, DurableRecord, DurableStore, MemoryStore, StoreError};

fn descriptor(metric: &str) -> QueryDescriptor {
    QueryDescriptor::new(metric, TimeRange::new(0.0, 3600.0), "max")
}

fn points() -> Vec<MetricValue> {
    (0..10).map(|i| MetricValue::new(i, 0.25)).collect()
}

fn long_lived_record(created_at_ms: u64) -> DurableRecord {
    DurableRecord {
        bytes: Bytes::from_static(b"[]"),
        meta: EnvelopeMeta {
            compressed: false,
            codec: CodecTag::None,
            original_size: 2,
            stored_size: 2,
            created_at_ms,
            ttl_ms: 10 * 3600 * 1000,
        },
    }
}

fn retention_config(secs: u64) -> Config {
    let mut config = Config::default();
    config.sweep.max_retention_secs = secs;
    config.sweep.interval_secs = 1;
    config
}

#[tokio::test]
async fn test_sweep_purges_expired_entries() {
    let clock = ManualClock::new(0);
    let durable = Arc::new(MemoryStore::new());
    let cache = CacheCoordinator::with_clock(
        Arc::new(retention_config(3600)),
        durable.clone(),
        clock.clone(),
    )
    .unwrap();

    cache
        .set(&descriptor("short"), &points(), Duration::from_secs(5))
        .await
        .unwrap();
    cache
        .set(&descriptor("long"), &points(), Duration::from_secs(600))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(6));
    let report = cache.sweep_once().await.unwrap();

    assert_eq!(
        report.expired_purged,
        vec![Purged {
            key: descriptor("short").cache_key().unwrap(),
            created_before_ms: 1,
        }]
    );
    assert!(report.retention_purged.is_empty());
    assert_eq!(durable.len().await, 1);
    assert_eq!(cache.stats().total_entry_count, 1);
    assert_eq!(cache.metrics().sweep_purged.get(), 1);
}

#[tokio::test]
async fn test_sweep_purges_entries_past_retention() {
    let clock = ManualClock::new(0);
    let durable = Arc::new(MemoryStore::new());
    let cache = CacheCoordinator::with_clock(
        Arc::new(retention_config(60)),
        durable.clone(),
        clock.clone(),
    )
    .unwrap();

    // Written by another process with a TTL beyond this process's retention.
    let foreign = CacheKey::from_raw("mq:foreign");
    durable
        .put(&foreign, long_lived_record(clock.now_ms()))
        .await
        .unwrap();

    clock.advance(Duration::from_secs(30));
    assert_eq!(cache.sweep_once().await.unwrap().total(), 0);

    clock.advance(Duration::from_secs(31));
    let report = cache.sweep_once().await.unwrap();
    assert_eq!(
        report.retention_purged,
        vec![Purged {
            key: foreign,
            created_before_ms: 1_000,
        }]
    );
    assert!(durable.is_empty().await);
}

#[tokio::test]
async fn test_sweep_on_disk_store() {
    let dir = tempfile::tempdir().unwrap();
    let backend = DurableBackend::Disk {
        path: dir.path().to_path_buf(),
    };
    let clock = ManualClock::new(1_000);
    let durable = storage::open(&backend).await.unwrap();
    let cache =
        CacheCoordinator::with_clock(Arc::new(retention_config(10)), durable, clock.clone())
            .unwrap();

    cache
        .set(&descriptor("disk"), &points(), Duration::from_secs(5))
        .await
        .unwrap();
    assert!(cache.get(&descriptor("disk")).await.unwrap().is_some());

    clock.advance(Duration::from_secs(11));
    let report = cache.sweep_once().await.unwrap();
    assert_eq!(report.total(), 1);
    assert_eq!(cache.stats().total_entry_count, 0);

    // Nothing left on disk for a fresh process to pick up.
    let reopened = storage::open(&backend).await.unwrap();
    assert!(reopened.scan_older_than(u64::MAX).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_background_sweeper_runs_and_stops() {
    let clock = ManualClock::new(0);
    let cache = Arc::new(
        CacheCoordinator::with_clock(
            Arc::new(retention_config(3600)),
            Arc::new(MemoryStore::new()),
            clock.clone(),
        )
        .unwrap(),
    );

    cache
        .set(&descriptor("tick"), &points(), Duration::from_millis(100))
        .await
        .unwrap();
    clock.advance(Duration::from_millis(200));

    let sweeper = cache.spawn_sweeper();
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(cache.tiers().volatile_len(), 0);
    assert_eq!(cache.stats().total_entry_count, 0);
    assert!(!sweeper.is_finished());

    tokio::time::timeout(Duration::from_secs(1), sweeper.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_dropping_handle_stops_sweeper() {
    let cache = Arc::new(
        CacheCoordinator::new(Arc::new(retention_config(3600)), Arc::new(MemoryStore::new()))
            .unwrap(),
    );
    let sweeper = cache.spawn_sweeper();
    drop(sweeper);

    // The task held the only other reference to the coordinator.
    tokio::time::timeout(Duration::from_secs(1), async {
        while Arc::strong_count(&cache) > 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

// ─── Writes racing a sweep ─────────────────────────────────────────────────

/// Holds the first conditional delete until released, so a write can land
/// between a sweep's decision and its durable delete.
struct GatedStore {
    inner: MemoryStore,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        })
    }
}

#[async_trait]
impl DurableStore for GatedStore {
    async fn get(&self, key: &CacheKey) -> Result<Option<DurableRecord>, StoreError> {
        self.inner.get(key).await
    }
    async fn put(&self, key: &CacheKey, record: DurableRecord) -> Result<bool, StoreError> {
        self.inner.put(key, record).await
    }
    async fn delete(&self, key: &CacheKey) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
    async fn delete_if_created_before(
        &self,
        key: &CacheKey,
        created_before_ms: u64,
    ) -> Result<bool, StoreError> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.delete_if_created_before(key, created_before_ms).await
    }
    async fn scan_older_than(&self, cutoff_ms: u64) -> Result<Vec<CacheKey>, StoreError> {
        self.inner.scan_older_than(cutoff_ms).await
    }
}

fn gated_coordinator(clock: Arc<ManualClock>) -> (Arc<CacheCoordinator>, Arc<GatedStore>) {
    let mut config = retention_config(60);
    config.store.store_timeout_ms = 5_000;
    let durable = GatedStore::new();
    let cache = CacheCoordinator::with_clock(Arc::new(config), durable.clone(), clock).unwrap();
    (Arc::new(cache), durable)
}

/// Run a sweep, and while its first durable delete is held, write `values`.
async fn sweep_with_concurrent_set(
    cache: &Arc<CacheCoordinator>,
    durable: &GatedStore,
    values: &[MetricValue],
) {
    let sweeping = Arc::clone(cache);
    let sweep = tokio::spawn(async move { sweeping.sweep_once().await });

    durable.entered.notified().await;
    cache
        .set(&descriptor("cpu"), values, Duration::from_secs(30))
        .await
        .unwrap();
    durable.release.notify_one();

    sweep.await.unwrap().unwrap();
}

async fn assert_fresh_write_survived(
    cache: &CacheCoordinator,
    durable: &GatedStore,
    values: Vec<MetricValue>,
) {
    let key = descriptor("cpu").cache_key().unwrap();
    let record = durable.inner.get(&key).await.unwrap();
    assert_eq!(record.map(|r| r.meta.created_at_ms), Some(61_000));
    assert!(cache.tiers().is_volatile(&key));
    assert_eq!(cache.stats().total_entry_count, 1);
    assert_eq!(cache.get(&descriptor("cpu")).await.unwrap(), Some(values));
}

#[tokio::test]
async fn test_write_during_expiry_sweep_survives() {
    let clock = ManualClock::new(0);
    let (cache, durable) = gated_coordinator(clock.clone());

    cache
        .set(&descriptor("cpu"), &[MetricValue::new(0, 1.0)], Duration::from_secs(10))
        .await
        .unwrap();
    clock.advance(Duration::from_secs(61));

    let fresh = vec![MetricValue::new(0, 2.0)];
    sweep_with_concurrent_set(&cache, &durable, &fresh).await;

    assert_fresh_write_survived(&cache, &durable, fresh).await;
}

#[tokio::test]
async fn test_write_during_retention_sweep_survives() {
    let clock = ManualClock::new(0);
    let (cache, durable) = gated_coordinator(clock.clone());

    // Only in the durable tier, so the retention pass is the one that acts.
    let key = descriptor("cpu").cache_key().unwrap();
    durable.inner.put(&key, long_lived_record(0)).await.unwrap();
    clock.advance(Duration::from_secs(61));

    let fresh = vec![MetricValue::new(0, 2.0)];
    sweep_with_concurrent_set(&cache, &durable, &fresh).await;

    assert_fresh_write_survived(&cache, &durable, fresh).await;
}
