//! Eviction policy: decides which envelopes leave the volatile tier.
//!
//! Evicted envelopes stay in the durable tier and are promoted again on the
//! next read. Uses a weighted scoring function combining:
//! - Time since last access (idle → evictable)
//! - Fraction of TTL already consumed (about to expire → evictable)
//! - Stored size (large → evictable, frees more memory)

use std::collections::BinaryHeap;

use crate::cache::envelope::EnvelopeMeta;
use crate::cache::query::CacheKey;
use crate::config::EvictionConfig;

/// An eviction candidate with its computed priority score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub score: f64,
}

// Higher score = higher eviction priority (should be evicted first).
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// What the evictor needs to know about one volatile entry.
#[derive(Debug, Clone, Copy)]
pub struct EntryUsage {
    pub meta: EnvelopeMeta,
    pub last_access_ms: u64,
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    config: EvictionConfig,
}

impl Evictor {
    pub fn new(config: EvictionConfig) -> Self {
        Self { config }
    }

    /// Compute eviction priority for a single entry.
    ///
    /// ```text
    /// eviction_priority(entry) =
    ///     α × idle_secs +
    ///     β × ttl_consumed +
    ///     γ × stored_kib
    /// ```
    pub fn compute_priority(&self, usage: &EntryUsage, now_ms: u64) -> f64 {
        let idle_secs = now_ms.saturating_sub(usage.last_access_ms) as f64 / 1000.0;
        let ttl_consumed = usage.meta.ttl_consumed(now_ms);
        let stored_kib = usage.meta.stored_size as f64 / 1024.0;

        self.config.alpha * idle_secs + self.config.beta * ttl_consumed + self.config.gamma * stored_kib
    }

    /// Select up to `count` entries to evict, highest priority first.
    pub fn select_victims(
        &self,
        entries: impl Iterator<Item = (CacheKey, EntryUsage)>,
        count: usize,
        now_ms: u64,
    ) -> Vec<EvictionCandidate> {
        if count == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<EvictionCandidate> = entries
            .map(|(key, usage)| EvictionCandidate {
                score: self.compute_priority(&usage, now_ms),
                key,
            })
            .collect();

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::envelope::CodecTag;

    fn usage(last_access_ms: u64, stored_size: u64) -> EntryUsage {
        EntryUsage {
            meta: EnvelopeMeta {
                compressed: false,
                codec: CodecTag::None,
                original_size: stored_size,
                stored_size,
                created_at_ms: 0,
                ttl_ms: 60_000,
            },
            last_access_ms,
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_raw(name)
    }

    #[test]
    fn test_eviction_prefers_idle_entries() {
        let evictor = Evictor::new(EvictionConfig::default());
        let entries = vec![
            (key("fresh"), usage(9_000, 1024)),
            (key("idle"), usage(0, 1024)),
            (key("warm"), usage(5_000, 1024)),
        ];

        let victims = evictor.select_victims(entries.into_iter(), 1, 10_000);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].key, key("idle"));
    }

    #[test]
    fn test_size_breaks_ties() {
        let evictor = Evictor::new(EvictionConfig::default());
        let entries = vec![
            (key("small"), usage(0, 10)),
            (key("large"), usage(0, 1 << 20)),
        ];

        let victims = evictor.select_victims(entries.into_iter(), 2, 1_000);
        assert_eq!(victims[0].key, key("large"));
        assert_eq!(victims[1].key, key("small"));
    }

    #[test]
    fn test_zero_count_selects_nothing() {
        let evictor = Evictor::new(EvictionConfig::default());
        let entries = vec![(key("a"), usage(0, 10))];
        assert!(evictor.select_victims(entries.into_iter(), 0, 1_000).is_empty());
    }
}
