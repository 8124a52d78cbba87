//! Adaptive compressed metrics cache.
//!
//! This module contains the cache pipeline and its supporting types:
//! - [`query`]: QueryDescriptor, MetricValue, canonical CacheKey encoding
//! - [`analyzer`]: Payload entropy, repeated patterns, JSON structure
//! - [`selector`]: Maps an analysis to a compression Strategy
//! - [`compressor`]: Dictionary, hybrid and adaptive-block codecs over zstd
//! - [`envelope`]: Stored envelope and codec tag
//! - [`store`]: Volatile tier in front of a durable tier
//! - [`evictor`]: Volatile-tier eviction scoring
//! - [`coordinator`]: Public get/set/invalidate facade and stats
//! - [`sweeper`]: Periodic retention and TTL purge
//! - [`clock`]: Wall and manual clocks

pub mod analyzer;
pub mod clock;
pub mod compressor;
pub mod coordinator;
pub mod envelope;
pub mod evictor;
pub mod query;
pub mod selector;
pub mod store;
pub mod sweeper;

pub use coordinator::{CacheCoordinator, CacheError, CacheStats};
pub use query::{CacheKey, FilterValue, MetricValue, QueryDescriptor, TimeRange};
