//! metrics-cache-tier: adaptive compressed cache for time-series query results.
//!
//! Query results are keyed by a canonical hash of the query, analyzed, and
//! stored with whichever codec suits the payload, across a volatile
//! in-process tier and a durable tier.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod server;
pub mod storage;

pub use cache::{CacheCoordinator, CacheError, CacheStats, MetricValue, QueryDescriptor};
pub use config::Config;
