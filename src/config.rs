//! Runtime configuration for metrics-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache knobs (thresholds, analyzer bounds, tier capacities, timeouts,
//! sweep cadence) live here. Missing fields fall back to their defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "metrics-cache-tier", about = "Adaptive compressed metrics cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Coordinator settings.
    pub cache: CacheConfig,

    /// Payload analysis bounds.
    pub analyzer: AnalyzerConfig,

    /// Strategy selection thresholds.
    pub selector: SelectorConfig,

    /// Codec settings.
    pub compression: CompressionConfig,

    /// Tier configuration.
    pub store: StoreConfig,

    /// Volatile tier eviction weights.
    pub eviction: EvictionConfig,

    /// Background sweep settings.
    pub sweep: SweepConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Serialized payloads at or below this size are stored uncompressed.
    pub compression_threshold: usize,

    /// TTL applied when a caller does not supply one, in milliseconds.
    pub default_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 1024,
            default_ttl_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

/// Bounds for the payload analyzer's pattern scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Shortest substring length considered a pattern.
    pub min_pattern_len: usize,

    /// Longest substring length considered a pattern.
    pub max_pattern_len: usize,

    /// A pattern must occur strictly more often than this.
    pub min_occurrences: usize,

    /// A pattern's `length × occurrences` must be strictly above this.
    pub min_score: usize,

    /// Maximum number of ranked patterns kept.
    pub max_patterns: usize,

    /// Payloads larger than this only have a prefix and suffix scanned.
    pub max_scan_bytes: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_pattern_len: 3,
            max_pattern_len: 20,
            min_occurrences: 2,
            min_score: 10,
            max_patterns: 256,
            max_scan_bytes: 64 * 1024,
        }
    }
}

/// Strategy selection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// Entropy (bits per byte) below which dictionary substitution is used.
    pub entropy_threshold: f64,

    /// Structural redundancy above which the hybrid codec is used.
    pub redundancy_threshold: f64,

    /// Number of ranked patterns handed to the dictionary codec.
    pub max_dictionary_patterns: usize,

    /// Block size for the adaptive (chunked) codec.
    pub adaptive_block_size: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            entropy_threshold: 3.0,
            redundancy_threshold: 0.5,
            max_dictionary_patterns: 100,
            adaptive_block_size: 1024,
        }
    }
}

/// Codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { zstd_level: 3 }
    }
}

/// Which durable backend sits under the volatile tier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DurableBackend {
    /// In-process map; durable only for the lifetime of the process.
    Memory,
    /// One file per entry under `path`.
    Disk { path: PathBuf },
}

/// Tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Durable backend.
    pub durable: DurableBackend,

    /// Maximum number of envelopes held in the volatile tier.
    pub volatile_capacity: usize,

    /// High watermark: start eviction when volatile usage exceeds this fraction.
    pub high_watermark: f64,

    /// Low watermark: stop eviction when volatile usage drops below this fraction.
    pub low_watermark: f64,

    /// Timeout for every durable store call, in milliseconds.
    pub store_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            durable: DurableBackend::Memory,
            volatile_capacity: 10_000,
            high_watermark: 0.95,
            low_watermark: 0.80,
            store_timeout_ms: 250,
        }
    }
}

impl StoreConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Volatile tier eviction weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Weight for idle time since last access, in seconds.
    pub alpha: f64,

    /// Weight for the fraction of TTL already consumed.
    pub beta: f64,

    /// Weight for stored size, in KiB.
    pub gamma: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.3,
            gamma: 0.1,
        }
    }
}

/// Background sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps.
    pub interval_secs: u64,

    /// Hard retention window in seconds; also the upper bound on any TTL.
    pub max_retention_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_retention_secs: 24 * 60 * 60,
        }
    }
}

impl SweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_retention(&self) -> Duration {
        Duration::from_secs(self.max_retention_secs)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Reject settings that would make the analyzer or tiers misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        let a = &self.analyzer;
        if a.min_pattern_len == 0 || a.min_pattern_len > a.max_pattern_len {
            anyhow::bail!(
                "analyzer pattern length range {}..={} is empty",
                a.min_pattern_len,
                a.max_pattern_len
            );
        }
        if a.max_pattern_len > u8::MAX as usize {
            anyhow::bail!("analyzer.max_pattern_len must fit in a byte");
        }
        if self.selector.adaptive_block_size == 0 {
            anyhow::bail!("selector.adaptive_block_size must be positive");
        }
        let s = &self.store;
        if !(0.0..=1.0).contains(&s.low_watermark) || s.low_watermark > s.high_watermark {
            anyhow::bail!(
                "store watermarks must satisfy 0 <= low ({}) <= high ({})",
                s.low_watermark,
                s.high_watermark
            );
        }
        if s.store_timeout_ms == 0 {
            anyhow::bail!("store.store_timeout_ms must be positive");
        }
        if self.sweep.interval_secs == 0 {
            anyhow::bail!("sweep.interval_secs must be positive");
        }
        Ok(())
    }
}
