//! Query descriptors and their canonical cache keys.
//!
//! A descriptor's identity is its canonical encoding: fixed field order,
//! filters sorted by key, every string length-prefixed and every float
//! encoded by bit pattern. The encoding is injective, so two descriptors map
//! to the same key only if they are field-wise equal (filters compared as a
//! set). The key itself is a SHA-256 digest of that encoding to bound its
//! length.

use std::fmt::{self, Write as _};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cache::coordinator::CacheError;

/// Prefix shared by every key this crate produces.
const KEY_PREFIX: &str = "mq:";

/// Version tag mixed into the canonical form; bump it when the layout changes.
const CANONICAL_VERSION: u8 = 1;

/// One point of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricValue {
    /// Timestamp.
    #[serde(rename = "t")]
    pub timestamp: i64,
    /// Value.
    #[serde(rename = "v")]
    pub value: f64,
}

impl MetricValue {
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Inclusive time range of a query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }
}

/// A scalar filter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<&str> for FilterValue {
    fn from(s: &str) -> Self {
        FilterValue::Str(s.to_string())
    }
}

impl From<String> for FilterValue {
    fn from(s: String) -> Self {
        FilterValue::Str(s)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<f64> for FilterValue {
    fn from(v: f64) -> Self {
        FilterValue::Float(v)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

/// The logical identity of a cached query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    pub metric_id: String,
    pub time_range: TimeRange,
    pub aggregation: String,
    /// Filters in insertion order; compared as a set.
    #[serde(default)]
    pub filters: Vec<(String, FilterValue)>,
}

impl QueryDescriptor {
    pub fn new(
        metric_id: impl Into<String>,
        time_range: TimeRange,
        aggregation: impl Into<String>,
    ) -> Self {
        Self {
            metric_id: metric_id.into(),
            time_range,
            aggregation: aggregation.into(),
            filters: Vec::new(),
        }
    }

    /// Append a filter.
    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        self.filters.push((key.into(), value.into()));
        self
    }

    /// Canonical cache key for this descriptor.
    pub fn cache_key(&self) -> Result<CacheKey, CacheError> {
        encode(self)
    }
}

/// Opaque cache key derived from a [`QueryDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already-encoded key (e.g. one read back from durable storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encode a descriptor into its canonical cache key.
pub fn encode(descriptor: &QueryDescriptor) -> Result<CacheKey, CacheError> {
    let canonical = canonical_form(descriptor)?;
    let digest = Sha256::digest(canonical.as_bytes());

    let mut key = String::with_capacity(KEY_PREFIX.len() + digest.len() * 2);
    key.push_str(KEY_PREFIX);
    for byte in digest {
        let _ = write!(key, "{byte:02x}");
    }
    Ok(CacheKey(key))
}

/// Build the canonical, injective string form of a descriptor.
///
/// ```text
/// v1|m<len>:<metric>|t<start bits>:<end bits>|a<len>:<agg>|f<n>|<len>:<key>=<tag><value>|...
/// ```
pub fn canonical_form(descriptor: &QueryDescriptor) -> Result<String, CacheError> {
    validate(descriptor)?;

    let mut filters: Vec<&(String, FilterValue)> = descriptor.filters.iter().collect();
    filters.sort_by(|a, b| a.0.cmp(&b.0));

    let mut out = String::new();
    let _ = write!(out, "v{CANONICAL_VERSION}|");
    push_str_field(&mut out, 'm', &descriptor.metric_id);
    let _ = write!(
        out,
        "t{:016x}:{:016x}|",
        float_bits(descriptor.time_range.start),
        float_bits(descriptor.time_range.end)
    );
    push_str_field(&mut out, 'a', &descriptor.aggregation);
    let _ = write!(out, "f{}|", filters.len());

    for (key, value) in filters {
        let _ = write!(out, "{}:{}=", key.len(), key);
        match value {
            FilterValue::Bool(b) => {
                let _ = write!(out, "b{}", u8::from(*b));
            }
            FilterValue::Int(i) => {
                let _ = write!(out, "i{i}");
            }
            FilterValue::Float(f) => {
                let _ = write!(out, "f{:016x}", float_bits(*f));
            }
            FilterValue::Str(s) => {
                let _ = write!(out, "s{}:{}", s.len(), s);
            }
        }
        out.push('|');
    }

    Ok(out)
}

fn push_str_field(out: &mut String, tag: char, value: &str) {
    let _ = write!(out, "{tag}{}:{value}|", value.len());
}

/// Bit pattern of a finite float, with `-0.0` folded onto `0.0`.
fn float_bits(value: f64) -> u64 {
    if value == 0.0 {
        0.0f64.to_bits()
    } else {
        value.to_bits()
    }
}

fn validate(descriptor: &QueryDescriptor) -> Result<(), CacheError> {
    if descriptor.metric_id.is_empty() {
        return Err(CacheError::InvalidQuery("metric id is empty".to_string()));
    }
    if descriptor.aggregation.is_empty() {
        return Err(CacheError::InvalidQuery("aggregation is empty".to_string()));
    }

    let range = descriptor.time_range;
    if !range.start.is_finite() || !range.end.is_finite() {
        return Err(CacheError::InvalidQuery(format!(
            "time range {}..{} is not finite",
            range.start, range.end
        )));
    }
    if range.start > range.end {
        return Err(CacheError::InvalidQuery(format!(
            "time range start {} is after end {}",
            range.start, range.end
        )));
    }

    let mut seen = std::collections::HashSet::with_capacity(descriptor.filters.len());
    for (key, value) in &descriptor.filters {
        if !seen.insert(key.as_str()) {
            return Err(CacheError::InvalidQuery(format!("duplicate filter key {key:?}")));
        }
        if let FilterValue::Float(f) = value {
            if !f.is_finite() {
                return Err(CacheError::InvalidQuery(format!(
                    "filter {key:?} has non-finite value {f}"
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> QueryDescriptor {
        QueryDescriptor::new("cpu", TimeRange::new(0.0, 60.0), "avg")
    }

    #[test]
    fn test_key_is_stable_and_prefixed() {
        let a = encode(&cpu().with_filter("host", "a")).unwrap();
        let b = encode(&cpu().with_filter("host", "a")).unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("mq:"));
        assert_eq!(a.as_str().len(), 3 + 64);
    }

    #[test]
    fn test_filter_order_is_irrelevant() {
        let a = cpu().with_filter("host", "a").with_filter("dc", "eu");
        let b = cpu().with_filter("dc", "eu").with_filter("host", "a");
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn test_filter_value_type_matters() {
        let int = cpu().with_filter("shard", 1i64);
        let float = cpu().with_filter("shard", 1.0f64);
        let text = cpu().with_filter("shard", "1");
        let keys = [
            encode(&int).unwrap(),
            encode(&float).unwrap(),
            encode(&text).unwrap(),
        ];
        assert_ne!(keys[0], keys[1]);
        assert_ne!(keys[1], keys[2]);
        assert_ne!(keys[0], keys[2]);
    }

    #[test]
    fn test_length_prefix_prevents_field_bleed() {
        // Without length prefixes these two would concatenate identically.
        let a = QueryDescriptor::new("ab", TimeRange::new(0.0, 1.0), "c");
        let b = QueryDescriptor::new("a", TimeRange::new(0.0, 1.0), "bc");
        assert_ne!(canonical_form(&a).unwrap(), canonical_form(&b).unwrap());
    }

    #[test]
    fn test_negative_zero_matches_zero() {
        let a = QueryDescriptor::new("cpu", TimeRange::new(-0.0, 1.0), "avg");
        let b = QueryDescriptor::new("cpu", TimeRange::new(0.0, 1.0), "avg");
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }

    #[test]
    fn test_rejects_malformed_descriptors() {
        let nan = QueryDescriptor::new("cpu", TimeRange::new(f64::NAN, 1.0), "avg");
        assert!(matches!(encode(&nan), Err(CacheError::InvalidQuery(_))));

        let inf = QueryDescriptor::new("cpu", TimeRange::new(0.0, f64::INFINITY), "avg");
        assert!(matches!(encode(&inf), Err(CacheError::InvalidQuery(_))));

        let backwards = QueryDescriptor::new("cpu", TimeRange::new(10.0, 1.0), "avg");
        assert!(matches!(encode(&backwards), Err(CacheError::InvalidQuery(_))));

        let dup = cpu().with_filter("host", "a").with_filter("host", "b");
        assert!(matches!(encode(&dup), Err(CacheError::InvalidQuery(_))));

        let empty = QueryDescriptor::new("", TimeRange::new(0.0, 1.0), "avg");
        assert!(matches!(encode(&empty), Err(CacheError::InvalidQuery(_))));
    }

    #[test]
    fn test_metric_value_wire_names() {
        let json = serde_json::to_string(&MetricValue::new(30, 1.5)).unwrap();
        assert_eq!(json, r#"{"t":30,"v":1.5}"#);
    }
}
