//! Payload analysis: entropy, repeated substrings and structural redundancy.
//!
//! The analyzer is pure. It looks at the serialized bytes (entropy, pattern
//! inventory) and at the value tree they were serialized from (nesting depth,
//! keys repeated across sibling objects, arrays of same-shaped elements). The
//! selector turns the result into a compression strategy.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::Value;

use crate::config::AnalyzerConfig;

/// A repeated substring of the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub bytes: Vec<u8>,
    pub occurrences: usize,
    pub length: usize,
}

impl Pattern {
    /// Ranking score: bytes covered if every occurrence were replaced.
    pub fn score(&self) -> usize {
        self.length * self.occurrences
    }
}

/// An array whose elements share a repeating shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayPattern {
    /// JSON-pointer-like path to the array, e.g. `/series/0/points`.
    pub path: String,
    pub length: usize,
    /// Share of elements that have the most common shape.
    pub repetition_factor: f64,
}

/// Result of analyzing one payload.
#[derive(Debug, Clone, Default)]
pub struct PayloadAnalysis {
    pub size: usize,
    pub entropy_bits_per_symbol: f64,
    /// Sorted by score descending.
    pub patterns: Vec<Pattern>,
    pub depth: u32,
    pub repeating_keys: BTreeSet<String>,
    pub array_patterns: Vec<ArrayPattern>,
    /// Fraction of payload bytes taken by redundant copies of repeating keys.
    pub redundancy_ratio: f64,
    /// Whether the pattern scan only covered a prefix and suffix.
    pub sampled: bool,
}

/// Computes a [`PayloadAnalysis`] for serialized payloads.
#[derive(Debug, Clone)]
pub struct PayloadAnalyzer {
    config: AnalyzerConfig,
}

impl PayloadAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze `bytes`, which are the serialization of `tree`.
    pub fn analyze(&self, bytes: &[u8], tree: &Value) -> PayloadAnalysis {
        let (patterns, sampled) = self.find_patterns(bytes);

        let mut walk = StructureWalk::default();
        let depth = walk.visit(tree, String::new());

        let redundant_key_bytes: usize = walk
            .key_occurrences
            .iter()
            .filter(|(key, _)| walk.repeating_keys.contains(*key))
            .map(|(key, &count)| count.saturating_sub(1) * (key.len() + 3))
            .sum();
        let redundancy_ratio = if bytes.is_empty() {
            0.0
        } else {
            (redundant_key_bytes as f64 / bytes.len() as f64).min(1.0)
        };

        PayloadAnalysis {
            size: bytes.len(),
            entropy_bits_per_symbol: shannon_entropy(bytes),
            patterns,
            depth,
            repeating_keys: walk.repeating_keys,
            array_patterns: walk.array_patterns,
            redundancy_ratio,
            sampled,
        }
    }

    /// Analyze raw bytes, recovering the value tree when they are JSON.
    pub fn analyze_bytes(&self, bytes: &[u8]) -> PayloadAnalysis {
        let tree = serde_json::from_slice(bytes).unwrap_or(Value::Null);
        self.analyze(bytes, &tree)
    }

    /// Sliding-window substring census over the configured length range.
    fn find_patterns(&self, bytes: &[u8]) -> (Vec<Pattern>, bool) {
        let cfg = &self.config;
        let sampled = bytes.len() > cfg.max_scan_bytes;

        // Large payloads: scan a prefix and a suffix of half the budget each.
        let regions: Vec<&[u8]> = if sampled {
            let half = cfg.max_scan_bytes / 2;
            vec![&bytes[..half], &bytes[bytes.len() - half..]]
        } else {
            vec![bytes]
        };

        let mut patterns = Vec::new();
        for len in cfg.min_pattern_len..=cfg.max_pattern_len {
            let mut counts: HashMap<&[u8], usize> = HashMap::new();
            for region in &regions {
                if region.len() < len {
                    continue;
                }
                for window in region.windows(len) {
                    *counts.entry(window).or_insert(0) += 1;
                }
            }

            patterns.extend(
                counts
                    .into_iter()
                    .filter(|&(_, count)| count > cfg.min_occurrences && len * count > cfg.min_score)
                    .map(|(window, count)| Pattern {
                        bytes: window.to_vec(),
                        occurrences: count,
                        length: len,
                    }),
            );
        }

        patterns.sort_by(|a, b| {
            b.score()
                .cmp(&a.score())
                .then_with(|| b.length.cmp(&a.length))
                .then_with(|| a.bytes.cmp(&b.bytes))
        });
        patterns.truncate(cfg.max_patterns);

        (patterns, sampled)
    }
}

/// Shannon entropy of the byte distribution, in bits per byte.
pub fn shannon_entropy(bytes: &[u8]) -> f64 {
    if bytes.is_empty() {
        return 0.0;
    }

    let mut freq = [0usize; 256];
    for &b in bytes {
        freq[b as usize] += 1;
    }

    let total = bytes.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Accumulates structural facts while walking a value tree.
#[derive(Default)]
struct StructureWalk {
    key_occurrences: BTreeMap<String, usize>,
    repeating_keys: BTreeSet<String>,
    array_patterns: Vec<ArrayPattern>,
}

impl StructureWalk {
    /// Returns the depth of `value` (scalars are 0).
    fn visit(&mut self, value: &Value, path: String) -> u32 {
        match value {
            Value::Object(map) => {
                for key in map.keys() {
                    *self.key_occurrences.entry(key.clone()).or_insert(0) += 1;
                }
                self.note_sibling_keys(map.values());
                let child_depth = map
                    .iter()
                    .map(|(key, child)| self.visit(child, format!("{path}/{key}")))
                    .max()
                    .unwrap_or(0);
                child_depth + 1
            }
            Value::Array(items) => {
                self.note_sibling_keys(items.iter());
                self.note_array_shape(items, &path);
                let child_depth = items
                    .iter()
                    .enumerate()
                    .map(|(i, child)| self.visit(child, format!("{path}/{i}")))
                    .max()
                    .unwrap_or(0);
                child_depth + 1
            }
            _ => 0,
        }
    }

    /// Keys that appear in two or more sibling objects.
    fn note_sibling_keys<'a>(&mut self, siblings: impl Iterator<Item = &'a Value>) {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for sibling in siblings {
            if let Value::Object(map) = sibling {
                for key in map.keys() {
                    *seen.entry(key.as_str()).or_insert(0) += 1;
                }
            }
        }
        for (key, count) in seen {
            if count >= 2 {
                self.repeating_keys.insert(key.to_string());
            }
        }
    }

    fn note_array_shape(&mut self, items: &[Value], path: &str) {
        if items.len() < 2 {
            return;
        }

        let mut shapes: HashMap<String, usize> = HashMap::new();
        for item in items {
            *shapes.entry(shape_of(item)).or_insert(0) += 1;
        }

        let most_common = shapes.values().copied().max().unwrap_or(0);
        if most_common > 1 {
            self.array_patterns.push(ArrayPattern {
                path: if path.is_empty() { "/".to_string() } else { path.to_string() },
                length: items.len(),
                repetition_factor: most_common as f64 / items.len() as f64,
            });
        }
    }
}

/// One-level shape signature of a value: its type, plus sorted keys for objects.
fn shape_of(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(items) => format!("array[{}]", items.len()),
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object{{{}}}", keys.join(","))
        }
    }
}
