//! Strategy selection: maps a payload analysis to one compression strategy.
//!
//! First match wins:
//!
//! ```text
//! entropy < entropy_threshold           → Dictionary { top patterns }
//! redundancy_ratio > redundancy_thresh  → Hybrid { preprocess: true }
//! otherwise                             → Adaptive { block_size }
//! ```
//!
//! `None` is never chosen here; the coordinator forces it for payloads below
//! the compression threshold.

use tracing::trace;

use crate::cache::analyzer::PayloadAnalysis;
use crate::cache::envelope::CodecTag;
use crate::config::SelectorConfig;

/// A compression strategy for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Store the serialized bytes as-is.
    None,
    /// Substitute the given patterns with short tokens.
    Dictionary { patterns: Vec<Vec<u8>> },
    /// Optional structural pre-transform, then zstd.
    Hybrid { preprocess: bool },
    /// Fixed-size blocks compressed independently with zstd.
    Adaptive { block_size: usize },
}

impl Strategy {
    /// The codec tag recorded for payloads encoded with this strategy.
    pub fn codec(&self) -> CodecTag {
        match self {
            Strategy::None => CodecTag::None,
            Strategy::Dictionary { .. } => CodecTag::Dictionary,
            Strategy::Hybrid { .. } => CodecTag::Hybrid,
            Strategy::Adaptive { .. } => CodecTag::Adaptive,
        }
    }
}

/// The strategy selection policy.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    config: SelectorConfig,
}

impl StrategySelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    pub fn select(&self, analysis: &PayloadAnalysis) -> Strategy {
        let strategy = if analysis.entropy_bits_per_symbol < self.config.entropy_threshold {
            Strategy::Dictionary {
                patterns: analysis
                    .patterns
                    .iter()
                    .take(self.config.max_dictionary_patterns)
                    .map(|p| p.bytes.clone())
                    .collect(),
            }
        } else if analysis.redundancy_ratio > self.config.redundancy_threshold {
            Strategy::Hybrid { preprocess: true }
        } else {
            Strategy::Adaptive {
                block_size: self.config.adaptive_block_size,
            }
        };

        trace!(
            size = analysis.size,
            entropy = analysis.entropy_bits_per_symbol,
            redundancy = analysis.redundancy_ratio,
            codec = %strategy.codec(),
            "Selected strategy"
        );

        strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::analyzer::Pattern;

    fn analysis(entropy: f64, redundancy: f64, patterns: usize) -> PayloadAnalysis {
        PayloadAnalysis {
            size: 4096,
            entropy_bits_per_symbol: entropy,
            redundancy_ratio: redundancy,
            patterns: (0..patterns)
                .map(|i| Pattern {
                    bytes: format!("p{i:04}").into_bytes(),
                    occurrences: 10,
                    length: 5,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_low_entropy_selects_dictionary() {
        let selector = StrategySelector::new(SelectorConfig::default());
        match selector.select(&analysis(2.5, 0.9, 150)) {
            Strategy::Dictionary { patterns } => {
                assert_eq!(patterns.len(), 100);
                assert_eq!(patterns[0], b"p0000".to_vec());
            }
            other => panic!("expected dictionary, got {other:?}"),
        }
    }

    #[test]
    fn test_redundant_structure_selects_hybrid() {
        let selector = StrategySelector::new(SelectorConfig::default());
        assert_eq!(
            selector.select(&analysis(4.5, 0.6, 0)),
            Strategy::Hybrid { preprocess: true }
        );
    }

    #[test]
    fn test_fallthrough_selects_adaptive() {
        let selector = StrategySelector::new(SelectorConfig::default());
        assert_eq!(
            selector.select(&analysis(4.5, 0.5, 0)),
            Strategy::Adaptive { block_size: 1024 }
        );
        // Exactly at the entropy threshold is not "below".
        assert_eq!(
            selector.select(&analysis(3.0, 0.1, 5)),
            Strategy::Adaptive { block_size: 1024 }
        );
    }

    #[test]
    fn test_thresholds_are_configurable() {
        let selector = StrategySelector::new(SelectorConfig {
            entropy_threshold: 5.0,
            adaptive_block_size: 4096,
            ..SelectorConfig::default()
        });
        assert_eq!(selector.select(&analysis(4.5, 0.0, 0)).codec(), CodecTag::Dictionary);
        assert_eq!(
            selector.select(&analysis(6.0, 0.0, 0)),
            Strategy::Adaptive { block_size: 4096 }
        );
    }
}
