//! Engine configuration.
//!
//! Every knob the engine exposes lives here. Policies that pick one of
//! several behaviors are tagged enums with their numeric parameters inline,
//! resolved once when the engine is built.

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, Result};

/// What the pipeline does with near-duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupMode {
    /// Exact digest dedup only; every survivor is kept in full.
    Exact,
    /// Exact dedup, then hard removal of near-duplicate cluster members.
    Fuzzy,
    /// Exact dedup, then down-weighting of near-duplicate cluster members.
    Soft,
}

/// Unit of shingling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShingleKind {
    /// Whitespace-delimited word n-grams.
    Word,
    /// Unicode scalar n-grams.
    Char,
}

/// Shingling parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShingleConfig {
    /// Word or character n-grams
    pub kind: ShingleKind,
    /// n-gram size
    pub size: usize,
    /// Drop whitespace before building character n-grams
    pub strip_whitespace: bool,
}

impl Default for ShingleConfig {
    fn default() -> Self {
        Self {
            kind: ShingleKind::Word,
            size: 5,
            strip_whitespace: true,
        }
    }
}

/// Content digest used for exact dedup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    /// 128-bit xxh3.
    Xxh3,
    /// SHA-256 truncated to 128 bits.
    Sha256,
}

/// Storage behind the seen-digest set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum ExactBackend {
    /// Hash sets. Memory grows with unique documents, no false drops.
    Exact,
    /// Bloom filters. Fixed memory; `false_positive_rate` is the rate at
    /// which a unique document is wrongly dropped as a duplicate.
    Bloom {
        /// Number of unique documents the filters are sized for.
        expected_items: usize,
        /// Target false-positive rate at `expected_items`.
        false_positive_rate: f64,
    },
}

/// What an LSH bucket does once it reaches `bucket_cap` members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Keep the first `bucket_cap` members and ignore later ones.
    Truncate,
    /// Keep a deterministic uniform sample of everyone the bucket has seen.
    Sample,
}

/// Weight decay applied to non-representative cluster members.
///
/// `n` is the cluster size. All variants are non-increasing in `n` and
/// strictly below 1.0 for `n >= 2`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum DecayPolicy {
    /// `1 / ln(n + 1)`
    InverseLog,
    /// `1 / n`
    Inverse,
    /// `n ^ -exponent`
    Power { exponent: f64 },
    /// `exp(-rate * (n - 1))`
    Exponential { rate: f64 },
    /// A fixed weight for every duplicate, whatever the cluster size.
    Constant { weight: f64 },
}

impl DecayPolicy {
    /// Raw decay value for a cluster of `size` members (`size >= 2`).
    pub fn apply(&self, size: usize) -> f64 {
        let n = size as f64;
        match *self {
            DecayPolicy::InverseLog => 1.0 / (n + 1.0).ln(),
            DecayPolicy::Inverse => 1.0 / n,
            DecayPolicy::Power { exponent } => n.powf(-exponent),
            DecayPolicy::Exponential { rate } => (-rate * (n - 1.0)).exp(),
            DecayPolicy::Constant { weight } => weight,
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            DecayPolicy::Power { exponent } if !(exponent > 0.0 && exponent.is_finite()) => Err(
                DedupError::InvalidConfig(format!("power decay exponent must be > 0 (got {exponent})")),
            ),
            DecayPolicy::Exponential { rate } if !(rate > 0.0 && rate.is_finite()) => Err(
                DedupError::InvalidConfig(format!("exponential decay rate must be > 0 (got {rate})")),
            ),
            DecayPolicy::Constant { weight } if !(weight > 0.0 && weight < 1.0) => Err(
                DedupError::InvalidConfig(format!("constant decay weight must be in (0, 1) (got {weight})")),
            ),
            _ => Ok(()),
        }
    }
}

/// Configuration for the deduplication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Exact, fuzzy (hard removal) or soft (reweighting)
    pub mode: DedupMode,
    /// Shingling parameters
    pub shingle: ShingleConfig,
    /// Number of MinHash permutations (sketch length k)
    pub num_perm: usize,
    /// Number of LSH bands (num_perm must be divisible by num_bands)
    pub num_bands: usize,
    /// Estimated Jaccard similarity at or above which two records are near-duplicates
    pub threshold: f64,
    /// Records with fewer shingles skip fuzzy dedup and are kept in full
    pub min_shingles: usize,
    /// Weight decay for non-representative cluster members
    pub decay: DecayPolicy,
    /// Lower bound for any duplicate's weight
    pub min_weight: f64,
    /// Exact-dedup digest
    pub digest: DigestAlgorithm,
    /// Seen-digest storage
    pub exact_backend: ExactBackend,
    /// Number of digest-set shards
    pub num_shards: usize,
    /// Maximum members per LSH bucket
    pub bucket_cap: usize,
    /// What a full bucket does with new members
    pub overflow_policy: OverflowPolicy,
    /// Records per batch when the pipeline batches a stream itself
    pub batch_size: usize,
    /// Seed for the MinHash family and bucket sampling
    pub seed: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            mode: DedupMode::Soft,
            shingle: ShingleConfig::default(),
            num_perm: 128,
            num_bands: 16,
            threshold: 0.8,
            min_shingles: 3,
            decay: DecayPolicy::InverseLog,
            min_weight: 0.05,
            digest: DigestAlgorithm::Xxh3,
            exact_backend: ExactBackend::Exact,
            num_shards: 16,
            bucket_cap: 1000,
            overflow_policy: OverflowPolicy::Sample,
            batch_size: 10_000,
            seed: 0x5EED_D3D0_0DED_C0DE,
        }
    }
}

impl DedupConfig {
    /// Rows per LSH band (r = k / b).
    pub fn rows_per_band(&self) -> usize {
        self.num_perm / self.num_bands.max(1)
    }

    /// Check every parameter. Called once when an engine is built.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DedupError::InvalidConfig(msg));

        if self.shingle.size == 0 {
            return invalid("shingle size must be >= 1".into());
        }
        if self.num_perm == 0 || self.num_bands == 0 {
            return invalid("num_perm and num_bands must be >= 1".into());
        }
        if self.num_perm % self.num_bands != 0 {
            return invalid(format!(
                "num_perm ({}) must be divisible by num_bands ({})",
                self.num_perm, self.num_bands
            ));
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return invalid(format!("threshold must be in (0, 1] (got {})", self.threshold));
        }
        if !(self.min_weight > 0.0 && self.min_weight < 1.0) {
            return invalid(format!("min_weight must be in (0, 1) (got {})", self.min_weight));
        }
        self.decay.validate()?;
        if let ExactBackend::Bloom {
            expected_items,
            false_positive_rate,
        } = self.exact_backend
        {
            if expected_items == 0 {
                return invalid("bloom expected_items must be >= 1".into());
            }
            if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
                return invalid(format!(
                    "bloom false_positive_rate must be in (0, 1) (got {false_positive_rate})"
                ));
            }
        }
        if self.num_shards == 0 {
            return invalid("num_shards must be >= 1".into());
        }
        if self.bucket_cap < 2 {
            return invalid("bucket_cap must be >= 2".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be >= 1".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = DedupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rows_per_band(), 8);
    }

    #[test]
    fn rejects_uneven_band_split() {
        let config = DedupConfig {
            num_perm: 100,
            num_bands: 16,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DedupError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_bad_decay_parameters() {
        for decay in [
            DecayPolicy::Power { exponent: 0.0 },
            DecayPolicy::Exponential { rate: -1.0 },
            DecayPolicy::Constant { weight: 1.0 },
        ] {
            let config = DedupConfig {
                decay,
                ..Default::default()
            };
            assert!(config.validate().is_err(), "{decay:?} should be rejected");
        }
    }

    #[test]
    fn rejects_bad_bloom_rate() {
        let config = DedupConfig {
            exact_backend: ExactBackend::Bloom {
                expected_items: 1000,
                false_positive_rate: 0.0,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_json_with_defaults() {
        let json = r#"{
            "mode": "fuzzy",
            "num_perm": 64,
            "num_bands": 8,
            "decay": { "type": "exponential", "rate": 0.5 },
            "exact_backend": { "type": "bloom", "expected_items": 1000000, "false_positive_rate": 0.001 }
        }"#;
        let config: DedupConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mode, DedupMode::Fuzzy);
        assert_eq!(config.rows_per_band(), 8);
        assert_eq!(config.decay, DecayPolicy::Exponential { rate: 0.5 });
        assert_eq!(config.shingle, ShingleConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn decay_is_below_one_for_duplicates() {
        for decay in [
            DecayPolicy::InverseLog,
            DecayPolicy::Inverse,
            DecayPolicy::Power { exponent: 0.5 },
            DecayPolicy::Exponential { rate: 0.1 },
        ] {
            for n in 2..50 {
                let w = decay.apply(n);
                assert!(w > 0.0 && w < 1.0, "{decay:?} at n={n} gave {w}");
            }
        }
    }
}
