//! MinHash sketches.
//!
//! A sketch keeps, for each of k seeded hash functions, the minimum hash
//! over a record's shingles. The fraction of positions on which two
//! sketches agree is an unbiased estimate of the Jaccard similarity of the
//! underlying shingle sets; its variance shrinks as k grows.
//!
//! Records with too few shingles produce unreliable estimates, so they are
//! reported as [`SketchOutcome::Degenerate`] instead of being sketched.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::DedupConfig;
use crate::shingle::Shingler;

/// A fixed-length MinHash sketch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sketch {
    values: Vec<u64>,
}

impl Sketch {
    /// Wrap raw minimum values.
    pub fn new(values: Vec<u64>) -> Self {
        Self { values }
    }

    /// Per-function minima.
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// Number of hash functions (k).
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Estimated Jaccard similarity, always in [0, 1].
    pub fn similarity(&self, other: &Sketch) -> f64 {
        similarity_estimate(self, other)
    }
}

/// Fraction of positions where the two sketches agree.
///
/// Sketches of different length (different engines) are not comparable
/// and score 0.0, as do empty sketches.
pub fn similarity_estimate(a: &Sketch, b: &Sketch) -> f64 {
    if a.values.len() != b.values.len() || a.values.is_empty() {
        return 0.0;
    }
    let matches = a
        .values
        .iter()
        .zip(b.values.iter())
        .filter(|(x, y)| x == y)
        .count();
    matches as f64 / a.values.len() as f64
}

/// Result of sketching one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SketchOutcome {
    Sketch(Sketch),
    /// Fewer shingles than the configured floor; the record bypasses fuzzy dedup.
    Degenerate { shingles: usize },
}

/// MinHash sketch generator.
#[derive(Debug, Clone)]
pub struct MinHashSketcher {
    shingler: Shingler,
    /// One seed per simulated permutation
    seeds: Vec<u64>,
    min_shingles: usize,
}

impl MinHashSketcher {
    /// Sketcher with `num_perm` hash functions seeded from `seed`.
    pub fn new(shingler: Shingler, num_perm: usize, seed: u64, min_shingles: usize) -> Self {
        let mut state = seed;
        let seeds = (0..num_perm).map(|_| splitmix64(&mut state)).collect();
        Self {
            shingler,
            seeds,
            min_shingles,
        }
    }

    /// Sketcher configured from `config`.
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(
            Shingler::new(config.shingle.clone()),
            config.num_perm,
            config.seed,
            config.min_shingles,
        )
    }

    /// Shingle and sketch a normalized text.
    pub fn sketch(&self, text: &str) -> SketchOutcome {
        let shingles = self.shingler.shingles(text);
        if shingles.len() < self.min_shingles.max(1) {
            return SketchOutcome::Degenerate {
                shingles: shingles.len(),
            };
        }
        SketchOutcome::Sketch(self.sketch_shingles(&shingles))
    }

    /// Sketch a precomputed shingle set.
    ///
    /// For each "permutation" (simulated via different hash seeds), the
    /// value is the minimum hash over all shingles. An empty set yields a
    /// sketch of `u64::MAX`.
    pub fn sketch_shingles(&self, shingles: &HashSet<u64>) -> Sketch {
        let mut mins = vec![u64::MAX; self.seeds.len()];
        for shingle in shingles {
            let bytes = shingle.to_le_bytes();
            for (min, &seed) in mins.iter_mut().zip(&self.seeds) {
                let h = xxh3_64_with_seed(&bytes, seed);
                if h < *min {
                    *min = h;
                }
            }
        }
        Sketch::new(mins)
    }

    /// Sketch many texts in parallel, preserving order.
    pub fn sketch_batch(&self, texts: &[&str]) -> Vec<SketchOutcome> {
        texts.par_iter().map(|text| self.sketch(text)).collect()
    }

    /// Sketch length k.
    pub fn num_perm(&self) -> usize {
        self.seeds.len()
    }

    /// Shingler feeding the sketches.
    pub fn shingler(&self) -> &Shingler {
        &self.shingler
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ShingleConfig, ShingleKind};
    use crate::shingle::exact_jaccard;

    fn sketcher(num_perm: usize) -> MinHashSketcher {
        let shingler = Shingler::new(ShingleConfig {
            kind: ShingleKind::Char,
            size: 3,
            strip_whitespace: true,
        });
        MinHashSketcher::new(shingler, num_perm, 7, 3)
    }

    #[test]
    fn test_similarity_of_sketch_with_itself_is_one() {
        let s = sketcher(64);
        let SketchOutcome::Sketch(a) = s.sketch("the quick brown fox jumps over the lazy dog") else {
            panic!("expected a sketch");
        };
        assert_eq!(similarity_estimate(&a, &a), 1.0);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_similarity_is_bounded() {
        let s = sketcher(64);
        let texts = [
            "machine learning algorithms for natural language processing",
            "gardening tips for growing roses and maintaining a lawn",
            "machine learning algorithms for natural language processing tasks",
        ];
        let sketches: Vec<Sketch> = texts
            .iter()
            .map(|t| match s.sketch(t) {
                SketchOutcome::Sketch(sk) => sk,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        for a in &sketches {
            for b in &sketches {
                let sim = similarity_estimate(a, b);
                assert!((0.0..=1.0).contains(&sim));
            }
        }
        assert!(similarity_estimate(&sketches[0], &sketches[2]) > 0.5);
        assert!(similarity_estimate(&sketches[0], &sketches[1]) < 0.5);
    }

    #[test]
    fn test_identical_shingle_sets_have_similarity_one_for_any_k() {
        let set: HashSet<u64> = (0..40).map(|i| i * 7919).collect();
        let copy = set.clone();
        assert_eq!(exact_jaccard(&set, &copy), 1.0);
        for k in [1, 16, 128, 333] {
            let s = sketcher(k);
            assert_eq!(similarity_estimate(&s.sketch_shingles(&set), &s.sketch_shingles(&copy)), 1.0);
        }
    }

    #[test]
    fn test_estimate_tracks_true_jaccard() {
        let s = sketcher(512);
        let a: HashSet<u64> = (0..100).collect();
        let b: HashSet<u64> = (50..150).collect();
        let truth = exact_jaccard(&a, &b);
        let est = similarity_estimate(&s.sketch_shingles(&a), &s.sketch_shingles(&b));
        assert!((est - truth).abs() < 0.1, "estimate {est} vs truth {truth}");
    }

    #[test]
    fn test_short_text_is_degenerate() {
        let s = sketcher(16);
        // "ab" with n=3 collapses to a single shingle
        assert_eq!(s.sketch("ab"), SketchOutcome::Degenerate { shingles: 1 });
        assert_eq!(s.sketch(""), SketchOutcome::Degenerate { shingles: 0 });
    }

    #[test]
    fn test_mismatched_lengths_are_not_comparable() {
        let a = Sketch::new(vec![1, 2, 3]);
        let b = Sketch::new(vec![1, 2]);
        assert_eq!(similarity_estimate(&a, &b), 0.0);
        assert_eq!(similarity_estimate(&Sketch::new(vec![]), &Sketch::new(vec![])), 0.0);
    }

    #[test]
    fn test_same_seed_same_sketch() {
        let text = "deterministic sketches across engine instances";
        assert_eq!(sketcher(32).sketch(text), sketcher(32).sketch(text));
    }

    #[test]
    fn test_batch_preserves_order() {
        let s = sketcher(32);
        let texts = ["first document text", "second document text", "xy"];
        let batch = s.sketch_batch(&texts);
        for (text, outcome) in texts.iter().zip(&batch) {
            assert_eq!(&s.sketch(text), outcome);
        }
    }
}
