//! Exact deduplication by content digest.
//!
//! The first record with a given digest wins; every later record with the
//! same digest is a duplicate and skips the fuzzy stages entirely.
//!
//! The seen set is split into shards by digest. Equal digests always land
//! in the same shard, so a batch can be checked with one worker per shard,
//! each walking its records in ingestion order, without changing which
//! record counts as "first".

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::collections::HashSet;
use xxhash_rust::xxh3::xxh3_128;

use crate::config::{DedupConfig, DigestAlgorithm, ExactBackend};
use crate::record::Record;

/// 128-bit content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hi: u64,
    pub lo: u64,
}

impl Digest {
    /// Digest `text` with the given algorithm.
    pub fn of(text: &str, algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Xxh3 => Self::from_u128(xxh3_128(text.as_bytes())),
            DigestAlgorithm::Sha256 => {
                let hash = Sha256::digest(text.as_bytes());
                let mut bytes = [0u8; 16];
                bytes.copy_from_slice(&hash[..16]);
                Self::from_u128(u128::from_be_bytes(bytes))
            }
        }
    }

    fn from_u128(v: u128) -> Self {
        Self {
            hi: (v >> 64) as u64,
            lo: v as u64,
        }
    }

    fn shard(&self, num_shards: usize) -> usize {
        (self.lo % num_shards as u64) as usize
    }
}

/// Fixed-size bloom filter over digests.
///
/// Digests are already uniformly distributed, so the probe positions come
/// straight from their two halves (double hashing).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u64>,
    num_hashes: u32,
}

impl BloomFilter {
    /// Size a filter for `expected_items` at the given false-positive rate.
    pub fn with_rate(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil().max(64.0);
        let num_hashes = ((num_bits / n) * ln2).round().clamp(1.0, 32.0) as u32;
        let words = (num_bits as usize).div_ceil(64);
        Self {
            bits: vec![0u64; words],
            num_hashes,
        }
    }

    /// Set the probe bits of `digest`.
    pub fn insert(&mut self, digest: &Digest) {
        for bit in self.probes(digest) {
            self.bits[bit / 64] |= 1u64 << (bit % 64);
        }
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn may_contain(&self, digest: &Digest) -> bool {
        self.probes(digest)
            .all(|bit| self.bits[bit / 64] & (1u64 << (bit % 64)) != 0)
    }

    /// Probes per digest.
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    fn probes(&self, digest: &Digest) -> impl Iterator<Item = usize> {
        let num_bits = (self.bits.len() * 64) as u64;
        let h1 = digest.lo;
        let h2 = digest.hi | 1;
        (0..self.num_hashes as u64)
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % num_bits) as usize)
    }

    fn clear(&mut self) {
        self.bits.iter_mut().for_each(|w| *w = 0);
    }
}

/// One shard of the seen-digest set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum DigestShard {
    Exact(HashSet<Digest>),
    Bloom(BloomFilter),
}

impl DigestShard {
    fn contains(&self, digest: &Digest) -> bool {
        match self {
            DigestShard::Exact(set) => set.contains(digest),
            DigestShard::Bloom(filter) => filter.may_contain(digest),
        }
    }

    fn insert(&mut self, digest: Digest) {
        match self {
            DigestShard::Exact(set) => {
                set.insert(digest);
            }
            DigestShard::Bloom(filter) => filter.insert(&digest),
        }
    }

    fn clear(&mut self) {
        match self {
            DigestShard::Exact(set) => set.clear(),
            DigestShard::Bloom(filter) => filter.clear(),
        }
    }
}

/// Result of checking a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExactCheck {
    pub duplicate: bool,
    pub digest: Digest,
}

/// Outcome of a read-only batch check.
///
/// `duplicate[i]` answers for the i-th digest passed in. The unseen digests
/// are held per shard until [`ExactDeduper::commit`] registers them;
/// dropping the value discards them.
#[derive(Debug, Default)]
pub struct StagedDigests {
    pub duplicate: Vec<bool>,
    fresh: Vec<Vec<Digest>>,
}

impl StagedDigests {
    /// Number of digests this batch would register.
    pub fn fresh_count(&self) -> usize {
        self.fresh.iter().map(Vec::len).sum()
    }
}

/// Seen-digest set with first-occurrence-wins semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExactDeduper {
    algorithm: DigestAlgorithm,
    shards: Vec<DigestShard>,
    registered: usize,
}

impl ExactDeduper {
    /// Empty seen-set split into `num_shards` shards of the given backend.
    pub fn new(algorithm: DigestAlgorithm, backend: ExactBackend, num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        let shards = (0..num_shards)
            .map(|_| match backend {
                ExactBackend::Exact => DigestShard::Exact(HashSet::new()),
                ExactBackend::Bloom {
                    expected_items,
                    false_positive_rate,
                } => DigestShard::Bloom(BloomFilter::with_rate(
                    expected_items.div_ceil(num_shards),
                    false_positive_rate,
                )),
            })
            .collect();
        Self {
            algorithm,
            shards,
            registered: 0,
        }
    }

    /// Seen-set configured from `config`.
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.digest, config.exact_backend, config.num_shards)
    }

    /// Digest `text` with this deduper's algorithm.
    pub fn digest(&self, text: &str) -> Digest {
        Digest::of(text, self.algorithm)
    }

    /// Check one record and register its digest if unseen.
    pub fn check(&mut self, record: &Record) -> ExactCheck {
        let digest = self.digest(&record.text);
        let idx = digest.shard(self.shards.len());
        let shard = &mut self.shards[idx];
        let duplicate = shard.contains(&digest);
        if !duplicate {
            shard.insert(digest);
            self.registered += 1;
        }
        ExactCheck { duplicate, digest }
    }

    /// Check a batch of digests in ingestion order without mutating the set.
    ///
    /// Duplicates within the batch are detected too: the earliest occurrence
    /// is fresh, later ones are duplicates.
    pub fn check_batch(&self, digests: &[Digest]) -> StagedDigests {
        let num_shards = self.shards.len();
        let mut by_shard: Vec<Vec<usize>> = vec![Vec::new(); num_shards];
        for (i, d) in digests.iter().enumerate() {
            by_shard[d.shard(num_shards)].push(i);
        }

        let per_shard: Vec<(Vec<usize>, Vec<Digest>)> = by_shard
            .par_iter()
            .enumerate()
            .map(|(shard_idx, indices)| {
                let shard = &self.shards[shard_idx];
                let mut local: HashSet<Digest> = HashSet::with_capacity(indices.len());
                let mut dups = Vec::new();
                let mut fresh = Vec::new();
                for &i in indices {
                    let d = digests[i];
                    if shard.contains(&d) || !local.insert(d) {
                        dups.push(i);
                    } else {
                        fresh.push(d);
                    }
                }
                (dups, fresh)
            })
            .collect();

        let mut duplicate = vec![false; digests.len()];
        let mut fresh = Vec::with_capacity(num_shards);
        for (dups, shard_fresh) in per_shard {
            for i in dups {
                duplicate[i] = true;
            }
            fresh.push(shard_fresh);
        }
        StagedDigests { duplicate, fresh }
    }

    /// Register the unseen digests of a checked batch.
    pub fn commit(&mut self, staged: StagedDigests) {
        let added = staged.fresh_count();
        self.shards
            .par_iter_mut()
            .zip(staged.fresh.into_par_iter())
            .for_each(|(shard, fresh)| {
                for d in fresh {
                    shard.insert(d);
                }
            });
        self.registered += added;
    }

    /// Forget every digest.
    pub fn reset(&mut self) {
        self.shards.iter_mut().for_each(DigestShard::clear);
        self.registered = 0;
    }

    /// Number of digests registered so far.
    pub fn len(&self) -> usize {
        self.registered
    }

    pub fn is_empty(&self) -> bool {
        self.registered == 0
    }

    /// Digest algorithm in use.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Number of shards.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Whether the shards are bloom filters.
    pub(crate) fn is_bloom(&self) -> bool {
        matches!(self.shards.first(), Some(DigestShard::Bloom(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact() -> ExactDeduper {
        ExactDeduper::new(DigestAlgorithm::Xxh3, ExactBackend::Exact, 4)
    }

    #[test]
    fn test_second_occurrence_is_duplicate() {
        let mut dedup = exact();
        let a = Record::new("1", "the same normalized text");
        let b = Record::new("2", "the same normalized text");
        assert!(!dedup.check(&a).duplicate);
        assert!(dedup.check(&b).duplicate);
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn test_sha256_digest_is_stable_and_distinct() {
        let a = Digest::of("alpha", DigestAlgorithm::Sha256);
        assert_eq!(a, Digest::of("alpha", DigestAlgorithm::Sha256));
        assert_ne!(a, Digest::of("beta", DigestAlgorithm::Sha256));
        assert_ne!(a, Digest::of("alpha", DigestAlgorithm::Xxh3));
    }

    #[test]
    fn test_batch_check_keeps_first_occurrence() {
        let mut dedup = exact();
        dedup.check(&Record::new("0", "seen before"));

        let texts = ["x", "seen before", "y", "x", "z", "y"];
        let digests: Vec<Digest> = texts.iter().map(|t| dedup.digest(t)).collect();
        let staged = dedup.check_batch(&digests);
        assert_eq!(staged.duplicate, vec![false, true, false, true, false, true]);
        assert_eq!(staged.fresh_count(), 3);

        dedup.commit(staged);
        assert_eq!(dedup.len(), 4);
        assert!(dedup.check(&Record::new("9", "z")).duplicate);
    }

    #[test]
    fn test_dropping_staged_batch_changes_nothing() {
        let dedup = exact();
        let before = dedup.clone();
        let digests = vec![dedup.digest("a"), dedup.digest("b")];
        let staged = dedup.check_batch(&digests);
        drop(staged);
        assert_eq!(dedup, before);
    }

    #[test]
    fn test_bloom_backend_never_misses_a_duplicate() {
        let mut dedup = ExactDeduper::new(
            DigestAlgorithm::Xxh3,
            ExactBackend::Bloom {
                expected_items: 2_000,
                false_positive_rate: 0.01,
            },
            4,
        );
        for i in 0..1_000 {
            dedup.check(&Record::new(i.to_string(), format!("document number {i}")));
        }
        for i in 0..1_000 {
            let again = Record::new(format!("again-{i}"), format!("document number {i}"));
            assert!(dedup.check(&again).duplicate);
        }
    }

    #[test]
    fn test_bloom_false_positive_rate_is_bounded() {
        let mut filter = BloomFilter::with_rate(10_000, 0.01);
        for i in 0..10_000 {
            filter.insert(&Digest::of(&format!("in-{i}"), DigestAlgorithm::Xxh3));
        }
        let false_hits = (0..10_000)
            .filter(|i| filter.may_contain(&Digest::of(&format!("out-{i}"), DigestAlgorithm::Xxh3)))
            .count();
        // 1% target; allow generous slack
        assert!(false_hits < 300, "false positives: {false_hits}");
    }

    #[test]
    fn test_reset_forgets_digests() {
        let mut dedup = exact();
        let r = Record::new("1", "text");
        dedup.check(&r);
        dedup.reset();
        assert!(dedup.is_empty());
        assert!(!dedup.check(&r).duplicate);
    }
}
