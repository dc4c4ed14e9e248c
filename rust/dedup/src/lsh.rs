//! LSH banding over MinHash sketches.
//!
//! A k-length sketch is cut into b bands of r rows (b·r = k). Each band is
//! hashed to a bucket key; two records sharing a key in any band become a
//! candidate pair. A pair with true similarity s collides with probability
//! \(1 - (1 - s^r)^b\), an S-curve whose knee sits near \((1/b)^{1/r}\).
//!
//! Each band owns its own bucket table, so bands are independent shards:
//! batch inserts and candidate enumeration run one rayon task per band.
//!
//! Buckets are capped. Past `bucket_cap` members a bucket either ignores
//! newcomers (`Truncate`) or keeps a deterministic reservoir sample of
//! everyone it has seen (`Sample`). Both lose recall inside that bucket in
//! exchange for bounded candidate generation.

use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use tracing::warn;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::config::{DedupConfig, OverflowPolicy};
use crate::error::{DedupError, Result};
use crate::minhash::Sketch;

/// Band/row split of a sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LshParams {
    pub bands: usize,
    pub rows: usize,
}

impl LshParams {
    /// `bands` bands of `rows` rows each; both must be >= 1.
    pub fn new(bands: usize, rows: usize) -> Result<Self> {
        if bands == 0 || rows == 0 {
            return Err(DedupError::InvalidConfig(
                "bands and rows must be >= 1".into(),
            ));
        }
        Ok(Self { bands, rows })
    }

    /// Band split from `num_perm` and `num_bands`.
    pub fn from_config(config: &DedupConfig) -> Result<Self> {
        Self::new(config.num_bands, config.rows_per_band())
    }

    /// Pick the split of `num_perm` whose threshold is closest to `threshold`.
    ///
    /// Only exact splits (b·r = num_perm) are considered.
    pub fn for_threshold(num_perm: usize, threshold: f64) -> Result<Self> {
        if num_perm == 0 {
            return Err(DedupError::InvalidConfig("num_perm must be >= 1".into()));
        }
        (1..=num_perm)
            .filter(|b| num_perm % b == 0)
            .map(|b| Self {
                bands: b,
                rows: num_perm / b,
            })
            .min_by(|a, b| {
                let da = (a.threshold() - threshold).abs();
                let db = (b.threshold() - threshold).abs();
                da.total_cmp(&db)
            })
            .ok_or_else(|| DedupError::InvalidConfig("no band split found".into()))
    }

    /// Sketch length k = b·r.
    pub fn num_perm(&self) -> usize {
        self.bands * self.rows
    }

    /// Probability that a pair with similarity `s` collides in at least one band.
    pub fn collision_probability(&self, s: f64) -> f64 {
        let s = s.clamp(0.0, 1.0);
        1.0 - (1.0 - s.powi(self.rows as i32)).powi(self.bands as i32)
    }

    /// Similarity at which the collision curve is steepest, approximately.
    pub fn threshold(&self) -> f64 {
        (1.0 / self.bands as f64).powf(1.0 / self.rows as f64)
    }
}

#[derive(Debug, Default)]
struct Bucket {
    members: Vec<u32>,
    /// Every id ever offered to this bucket, including ones not kept.
    seen: u64,
}

/// Banded bucket index over record handles.
#[derive(Debug)]
pub struct LshIndex {
    params: LshParams,
    bucket_cap: usize,
    policy: OverflowPolicy,
    seed: u64,
    tables: Vec<HashMap<u64, Bucket>>,
    len: usize,
    overflows: u64,
}

impl LshIndex {
    /// Empty index with one bucket table per band.
    pub fn new(params: LshParams, bucket_cap: usize, policy: OverflowPolicy, seed: u64) -> Self {
        Self {
            params,
            bucket_cap: bucket_cap.max(2),
            policy,
            seed,
            tables: (0..params.bands).map(|_| HashMap::new()).collect(),
            len: 0,
            overflows: 0,
        }
    }

    /// Empty index configured from `config`.
    pub fn from_config(config: &DedupConfig) -> Result<Self> {
        Ok(Self::new(
            LshParams::from_config(config)?,
            config.bucket_cap,
            config.overflow_policy,
            config.seed,
        ))
    }

    /// Bucket key of every band of `sketch`.
    pub fn band_keys(&self, sketch: &Sketch) -> Vec<u64> {
        let mut bytes = Vec::with_capacity(self.params.rows * 8);
        sketch
            .values()
            .chunks(self.params.rows)
            .take(self.params.bands)
            .enumerate()
            .map(|(band_idx, band)| {
                bytes.clear();
                for v in band {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                xxh3_64_with_seed(&bytes, band_idx as u64)
            })
            .collect()
    }

    /// Add a record to every band bucket its sketch falls into.
    pub fn insert(&mut self, id: u32, sketch: &Sketch) {
        let keys = self.band_keys(sketch);
        self.insert_keys(id, &keys);
    }

    /// Add a record by precomputed band keys.
    pub fn insert_keys(&mut self, id: u32, keys: &[u64]) {
        let (cap, policy, seed) = (self.bucket_cap, self.policy, self.seed);
        for (band_idx, (table, &key)) in self.tables.iter_mut().zip(keys).enumerate() {
            if offer(table, band_idx, key, id, cap, policy, seed) {
                self.overflows += 1;
            }
        }
        self.len += 1;
    }

    /// Add many records, one rayon task per band.
    ///
    /// Within a band, entries are applied in slice order.
    pub fn insert_batch(&mut self, entries: &[(u32, Vec<u64>)]) {
        let (cap, policy, seed) = (self.bucket_cap, self.policy, self.seed);
        let overflows: u64 = self
            .tables
            .par_iter_mut()
            .enumerate()
            .map(|(band_idx, table)| {
                entries
                    .iter()
                    .filter_map(|(id, keys)| keys.get(band_idx).map(|&key| (*id, key)))
                    .filter(|&(id, key)| offer(table, band_idx, key, id, cap, policy, seed))
                    .count() as u64
            })
            .sum();
        self.overflows += overflows;
        self.len += entries.len();
    }

    /// Ids sharing at least one band bucket with `sketch`, ascending.
    pub fn query(&self, sketch: &Sketch) -> Vec<u32> {
        let keys = self.band_keys(sketch);
        let mut candidates: HashSet<u32> = HashSet::new();
        for (table, key) in self.tables.iter().zip(&keys) {
            if let Some(bucket) = table.get(key) {
                candidates.extend(bucket.members.iter().copied());
            }
        }
        let mut v: Vec<u32> = candidates.into_iter().collect();
        v.sort_unstable();
        v
    }

    /// Query for candidates of `id`, then insert it.
    pub fn index(&mut self, id: u32, sketch: &Sketch) -> Vec<u32> {
        let mut candidates = self.query(sketch);
        candidates.retain(|&c| c != id);
        self.insert(id, sketch);
        candidates
    }

    /// Every pair of ids that share a bucket in some band, as `(low, high)`,
    /// sorted and without repeats.
    ///
    /// Cost is the sum of squared bucket sizes, bounded by the bucket cap.
    pub fn candidate_pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs: Vec<(u32, u32)> = self
            .tables
            .par_iter()
            .flat_map_iter(|table| {
                let mut band_pairs = Vec::new();
                for bucket in table.values() {
                    let m = &bucket.members;
                    for i in 0..m.len() {
                        for j in (i + 1)..m.len() {
                            if m[i] != m[j] {
                                band_pairs.push((m[i].min(m[j]), m[i].max(m[j])));
                            }
                        }
                    }
                }
                band_pairs
            })
            .collect();
        pairs.par_sort_unstable();
        pairs.dedup();
        pairs
    }

    /// Band split in use.
    pub fn params(&self) -> LshParams {
        self.params
    }

    /// Number of records inserted.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts that hit a full bucket.
    pub fn overflow_count(&self) -> u64 {
        self.overflows
    }

    /// Largest bucket across all bands.
    pub fn max_bucket_len(&self) -> usize {
        self.tables
            .iter()
            .flat_map(|t| t.values())
            .map(|b| b.members.len())
            .max()
            .unwrap_or(0)
    }
}

/// Offer `id` to the bucket at `key`. Returns true if the bucket was full.
fn offer(
    table: &mut HashMap<u64, Bucket>,
    band_idx: usize,
    key: u64,
    id: u32,
    cap: usize,
    policy: OverflowPolicy,
    seed: u64,
) -> bool {
    let bucket = table.entry(key).or_default();
    bucket.seen += 1;
    if bucket.members.len() < cap {
        bucket.members.push(id);
        return false;
    }

    if bucket.seen == cap as u64 + 1 {
        warn!(
            band = band_idx,
            bucket = key,
            cap,
            policy = ?policy,
            "LSH bucket reached capacity; candidate recall in this bucket is degraded"
        );
    }

    if policy == OverflowPolicy::Sample {
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&id.to_le_bytes());
        bytes[4..].copy_from_slice(&bucket.seen.to_le_bytes());
        let slot = xxh3_64_with_seed(&bytes, seed) % bucket.seen;
        if (slot as usize) < cap {
            bucket.members[slot as usize] = id;
        }
    }
    true
}
