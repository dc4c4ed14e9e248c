//! Near-duplicate clustering.
//!
//! Candidate pairs from LSH are confirmed against the full sketches; pairs
//! at or above the similarity threshold become edges, and a union-find
//! structure turns the edges into disjoint clusters.
//!
//! Handles are assigned in ingestion order, so "earliest record" is simply
//! the smallest handle. Every root remembers the smallest handle of its
//! set, and that handle is the cluster representative regardless of which
//! node union-by-size happens to pick as the root.

use rayon::prelude::*;
use tracing::debug;

use crate::minhash::{similarity_estimate, Sketch};

/// Disjoint sets over dense `u32` handles.
#[derive(Debug, Clone, Default)]
pub struct UnionFind {
    parent: Vec<u32>,
    size: Vec<u32>,
    earliest: Vec<u32>,
}

impl UnionFind {
    /// `n` singleton sets, handles `0..n`.
    pub fn new(n: usize) -> Self {
        let mut uf = Self::default();
        uf.grow(n);
        uf
    }

    /// Add singleton sets until there are `n` handles.
    pub fn grow(&mut self, n: usize) {
        for h in self.parent.len()..n {
            self.parent.push(h as u32);
            self.size.push(1);
            self.earliest.push(h as u32);
        }
    }

    /// Number of handles tracked.
    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Internal root of `a`, with path halving.
    fn root(&mut self, mut a: u32) -> u32 {
        while self.parent[a as usize] != a {
            let grandparent = self.parent[self.parent[a as usize] as usize];
            self.parent[a as usize] = grandparent;
            a = grandparent;
        }
        a
    }

    /// Representative of `a`'s cluster: its earliest member.
    pub fn find(&mut self, a: u32) -> u32 {
        let r = self.root(a);
        self.earliest[r as usize]
    }

    /// Merge the clusters of `a` and `b`. Returns false if already merged.
    pub fn union(&mut self, a: u32, b: u32) -> bool {
        let (ra, rb) = (self.root(a), self.root(b));
        if ra == rb {
            return false;
        }
        let (big, small) = if self.size[ra as usize] >= self.size[rb as usize] {
            (ra, rb)
        } else {
            (rb, ra)
        };
        self.parent[small as usize] = big;
        self.size[big as usize] += self.size[small as usize];
        self.earliest[big as usize] = self.earliest[big as usize].min(self.earliest[small as usize]);
        true
    }

    /// Number of members in `a`'s cluster.
    pub fn cluster_size(&mut self, a: u32) -> usize {
        let r = self.root(a);
        self.size[r as usize] as usize
    }
}

/// One duplicate cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Earliest member
    pub representative: u32,
    /// All members, ascending; includes the representative
    pub members: Vec<u32>,
}

impl Cluster {
    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A partition of all handles into clusters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clustering {
    clusters: Vec<Cluster>,
    cluster_of: Vec<usize>,
}

impl Clustering {
    /// Clusters ordered by representative.
    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// The cluster containing handle `h`.
    pub fn cluster_of(&self, h: u32) -> &Cluster {
        &self.clusters[self.cluster_of[h as usize]]
    }

    /// Number of clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

/// Confirms candidate pairs and groups them into clusters.
#[derive(Debug)]
pub struct SimilarityClusterer {
    threshold: f64,
    sets: UnionFind,
    confirmed: usize,
}

impl SimilarityClusterer {
    /// Clusterer over handles `0..num_records`.
    pub fn new(threshold: f64, num_records: usize) -> Self {
        Self {
            threshold,
            sets: UnionFind::new(num_records),
            confirmed: 0,
        }
    }

    /// Confirm `pairs` against `sketches` (indexed by handle) and merge the
    /// accepted ones. Handles without a sketch never form edges.
    ///
    /// Returns the number of accepted edges.
    pub fn add_pairs(&mut self, pairs: &[(u32, u32)], sketches: &[Option<Sketch>]) -> usize {
        let threshold = self.threshold;
        let accepted: Vec<(u32, u32)> = pairs
            .par_iter()
            .filter(|&&(a, b)| {
                match (
                    sketches.get(a as usize).and_then(Option::as_ref),
                    sketches.get(b as usize).and_then(Option::as_ref),
                ) {
                    (Some(sa), Some(sb)) => similarity_estimate(sa, sb) >= threshold,
                    _ => false,
                }
            })
            .copied()
            .collect();

        for &(a, b) in &accepted {
            self.sets.union(a, b);
        }
        self.confirmed += accepted.len();
        debug!(
            candidates = pairs.len(),
            accepted = accepted.len(),
            threshold,
            "confirmed candidate pairs"
        );
        accepted.len()
    }

    /// Merge the sets of `a` and `b` without a similarity check.
    pub fn union(&mut self, a: u32, b: u32) -> bool {
        self.sets.union(a, b)
    }

    /// Representative (earliest member) of the set containing `a`.
    pub fn find(&mut self, a: u32) -> u32 {
        self.sets.find(a)
    }

    /// Edges accepted so far.
    pub fn confirmed_edges(&self) -> usize {
        self.confirmed
    }

    /// Freeze the current sets into a partition.
    pub fn into_clustering(mut self) -> Clustering {
        let n = self.sets.len();
        let mut cluster_of = vec![usize::MAX; n];
        let mut clusters: Vec<Cluster> = Vec::new();
        let mut by_rep: Vec<usize> = vec![usize::MAX; n];

        // Ascending handle order: a cluster is created by its earliest member.
        for h in 0..n as u32 {
            let rep = self.sets.find(h);
            let idx = if by_rep[rep as usize] == usize::MAX {
                clusters.push(Cluster {
                    representative: rep,
                    members: Vec::new(),
                });
                by_rep[rep as usize] = clusters.len() - 1;
                clusters.len() - 1
            } else {
                by_rep[rep as usize]
            };
            clusters[idx].members.push(h);
            cluster_of[h as usize] = idx;
        }

        Clustering {
            clusters,
            cluster_of,
        }
    }
}

/// Cluster every handle that has a slot in `sketches`.
///
/// Returns the partition and the number of confirmed edges.
pub fn cluster(
    pairs: &[(u32, u32)],
    sketches: &[Option<Sketch>],
    threshold: f64,
) -> (Clustering, usize) {
    let mut clusterer = SimilarityClusterer::new(threshold, sketches.len());
    let accepted = clusterer.add_pairs(pairs, sketches);
    (clusterer.into_clustering(), accepted)
}
