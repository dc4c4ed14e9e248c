//! Soft deduplication: thin redundant clusters instead of erasing them.
//!
//! The representative of every cluster keeps weight 1.0. The other members
//! share a weight that decays with cluster size, never below `min_weight`,
//! so heavily repeated content is still seen during training, just less
//! often.

use crate::cluster::Cluster;
use crate::config::{DecayPolicy, DedupConfig};

/// Turns cluster membership into retention weights.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftDedupWeighter {
    decay: DecayPolicy,
    min_weight: f64,
}

impl SoftDedupWeighter {
    /// Weighter applying `decay`, never below `min_weight`.
    pub fn new(decay: DecayPolicy, min_weight: f64) -> Self {
        Self { decay, min_weight }
    }

    /// Weighter configured from `config`.
    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.decay, config.min_weight)
    }

    /// Weight of a non-representative member of a cluster of `size` records.
    ///
    /// 1.0 for singletons; otherwise in (0, 1) and non-increasing in `size`.
    pub fn member_weight(&self, size: usize) -> f64 {
        if size <= 1 {
            return 1.0;
        }
        let w = self.decay.apply(size).max(self.min_weight);
        // Guard against misconfigured policies ever matching a representative.
        w.min(1.0 - f64::EPSILON).max(f64::MIN_POSITIVE)
    }

    /// Weight of every member of `cluster`, in member order.
    pub fn weight(&self, cluster: &Cluster) -> Vec<(u32, f64)> {
        let member_weight = self.member_weight(cluster.len());
        cluster
            .members
            .iter()
            .map(|&h| {
                let w = if h == cluster.representative {
                    1.0
                } else {
                    member_weight
                };
                (h, w)
            })
            .collect()
    }
}

impl Default for SoftDedupWeighter {
    fn default() -> Self {
        Self::new(DecayPolicy::InverseLog, 0.05)
    }
}
