//! Dataprep Dedup: exact, near-duplicate and soft deduplication.
//!
//! This crate decides, for every normalized text record of a pretraining
//! corpus, whether it is dropped, kept in full, or kept with a reduced
//! sampling weight:
//!
//! - **Exact dedup** (`exact`): 128-bit content digests in a sharded
//!   seen-set (exact or Bloom backend).
//! - **Near-duplicate detection** (`shingle`, `minhash`, `lsh`): MinHash
//!   sketches banded into an LSH index to surface candidate pairs.
//! - **Clustering** (`cluster`): candidates confirmed against the sketch
//!   similarity threshold, merged with union-find.
//! - **Soft dedup** (`soft`): cluster members other than the earliest keep
//!   a weight that decays with cluster size.
//!
//! The heavy stages run on Rayon; the Python data pipeline drives them
//! through the `python` feature.
//!
//! ## Usage
//!
//! ```rust
//! use dataprep_dedup::{DedupConfig, DedupPipeline, Record, RetentionStatus};
//!
//! let records = vec![
//!     Record::new("a", "the quick brown fox jumps over the lazy dog"),
//!     Record::new("b", "the quick brown fox jumps over the lazy dog"),
//!     Record::new("c", "an unrelated sentence about training data quality"),
//! ];
//! let report = DedupPipeline::run(DedupConfig::default(), records).unwrap();
//! assert_eq!(report.decisions[1].status, RetentionStatus::Drop);
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod exact;
pub mod lsh;
pub mod minhash;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod shingle;
pub mod soft;
pub mod store;

#[cfg(feature = "python")]
pub mod python;

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// Python module entry point
#[cfg(feature = "python")]
#[pymodule]
fn dataprep_dedup(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(python::normalize_text, m)?)?;
    m.add_class::<python::PyDeduplicator>()?;
    Ok(())
}

// Re-export main types
pub use cluster::{Cluster, Clustering, SimilarityClusterer, UnionFind};
pub use config::{DecayPolicy, DedupConfig, DedupMode, DigestAlgorithm, ExactBackend};
pub use error::{DedupError, Result};
pub use exact::{Digest, ExactDeduper};
pub use lsh::{LshIndex, LshParams};
pub use minhash::{MinHashSketcher, Sketch, SketchOutcome};
pub use normalize::{CanonicalNormalizer, Normalizer};
pub use pipeline::{
    BatchSummary, DedupPipeline, DedupReport, DedupStats, SkippedRecord, StagedBatch,
};
pub use record::{Decision, DropReason, Record, RetentionStatus};
pub use soft::SoftDedupWeighter;
