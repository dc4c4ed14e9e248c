//! Error types for the deduplication engine.
//!
//! Per-record problems (`MalformedRecord`) are reported so the pipeline can
//! skip the record and keep going. Everything else aborts the run.

use thiserror::Error;

/// Errors produced by the deduplication engine.
#[derive(Debug, Error)]
pub enum DedupError {
    /// A configuration value is out of range or inconsistent.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A record cannot be processed (missing id, empty text, repeated id).
    #[error("malformed record {id:?}: {reason}")]
    MalformedRecord {
        /// The record id, if it had one.
        id: Option<String>,
        /// Why the record was rejected.
        reason: &'static str,
    },

    /// Persisted state failed its integrity or compatibility check.
    ///
    /// The engine never resumes from such state; rebuild from scratch.
    #[error("persisted state is corrupt: {0}")]
    PersistenceCorrupt(String),

    /// A staged batch was prepared against state that has since changed.
    #[error("stale batch: staged at generation {staged}, engine is at generation {current}")]
    StaleBatch {
        /// Generation the batch was prepared against.
        staged: u64,
        /// Current engine generation.
        current: u64,
    },

    /// More records than the engine's `u32` handles can address.
    #[error("record handle space exhausted after {0} records")]
    HandleSpaceExhausted(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DedupError>;
