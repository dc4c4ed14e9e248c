//! Input records and output retention decisions.

use serde::{Deserialize, Serialize};

use crate::error::{DedupError, Result};
use crate::normalize::Normalizer;

/// Optional provenance carried alongside a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Language tag assigned upstream
    pub language: Option<String>,
    /// Source corpus or URL
    pub source: Option<String>,
}

/// A normalized text record handed to the engine.
///
/// The engine never changes the text; it only produces a [`Decision`] for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier, stable across pipeline stages
    pub id: String,
    /// Normalized text
    pub text: String,
    /// UTF-8 length of `text`
    pub byte_len: usize,
    /// Optional language/source metadata
    pub meta: Option<RecordMeta>,
}

impl Record {
    /// Build a record from already-normalized text.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            byte_len: text.len(),
            text,
            meta: None,
        }
    }

    /// Build a record by running raw text through a normalizer.
    pub fn from_raw(id: impl Into<String>, raw: &str, normalizer: &impl Normalizer) -> Self {
        Self::new(id, normalizer.normalize(raw))
    }

    /// Attach metadata.
    pub fn with_meta(mut self, meta: RecordMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Reject records the engine cannot process.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(DedupError::MalformedRecord {
                id: None,
                reason: "missing id",
            });
        }
        if self.text.trim().is_empty() {
            return Err(DedupError::MalformedRecord {
                id: Some(self.id.clone()),
                reason: "empty text after normalization",
            });
        }
        Ok(())
    }
}

/// Retention status of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionStatus {
    /// Excluded from export.
    Drop,
    /// Kept with weight 1.0.
    KeepFull,
    /// Kept with a sampling weight in (0, 1).
    KeepWeighted,
}

/// Why a record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    /// Same digest as an earlier record.
    ExactDuplicate,
    /// Non-representative member of a near-duplicate cluster (fuzzy mode).
    NearDuplicate,
}

/// Per-record output consumed by the export stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub status: RetentionStatus,
    /// 0.0 for drops, 1.0 for keep-full, in (0, 1) for keep-weighted
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DropReason>,
    /// Cluster representative, for members of multi-record clusters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representative: Option<String>,
}

impl Decision {
    /// Kept with weight 1.0.
    pub(crate) fn keep_full(id: String) -> Self {
        Self {
            id,
            status: RetentionStatus::KeepFull,
            weight: 1.0,
            reason: None,
            representative: None,
        }
    }

    /// Kept with a reduced weight, pointing at the cluster representative.
    pub(crate) fn keep_weighted(id: String, weight: f64, representative: String) -> Self {
        Self {
            id,
            status: RetentionStatus::KeepWeighted,
            weight,
            reason: None,
            representative: Some(representative),
        }
    }

    /// Excluded from export.
    pub(crate) fn dropped(id: String, reason: DropReason, representative: Option<String>) -> Self {
        Self {
            id,
            status: RetentionStatus::Drop,
            weight: 0.0,
            reason: Some(reason),
            representative,
        }
    }

    /// Whether the export stage should keep this record at all.
    pub fn is_retained(&self) -> bool {
        self.status != RetentionStatus::Drop
    }
}
