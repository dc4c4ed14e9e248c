use crate::config::{DedupConfig, DedupMode};
use crate::normalize::{CanonicalNormalizer, Normalizer};
use crate::pipeline::DedupPipeline;
use crate::record::{Record, RetentionStatus};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

/// Canonical text form used for exact and fuzzy matching
#[pyfunction]
pub fn normalize_text(text: String) -> String {
    CanonicalNormalizer::default().normalize(&text)
}

/// Three-tier deduplicator (exact + MinHash/LSH + soft reweighting) with Rayon parallel processing
#[pyclass(name = "Deduplicator", module = "dataprep_dedup")]
pub struct PyDeduplicator {
    config: DedupConfig,
}

#[pymethods]
impl PyDeduplicator {
    /// Build a deduplicator; `mode` is one of "exact", "fuzzy" or "soft".
    #[new]
    #[pyo3(signature = (mode="soft", num_perm=128, num_bands=16, threshold=0.8, shingle_size=5, min_weight=0.05))]
    pub fn new(
        mode: &str,
        num_perm: usize,
        num_bands: usize,
        threshold: f64,
        shingle_size: usize,
        min_weight: f64,
    ) -> PyResult<Self> {
        let mode = match mode {
            "exact" => DedupMode::Exact,
            "fuzzy" => DedupMode::Fuzzy,
            "soft" => DedupMode::Soft,
            other => return Err(PyValueError::new_err(format!("unknown dedup mode: {other}"))),
        };
        let mut config = DedupConfig {
            mode,
            num_perm,
            num_bands,
            threshold,
            min_weight,
            ..Default::default()
        };
        config.shingle.size = shingle_size;
        config
            .validate()
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        Ok(Self { config })
    }

    /// Run the full pipeline over parallel lists of ids and normalized texts.
    ///
    /// Returns one (id, status, weight) tuple per valid record, in input order,
    /// followed by one (id, "malformed", 0.0) tuple per rejected record
    /// (missing id, empty text or repeated id). A missing id is reported as "".
    pub fn deduplicate(
        &self,
        ids: Vec<String>,
        texts: Vec<String>,
    ) -> PyResult<Vec<(String, String, f64)>> {
        if ids.len() != texts.len() {
            return Err(PyValueError::new_err("ids and texts must have the same length"));
        }
        let records = ids.into_iter().zip(texts).map(|(id, text)| Record::new(id, text));
        let report = DedupPipeline::run(self.config.clone(), records)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;

        let decisions = report.decisions.into_iter().map(|d| {
            let status = match d.status {
                RetentionStatus::Drop => "drop",
                RetentionStatus::KeepFull => "keep-full",
                RetentionStatus::KeepWeighted => "keep-weighted",
            };
            (d.id, status.to_string(), d.weight)
        });
        let skipped = report
            .skipped
            .into_iter()
            .map(|s| (s.id.unwrap_or_default(), "malformed".to_string(), 0.0));
        Ok(decisions.chain(skipped).collect())
    }
}
