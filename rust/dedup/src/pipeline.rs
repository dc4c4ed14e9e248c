//! Two-pass deduplication over a streaming corpus.
//!
//! Pass 1 (`prepare_batch` + `commit_batch`, or `ingest_batch`): validate,
//! digest, exact-check, sketch and band every record. Nothing is clustered
//! yet; clustering needs the complete candidate graph.
//!
//! Pass 2 (`finish`): drain the LSH candidate pairs through the clusterer,
//! weight the clusters, and emit one decision per ingested record.
//! `finish` consumes the pipeline, so no record can be added once
//! clustering has started.
//!
//! Batches are transactional. `prepare_batch` only reads engine state and
//! does all the expensive work in parallel; `commit_batch` applies the
//! result in one step. Dropping a `StagedBatch` abandons it without a trace.

use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::cluster::cluster;
use crate::config::{DedupConfig, DedupMode};
use crate::error::{DedupError, Result};
use crate::exact::{Digest, ExactDeduper, StagedDigests};
use crate::lsh::LshIndex;
use crate::minhash::{MinHashSketcher, Sketch, SketchOutcome};
use crate::record::{Decision, DropReason, Record};
use crate::soft::SoftDedupWeighter;
use crate::store::{read_snapshot, write_snapshot, EngineFingerprint};

/// Run counters, reported so operators can audit dedup aggressiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DedupStats {
    /// Records offered to the pipeline, including malformed ones
    pub processed: usize,
    /// Skipped: missing id, empty text or repeated id
    pub malformed: usize,
    /// Dropped as exact duplicates
    pub exact_duplicates: usize,
    /// Dropped as near-duplicates (fuzzy mode only)
    pub near_duplicates: usize,
    /// Too short to sketch; kept in full without fuzzy dedup
    pub degenerate_bypassed: usize,
    pub kept_full: usize,
    pub kept_weighted: usize,
    /// Clusters over all sketched and bypassed records, singletons included
    pub clusters: usize,
    pub multi_member_clusters: usize,
    pub largest_cluster: usize,
    pub candidate_pairs: usize,
    pub confirmed_edges: usize,
    /// Inserts that hit a full LSH bucket
    pub bucket_overflows: u64,
}

/// A record rejected during validation; it gets no decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    /// `None` when the record had no id
    pub id: Option<String>,
    pub reason: &'static str,
}

/// Result of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    /// One decision per valid record ingested in this run, in ingestion order
    pub decisions: Vec<Decision>,
    /// Malformed records, in ingestion order
    pub skipped: Vec<SkippedRecord>,
    pub stats: DedupStats,
}

/// Counters for one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub accepted: usize,
    pub exact_duplicates: usize,
    pub degenerate: usize,
    pub malformed: usize,
}

#[derive(Debug)]
enum StagedKind {
    ExactDuplicate,
    /// Survivor that skips the fuzzy stages.
    Bypass { degenerate: bool },
    Sketched { sketch: Sketch, band_keys: Vec<u64> },
}

#[derive(Debug)]
struct StagedEntry {
    id: String,
    kind: StagedKind,
}

/// Fully computed, not yet applied batch.
#[derive(Debug)]
pub struct StagedBatch {
    generation: u64,
    entries: Vec<StagedEntry>,
    digests: StagedDigests,
    skipped: Vec<SkippedRecord>,
}

impl StagedBatch {
    /// Valid records in the batch.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no record in the batch passed validation.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records rejected during preparation.
    pub fn malformed(&self) -> usize {
        self.skipped.len()
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    ExactDuplicate(String),
    Survivor(u32),
}

/// The deduplication engine.
pub struct DedupPipeline {
    config: DedupConfig,
    exact: ExactDeduper,
    sketcher: MinHashSketcher,
    index: LshIndex,
    weighter: SoftDedupWeighter,
    /// Handle → record id, for every survivor (restored ones first)
    ids: Vec<String>,
    /// Handle → sketch; `None` for records that bypassed fuzzy dedup
    sketches: Vec<Option<Sketch>>,
    seen_ids: HashSet<String>,
    outcomes: Vec<Outcome>,
    skipped: Vec<SkippedRecord>,
    stats: DedupStats,
    generation: u64,
}

impl DedupPipeline {
    /// Validate `config` and build an empty engine.
    pub fn new(config: DedupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            exact: ExactDeduper::from_config(&config),
            sketcher: MinHashSketcher::from_config(&config),
            index: LshIndex::from_config(&config)?,
            weighter: SoftDedupWeighter::from_config(&config),
            ids: Vec::new(),
            sketches: Vec::new(),
            seen_ids: HashSet::new(),
            outcomes: Vec::new(),
            skipped: Vec::new(),
            stats: DedupStats::default(),
            generation: 0,
            config,
        })
    }

    /// Restore from a snapshot written by [`DedupPipeline::checkpoint`].
    ///
    /// Restored records take part in clustering (as the earliest members of
    /// their clusters) but get no decision in this run.
    pub fn resume(config: DedupConfig, path: &Path) -> Result<Self> {
        let mut pipeline = Self::new(config)?;
        let snapshot = read_snapshot(path, &EngineFingerprint::of(&pipeline.config))?;
        if snapshot.records.len() > u32::MAX as usize {
            return Err(DedupError::HandleSpaceExhausted(snapshot.records.len()));
        }

        pipeline.exact = snapshot.digests;
        let mut entries = Vec::new();
        for (handle, record) in snapshot.records.into_iter().enumerate() {
            if let Some(sketch) = &record.sketch {
                entries.push((handle as u32, pipeline.index.band_keys(sketch)));
            }
            pipeline.seen_ids.insert(record.id.clone());
            pipeline.ids.push(record.id);
            pipeline.sketches.push(record.sketch);
        }
        pipeline.index.insert_batch(&entries);

        info!(
            path = %path.display(),
            records = pipeline.ids.len(),
            sketched = entries.len(),
            digests = pipeline.exact.len(),
            bloom = pipeline.exact.is_bloom(),
            "resumed dedup state"
        );
        Ok(pipeline)
    }

    /// Persist digests and sketches so a later run can resume.
    pub fn checkpoint(&self, path: &Path) -> Result<()> {
        write_snapshot(
            path,
            &EngineFingerprint::of(&self.config),
            &self.exact,
            &self.ids,
            &self.sketches,
        )
    }

    /// Pass 1 compute for a batch, without touching engine state.
    pub fn prepare_batch(&self, records: Vec<Record>) -> StagedBatch {
        let mut skipped = Vec::new();
        let mut batch_ids: HashSet<&str> = HashSet::new();
        let mut valid: Vec<&Record> = Vec::with_capacity(records.len());

        for record in &records {
            let verdict = record.validate().and_then(|()| {
                if self.seen_ids.contains(&record.id) || !batch_ids.insert(record.id.as_str()) {
                    Err(DedupError::MalformedRecord {
                        id: Some(record.id.clone()),
                        reason: "repeated id",
                    })
                } else {
                    Ok(())
                }
            });
            match verdict {
                Ok(()) => valid.push(record),
                Err(e) => {
                    warn!(error = %e, "skipping record");
                    let (id, reason) = match e {
                        DedupError::MalformedRecord { id, reason } => (id, reason),
                        _ => (Some(record.id.clone()), "invalid record"),
                    };
                    skipped.push(SkippedRecord { id, reason });
                }
            }
        }

        let digests: Vec<Digest> = valid
            .par_iter()
            .map(|r| self.exact.digest(&r.text))
            .collect();
        let staged_digests = self.exact.check_batch(&digests);

        let fuzzy = self.config.mode != DedupMode::Exact;
        let kinds: Vec<StagedKind> = valid
            .par_iter()
            .zip(staged_digests.duplicate.par_iter())
            .map(|(record, &duplicate)| {
                if duplicate {
                    return StagedKind::ExactDuplicate;
                }
                if !fuzzy {
                    return StagedKind::Bypass { degenerate: false };
                }
                match self.sketcher.sketch(&record.text) {
                    SketchOutcome::Sketch(sketch) => {
                        let band_keys = self.index.band_keys(&sketch);
                        StagedKind::Sketched { sketch, band_keys }
                    }
                    SketchOutcome::Degenerate { .. } => StagedKind::Bypass { degenerate: true },
                }
            })
            .collect();

        let entries = valid
            .iter()
            .zip(kinds)
            .map(|(record, kind)| StagedEntry {
                id: record.id.clone(),
                kind,
            })
            .collect();

        StagedBatch {
            generation: self.generation,
            entries,
            digests: staged_digests,
            skipped,
        }
    }

    /// Apply a prepared batch in one step.
    pub fn commit_batch(&mut self, staged: StagedBatch) -> Result<BatchSummary> {
        if staged.generation != self.generation {
            return Err(DedupError::StaleBatch {
                staged: staged.generation,
                current: self.generation,
            });
        }
        let survivors = staged
            .entries
            .iter()
            .filter(|e| !matches!(e.kind, StagedKind::ExactDuplicate))
            .count();
        if self.ids.len() + survivors > u32::MAX as usize {
            return Err(DedupError::HandleSpaceExhausted(self.ids.len() + survivors));
        }

        let mut summary = BatchSummary {
            malformed: staged.skipped.len(),
            ..Default::default()
        };
        self.skipped.extend(staged.skipped);
        self.exact.commit(staged.digests);

        let mut lsh_entries = Vec::new();
        for entry in staged.entries {
            self.seen_ids.insert(entry.id.clone());
            summary.accepted += 1;
            let (sketch, degenerate) = match entry.kind {
                StagedKind::ExactDuplicate => {
                    summary.exact_duplicates += 1;
                    self.outcomes.push(Outcome::ExactDuplicate(entry.id));
                    continue;
                }
                StagedKind::Bypass { degenerate } => (None, degenerate),
                StagedKind::Sketched { sketch, band_keys } => {
                    lsh_entries.push((self.ids.len() as u32, band_keys));
                    (Some(sketch), false)
                }
            };
            if degenerate {
                summary.degenerate += 1;
            }
            let handle = self.ids.len() as u32;
            self.ids.push(entry.id);
            self.sketches.push(sketch);
            self.outcomes.push(Outcome::Survivor(handle));
        }
        self.index.insert_batch(&lsh_entries);

        self.stats.processed += summary.accepted + summary.malformed;
        self.stats.malformed += summary.malformed;
        self.stats.exact_duplicates += summary.exact_duplicates;
        self.stats.degenerate_bypassed += summary.degenerate;
        self.generation += 1;

        debug!(
            generation = self.generation,
            accepted = summary.accepted,
            exact_duplicates = summary.exact_duplicates,
            degenerate = summary.degenerate,
            malformed = summary.malformed,
            "committed batch"
        );
        Ok(summary)
    }

    /// Prepare and commit a batch.
    pub fn ingest_batch(&mut self, records: Vec<Record>) -> Result<BatchSummary> {
        let staged = self.prepare_batch(records);
        self.commit_batch(staged)
    }

    /// Pass 2: cluster, weight, and emit decisions.
    pub fn finish(self) -> Result<DedupReport> {
        let DedupPipeline {
            config,
            index,
            weighter,
            ids,
            sketches,
            outcomes,
            skipped,
            mut stats,
            ..
        } = self;

        let pairs = if config.mode == DedupMode::Exact {
            Vec::new()
        } else {
            index.candidate_pairs()
        };
        let (clustering, accepted) = cluster(&pairs, &sketches, config.threshold);
        stats.candidate_pairs = pairs.len();
        stats.confirmed_edges = accepted;
        stats.bucket_overflows = index.overflow_count();
        stats.clusters = clustering.len();

        let mut weights = vec![1.0f64; ids.len()];
        for c in clustering.clusters().iter().filter(|c| c.len() > 1) {
            stats.multi_member_clusters += 1;
            stats.largest_cluster = stats.largest_cluster.max(c.len());
            for (h, w) in weighter.weight(c) {
                weights[h as usize] = w;
            }
        }
        if stats.largest_cluster == 0 && !clustering.is_empty() {
            stats.largest_cluster = 1;
        }

        let mut decisions = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            let decision = match outcome {
                Outcome::ExactDuplicate(id) => Decision::dropped(id, DropReason::ExactDuplicate, None),
                Outcome::Survivor(h) => {
                    let id = ids[h as usize].clone();
                    let c = clustering.cluster_of(h);
                    if c.len() == 1 || c.representative == h {
                        stats.kept_full += 1;
                        Decision::keep_full(id)
                    } else {
                        let representative = ids[c.representative as usize].clone();
                        match config.mode {
                            DedupMode::Fuzzy => {
                                stats.near_duplicates += 1;
                                Decision::dropped(id, DropReason::NearDuplicate, Some(representative))
                            }
                            _ => {
                                stats.kept_weighted += 1;
                                Decision::keep_weighted(id, weights[h as usize], representative)
                            }
                        }
                    }
                }
            };
            decisions.push(decision);
        }

        info!(
            mode = ?config.mode,
            processed = stats.processed,
            malformed = stats.malformed,
            exact_duplicates = stats.exact_duplicates,
            near_duplicates = stats.near_duplicates,
            degenerate_bypassed = stats.degenerate_bypassed,
            kept_full = stats.kept_full,
            kept_weighted = stats.kept_weighted,
            clusters = stats.clusters,
            multi_member_clusters = stats.multi_member_clusters,
            candidate_pairs = stats.candidate_pairs,
            bucket_overflows = stats.bucket_overflows,
            "dedup run finished"
        );

        Ok(DedupReport {
            decisions,
            skipped,
            stats,
        })
    }

    /// Deduplicate a whole corpus in `batch_size` batches.
    pub fn run<I>(config: DedupConfig, records: I) -> Result<DedupReport>
    where
        I: IntoIterator<Item = Record>,
    {
        let batch_size = config.batch_size;
        let mut pipeline = Self::new(config)?;
        let mut batch = Vec::with_capacity(batch_size);
        for record in records {
            batch.push(record);
            if batch.len() == batch_size {
                pipeline.ingest_batch(std::mem::take(&mut batch))?;
            }
        }
        if !batch.is_empty() {
            pipeline.ingest_batch(batch)?;
        }
        pipeline.finish()
    }

    /// Configuration the engine was built with.
    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Counters accumulated by pass 1 so far.
    pub fn stats(&self) -> &DedupStats {
        &self.stats
    }

    /// Survivors known to the engine, restored ones included.
    pub fn num_records(&self) -> usize {
        self.ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RetentionStatus;

    fn config() -> DedupConfig {
        DedupConfig {
            num_perm: 256,
            num_bands: 32,
            batch_size: 2,
            ..Default::default()
        }
    }

    fn words(n: usize, tag: &str) -> Vec<String> {
        (0..n).map(|i| format!("{tag}{i}")).collect()
    }

    #[test]
    fn test_exact_duplicates_across_batches() {
        let mut p = DedupPipeline::new(config()).unwrap();
        let text = words(20, "w").join(" ");
        p.ingest_batch(vec![Record::new("a", text.clone())]).unwrap();
        let summary = p
            .ingest_batch(vec![Record::new("b", text.clone()), Record::new("c", text)])
            .unwrap();
        assert_eq!(summary.exact_duplicates, 2);

        let report = p.finish().unwrap();
        let statuses: Vec<RetentionStatus> = report.decisions.iter().map(|d| d.status).collect();
        assert_eq!(
            statuses,
            vec![RetentionStatus::KeepFull, RetentionStatus::Drop, RetentionStatus::Drop]
        );
    }

    #[test]
    fn test_dropped_staged_batch_leaves_no_trace() {
        let mut p = DedupPipeline::new(config()).unwrap();
        let text = words(20, "w").join(" ");
        let staged = p.prepare_batch(vec![Record::new("a", text.clone())]);
        assert_eq!(staged.len(), 1);
        drop(staged);

        // Same id and text again: neither repeated-id nor duplicate.
        let summary = p.ingest_batch(vec![Record::new("a", text)]).unwrap();
        assert_eq!(summary.malformed, 0);
        assert_eq!(summary.exact_duplicates, 0);
        assert_eq!(p.num_records(), 1);
    }

    #[test]
    fn test_stale_batch_is_rejected() {
        let mut p = DedupPipeline::new(config()).unwrap();
        let first = p.prepare_batch(vec![Record::new("a", words(10, "a").join(" "))]);
        let second = p.prepare_batch(vec![Record::new("b", words(10, "b").join(" "))]);
        p.commit_batch(first).unwrap();
        assert!(matches!(
            p.commit_batch(second),
            Err(DedupError::StaleBatch { staged: 0, current: 1 })
        ));
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let records = vec![
            Record::new("", "no id here at all"),
            Record::new("empty", "   "),
            Record::new("ok", words(10, "x").join(" ")),
            Record::new("ok", words(10, "y").join(" ")),
        ];
        let report = DedupPipeline::run(config(), records).unwrap();
        assert_eq!(report.decisions.len(), 1);
        assert_eq!(report.decisions[0].id, "ok");
        assert_eq!(report.stats.malformed, 3);
        assert_eq!(report.stats.processed, 4);
        assert_eq!(
            report.skipped,
            vec![
                SkippedRecord {
                    id: None,
                    reason: "missing id"
                },
                SkippedRecord {
                    id: Some("empty".into()),
                    reason: "empty text after normalization"
                },
                SkippedRecord {
                    id: Some("ok".into()),
                    reason: "repeated id"
                },
            ]
        );
    }

    #[test]
    fn test_exact_mode_skips_fuzzy_stages() {
        let base = words(40, "t");
        let mut near = base.clone();
        near[20] = "changed".into();
        let records = vec![
            Record::new("a", base.join(" ")),
            Record::new("b", near.join(" ")),
        ];
        let cfg = DedupConfig {
            mode: DedupMode::Exact,
            ..config()
        };
        let report = DedupPipeline::run(cfg, records).unwrap();
        assert!(report.decisions.iter().all(|d| d.status == RetentionStatus::KeepFull));
        assert_eq!(report.stats.candidate_pairs, 0);
    }

    #[test]
    fn test_fuzzy_mode_drops_near_duplicates() {
        let base = words(40, "t");
        let mut near = base.clone();
        near[39] = "changed".into();
        let records = vec![
            Record::new("a", base.join(" ")),
            Record::new("b", near.join(" ")),
        ];
        let cfg = DedupConfig {
            mode: DedupMode::Fuzzy,
            ..config()
        };
        let report = DedupPipeline::run(cfg, records).unwrap();
        assert_eq!(report.decisions[0].status, RetentionStatus::KeepFull);
        assert_eq!(report.decisions[1].status, RetentionStatus::Drop);
        assert_eq!(report.decisions[1].reason, Some(DropReason::NearDuplicate));
        assert_eq!(report.decisions[1].representative.as_deref(), Some("a"));
        assert_eq!(report.stats.near_duplicates, 1);
    }

    #[test]
    fn test_checkpoint_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.snap");
        let base = words(40, "t");
        let mut near = base.clone();
        near[39] = "changed".into();

        let mut first = DedupPipeline::new(config()).unwrap();
        first
            .ingest_batch(vec![
                Record::new("a", base.join(" ")),
                Record::new("short", "tiny"),
            ])
            .unwrap();
        first.checkpoint(&path).unwrap();

        let mut second = DedupPipeline::resume(config(), &path).unwrap();
        assert_eq!(second.num_records(), 2);
        let summary = second
            .ingest_batch(vec![
                Record::new("a", "reused id from the previous run here"),
                Record::new("b", base.join(" ")),
                Record::new("c", near.join(" ")),
            ])
            .unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.exact_duplicates, 1);

        let report = second.finish().unwrap();
        // Only this run's valid records get decisions.
        assert_eq!(report.decisions.len(), 2);
        assert_eq!(report.decisions[0].id, "b");
        assert_eq!(report.decisions[0].reason, Some(DropReason::ExactDuplicate));
        assert_eq!(report.decisions[1].id, "c");
        assert_eq!(report.decisions[1].status, RetentionStatus::KeepWeighted);
        assert_eq!(report.decisions[1].representative.as_deref(), Some("a"));
    }

    #[test]
    fn test_resume_rejects_changed_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.snap");
        let p = DedupPipeline::new(config()).unwrap();
        p.checkpoint(&path).unwrap();

        let changed = DedupConfig {
            seed: 1,
            ..config()
        };
        assert!(matches!(
            DedupPipeline::resume(changed, &path),
            Err(DedupError::PersistenceCorrupt(_))
        ));
    }

    #[test]
    fn test_exact_mode_snapshot_cannot_seed_soft_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.snap");
        let exact = DedupConfig {
            mode: DedupMode::Exact,
            ..config()
        };
        let mut p = DedupPipeline::new(exact).unwrap();
        p.ingest_batch(vec![Record::new("a", words(100, "t").join(" "))])
            .unwrap();
        p.checkpoint(&path).unwrap();

        assert!(matches!(
            DedupPipeline::resume(config(), &path),
            Err(DedupError::PersistenceCorrupt(_))
        ));
        let fuzzy = DedupConfig {
            mode: DedupMode::Fuzzy,
            ..config()
        };
        assert!(matches!(
            DedupPipeline::resume(fuzzy, &path),
            Err(DedupError::PersistenceCorrupt(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let cfg = DedupConfig {
            num_bands: 3,
            ..config()
        };
        assert!(matches!(
            DedupPipeline::new(cfg),
            Err(DedupError::InvalidConfig(_))
        ));
    }
}
