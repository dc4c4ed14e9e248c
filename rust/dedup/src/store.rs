//! Persisted engine state for incremental and resumable runs.
//!
//! A snapshot holds the seen-digest set and every record's sketch. The LSH
//! index is not stored; it is rebuilt from the sketches on resume.
//!
//! File layout: one header line `xxh3:<16 hex digits>` with the checksum of
//! the payload, followed by the JSON payload. Snapshots are written to a
//! temporary file, synced, and renamed into place, so a crash mid-write
//! leaves the previous snapshot intact.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{DedupConfig, DedupMode, DigestAlgorithm, ExactBackend, ShingleConfig};
use crate::error::{DedupError, Result};
use crate::exact::ExactDeduper;
use crate::minhash::Sketch;

/// Bumped whenever the payload layout changes.
pub const FORMAT_VERSION: u32 = 1;

const HEADER_PREFIX: &str = "xxh3:";

/// Parameters that must match for persisted sketches and digests to be
/// comparable with a new engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFingerprint {
    /// Exact-mode snapshots carry no sketches, so they cannot seed a fuzzy run
    pub mode: DedupMode,
    pub num_perm: usize,
    pub num_bands: usize,
    pub shingle: ShingleConfig,
    pub min_shingles: usize,
    pub seed: u64,
    pub digest: DigestAlgorithm,
    pub exact_backend: ExactBackend,
    pub num_shards: usize,
}

impl EngineFingerprint {
    /// Fingerprint of the parameters in `config` that persisted state depends on.
    pub fn of(config: &DedupConfig) -> Self {
        Self {
            mode: config.mode,
            num_perm: config.num_perm,
            num_bands: config.num_bands,
            shingle: config.shingle.clone(),
            min_shingles: config.min_shingles,
            seed: config.seed,
            digest: config.digest,
            exact_backend: config.exact_backend,
            num_shards: config.num_shards,
        }
    }
}

/// A record as persisted: its id and, unless it bypassed fuzzy dedup, its sketch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: String,
    pub sketch: Option<Sketch>,
}

/// Decoded snapshot contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub fingerprint: EngineFingerprint,
    pub digests: ExactDeduper,
    pub records: Vec<PersistedRecord>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    format_version: u32,
    fingerprint: &'a EngineFingerprint,
    digests: &'a ExactDeduper,
    records: Vec<PersistedRecordRef<'a>>,
}

#[derive(Serialize)]
struct PersistedRecordRef<'a> {
    id: &'a str,
    sketch: Option<&'a Sketch>,
}

/// Write a snapshot atomically and durably.
pub(crate) fn write_snapshot(
    path: &Path,
    fingerprint: &EngineFingerprint,
    digests: &ExactDeduper,
    ids: &[String],
    sketches: &[Option<Sketch>],
) -> Result<()> {
    let snapshot = SnapshotRef {
        format_version: FORMAT_VERSION,
        fingerprint,
        digests,
        records: ids
            .iter()
            .zip(sketches)
            .map(|(id, sketch)| PersistedRecordRef {
                id,
                sketch: sketch.as_ref(),
            })
            .collect(),
    };
    let payload = serde_json::to_vec(&snapshot)?;

    let mut bytes = format!("{HEADER_PREFIX}{:016x}\n", xxh3_64(&payload)).into_bytes();
    bytes.extend_from_slice(&payload);

    let tmp = temp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;

    info!(
        path = %path.display(),
        records = ids.len(),
        bytes = bytes.len(),
        "wrote dedup snapshot"
    );
    Ok(())
}

/// Read and verify a snapshot.
///
/// Any integrity or compatibility failure is `PersistenceCorrupt`; the
/// caller must rebuild instead of resuming.
pub fn read_snapshot(path: &Path, expected: &EngineFingerprint) -> Result<Snapshot> {
    let bytes = fs::read(path)?;
    let corrupt = |msg: String| DedupError::PersistenceCorrupt(format!("{}: {msg}", path.display()));

    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| corrupt("missing checksum header".into()))?;
    let header = std::str::from_utf8(&bytes[..newline])
        .map_err(|_| corrupt("checksum header is not UTF-8".into()))?;
    let stored = header
        .strip_prefix(HEADER_PREFIX)
        .and_then(|hex| u64::from_str_radix(hex, 16).ok())
        .ok_or_else(|| corrupt(format!("malformed checksum header {header:?}")))?;

    let payload = &bytes[newline + 1..];
    let actual = xxh3_64(payload);
    if stored != actual {
        return Err(corrupt(format!(
            "checksum mismatch (stored {stored:016x}, computed {actual:016x})"
        )));
    }

    let snapshot: Snapshot =
        serde_json::from_slice(payload).map_err(|e| corrupt(format!("undecodable payload: {e}")))?;

    if snapshot.format_version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "format version {} (expected {FORMAT_VERSION})",
            snapshot.format_version
        )));
    }
    if &snapshot.fingerprint != expected {
        return Err(corrupt(format!(
            "engine parameters changed since the snapshot was taken ({:?} vs {:?})",
            snapshot.fingerprint, expected
        )));
    }
    if snapshot.digests.algorithm() != expected.digest
        || snapshot.digests.num_shards() != expected.num_shards.max(1)
    {
        return Err(corrupt("digest set does not match its fingerprint".into()));
    }

    let mut ids = HashSet::with_capacity(snapshot.records.len());
    for record in &snapshot.records {
        if record.id.is_empty() || !ids.insert(record.id.as_str()) {
            return Err(corrupt(format!("empty or repeated record id {:?}", record.id)));
        }
        if let Some(sketch) = &record.sketch {
            if sketch.len() != expected.num_perm {
                return Err(corrupt(format!(
                    "sketch of {:?} has length {} (expected {})",
                    record.id,
                    sketch.len(),
                    expected.num_perm
                )));
            }
        }
    }

    Ok(snapshot)
}

/// Make the rename itself durable.
#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
