//! Durable batch state: the progress file.
//!
//! One JSON record per batch, rewritten after every finished job so a run
//! can be killed at any moment and resumed from the last flush. Writes go
//! to `<file>.tmp` and are renamed over the real file, so a reader sees
//! either the previous complete record or the new one.
//!
//! ```json
//! {
//!   "timestamp": "2025-03-01T10:15:00+00:00",
//!   "status": "running",
//!   "processed": [{"file": "...", "markdown_file": "...", "chars_extracted": 1234,
//!                  "time_sec": 12.5, "server_used": "http://..."}],
//!   "pending": ["..."],
//!   "failed": [{"file": "...", "error": "...", "attempts": 4}]
//! }
//! ```
//!
//! Invariant at every flush: `processed`, `pending` and `failed` are
//! disjoint and together hold the whole job set.

use crate::error::{BatchError, StorageError};
use crate::job::join_key;
use crate::storage::ObjectStore;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// File name prefix of progress files.
pub const PROGRESS_FILE_PREFIX: &str = "extraction_progress_";

/// Batch-level status stored in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    Completed,
}

/// A job that produced a Markdown artefact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub file: String,
    pub markdown_file: String,
    pub chars_extracted: usize,
    pub time_sec: f64,
    #[serde(default)]
    pub server_used: String,
    #[serde(default = "one")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A job that reached a terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub file: String,
    pub error: String,
    #[serde(default = "one")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

fn one() -> u32 {
    1
}

/// How one job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Processed(ProcessedEntry),
    Failed(FailedEntry),
}

impl Completion {
    pub fn file(&self) -> &str {
        match self {
            Completion::Processed(e) => &e.file,
            Completion::Failed(e) => &e.file,
        }
    }
}

/// The persisted state of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Time of the last flush. Kept as text so records written by older
    /// tooling (naive ISO timestamps) still load.
    pub timestamp: String,
    pub status: BatchStatus,
    #[serde(default)]
    pub processed: Vec<ProcessedEntry>,
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub failed: Vec<FailedEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
    /// Keys moved back from `failed` by a retry pass. Their output goes to
    /// the retry destination when one is configured, also after a resume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requeued: Vec<String>,
}

impl ProgressRecord {
    /// A fresh record with every key pending.
    pub fn new(pending: Vec<String>) -> Self {
        Self {
            timestamp: now(),
            status: BatchStatus::Running,
            processed: Vec::new(),
            pending,
            failed: Vec::new(),
            completion_time: None,
            requeued: Vec::new(),
        }
    }

    pub fn total_jobs(&self) -> usize {
        self.processed.len() + self.pending.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Check that no key appears twice, within or across the three sets.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.total_jobs());
        let keys = self
            .processed
            .iter()
            .map(|e| ("processed", e.file.as_str()))
            .chain(self.pending.iter().map(|k| ("pending", k.as_str())))
            .chain(self.failed.iter().map(|e| ("failed", e.file.as_str())));
        for (set, key) in keys {
            if !seen.insert(key) {
                return Err(format!("'{key}' appears more than once (again in {set})"));
            }
        }
        Ok(())
    }

    /// Move every failed key back to `pending`, in failure order, after any
    /// keys already pending. Returns how many were moved.
    pub fn requeue_failed(&mut self) -> usize {
        let moved = self.failed.len();
        for entry in self.failed.drain(..) {
            if !self.requeued.contains(&entry.file) {
                self.requeued.push(entry.file.clone());
            }
            self.pending.push(entry.file);
        }
        if moved > 0 {
            self.status = BatchStatus::Running;
            self.completion_time = None;
        }
        moved
    }

    /// Move `completion`'s key out of `pending` into the matching set.
    ///
    /// Returns false (and changes nothing) if the key was not pending.
    pub fn apply(&mut self, completion: Completion) -> bool {
        let Some(pos) = self.pending.iter().position(|k| k == completion.file()) else {
            return false;
        };
        self.pending.remove(pos);
        match completion {
            Completion::Processed(e) => self.processed.push(e),
            Completion::Failed(e) => self.failed.push(e),
        }
        true
    }
}

static RE_UNSAFE_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("static regex"));

/// Derive a stable batch id from a source location.
///
/// The scheme is dropped and each run of characters outside
/// `[A-Za-z0-9_-]` becomes one `_`: `s3://llm4eo/MS2/pdfs/` → `llm4eo_MS2_pdfs`.
pub fn batch_id_from(location: &str) -> String {
    let without_scheme = location
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(location);
    let id = RE_UNSAFE_RUN.replace_all(without_scheme, "_");
    let id = id.trim_matches('_');
    if id.is_empty() {
        "batch".to_string()
    } else {
        id.to_string()
    }
}

/// Path of the progress file for `batch_id` under `dir`.
pub fn progress_path(dir: &Path, batch_id: &str) -> PathBuf {
    dir.join(format!("{PROGRESS_FILE_PREFIX}{batch_id}.json"))
}

/// Read and validate a progress file. `Ok(None)` when it does not exist.
pub async fn load(path: &Path) -> Result<Option<ProgressRecord>, BatchError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(corruption(path, format!("unreadable: {e}"))),
    };
    let record: ProgressRecord =
        serde_json::from_slice(&bytes).map_err(|e| corruption(path, e.to_string()))?;
    record.validate().map_err(|d| corruption(path, d))?;
    debug!(
        "Loaded {}: {} processed, {} pending, {} failed",
        path.display(),
        record.processed.len(),
        record.pending.len(),
        record.failed.len()
    );
    Ok(Some(record))
}

fn corruption(path: &Path, detail: String) -> BatchError {
    BatchError::ProgressCorruption {
        path: path.to_path_buf(),
        detail,
    }
}

/// Owns the in-memory record and serialises every flush of it.
#[derive(Debug)]
pub struct ProgressTracker {
    path: PathBuf,
    record: Mutex<ProgressRecord>,
}

impl ProgressTracker {
    pub fn new(path: impl Into<PathBuf>, record: ProgressRecord) -> Self {
        Self {
            path: path.into(),
            record: Mutex::new(record),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current record.
    pub async fn snapshot(&self) -> ProgressRecord {
        self.record.lock().await.clone()
    }

    /// Persist the current record.
    pub async fn flush(&self) -> Result<(), BatchError> {
        let mut record = self.record.lock().await;
        record.timestamp = now();
        write_atomic(&self.path, &record).await
    }

    /// Record a finished job and flush immediately.
    ///
    /// The in-memory update always happens; a failed flush is returned so the
    /// caller can decide whether to keep going. The next successful flush
    /// persists everything.
    pub async fn mark_done(&self, completion: Completion) -> Result<(), BatchError> {
        let mut record = self.record.lock().await;
        let key = completion.file().to_string();
        if !record.apply(completion) {
            warn!("'{}' finished but was not pending; ignored", key);
            return Ok(());
        }
        record.timestamp = now();
        write_atomic(&self.path, &record).await
    }

    /// Mark the batch completed and flush. Returns the final record.
    pub async fn finalize(&self) -> Result<ProgressRecord, BatchError> {
        let mut record = self.record.lock().await;
        let stamp = now();
        record.timestamp = stamp.clone();
        if record.is_complete() {
            record.status = BatchStatus::Completed;
            record.completion_time = Some(stamp);
        }
        write_atomic(&self.path, &record).await?;
        info!(
            "Progress saved to {} ({} processed, {} failed, {} pending)",
            self.path.display(),
            record.processed.len(),
            record.failed.len(),
            record.pending.len()
        );
        Ok(record.clone())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Upload `record` to `<destination_prefix>/analytics/`, next to the report.
/// Returns the key written.
pub async fn publish(
    record: &ProgressRecord,
    store: &dyn ObjectStore,
    destination_prefix: &str,
    batch_id: &str,
) -> Result<String, StorageError> {
    let key = join_key(
        &join_key(destination_prefix, "analytics"),
        &format!("{PROGRESS_FILE_PREFIX}{batch_id}.json"),
    );
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| StorageError::Remote(format!("progress serialisation failed: {e}")))?;
    store.write(&key, json, "application/json").await?;
    info!("Uploaded progress record to {}/{}", store.describe().trim_end_matches('/'), key);
    Ok(key)
}

/// Atomic write: write to temp, then rename.
async fn write_atomic(path: &Path, record: &ProgressRecord) -> Result<(), BatchError> {
    let write_err = |source: std::io::Error| BatchError::ProgressWrite {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_vec_pretty(record)
        .map_err(|e| write_err(std::io::Error::other(e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, &json).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}
