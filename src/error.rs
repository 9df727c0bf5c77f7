//! Error types for the edgequake-batch library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`BatchError`]: **Fatal**: the batch cannot proceed at all (source
//!   listing failed, progress file unreadable, bad configuration). Returned
//!   as `Err(BatchError)` from [`crate::Dispatcher::run`].
//!
//! * [`JobError`]: **Non-fatal**: a single document failed (server down,
//!   timeout, output too short) but every other job carries on. Recorded in
//!   the progress file's `failed` list with its message preserved verbatim
//!   so the report can group failures for triage.
//!
//! A third type, [`StorageError`], is what the object stores return. Callers
//! map it into one of the two above depending on where it happened: a listing
//! failure aborts the batch, a destination write failure fails one job.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-batch library.
///
/// Per-job failures use [`JobError`] and are stored in the progress record
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum BatchError {
    // ── Source errors ─────────────────────────────────────────────────────
    /// The source store could not be enumerated. Nothing has run yet.
    #[error("Failed to list source objects under '{location}': {detail}")]
    Enumeration { location: String, detail: String },

    // ── Progress errors ───────────────────────────────────────────────────
    /// The durable progress record exists but cannot be trusted.
    ///
    /// Surfaced to the operator instead of being overwritten so prior work is
    /// never silently discarded.
    #[error("Progress file '{path}' is corrupt: {detail}\nFix or move it aside before re-running.")]
    ProgressCorruption { path: PathBuf, detail: String },

    /// The progress record could not be persisted.
    #[error("Failed to write progress file '{path}': {source}")]
    ProgressWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The report could not be saved locally.
    #[error("Failed to write report '{path}': {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (worker panic, runtime failure).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single job.
///
/// The `Display` text is what ends up in the progress file's `failed[].error`
/// and in the report's error taxonomy, so variants keep their messages short
/// and stable.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum JobError {
    /// The conversion server could not be reached or answered with a
    /// server-side failure (connection refused, 5xx, 429).
    #[error("Backend {endpoint} unreachable: {detail}")]
    BackendUnreachable { endpoint: String, detail: String },

    /// The conversion call exceeded the per-call timeout.
    #[error("Backend {endpoint} timed out after {secs}s")]
    BackendTimeout { endpoint: String, secs: u64 },

    /// The server answered, but the text is unusable (too short, rejected).
    #[error("{detail}")]
    InvalidOutput { detail: String },

    /// The Markdown could not be written to the destination store.
    #[error("Failed to save '{key}': {detail}")]
    StorageWrite { key: String, detail: String },

    /// The source object could not be read.
    #[error("Failed to read source '{key}': {detail}")]
    SourceRead { key: String, detail: String },
}

impl JobError {
    /// Whether the failure is worth retrying on (possibly) another endpoint.
    ///
    /// Only availability faults qualify. Content and permission problems are
    /// deterministic and would fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            JobError::BackendUnreachable { .. } | JobError::BackendTimeout { .. }
        )
    }

    /// Build the error for output shorter than `min_chars`.
    pub fn too_short(chars: usize, min_chars: usize) -> Self {
        let detail = if chars == 0 {
            format!("Empty extraction (0 chars, minimum {min_chars} required)")
        } else {
            format!("Text too short ({chars} chars, minimum {min_chars} required)")
        };
        JobError::InvalidOutput { detail }
    }
}

/// Errors raised by an [`crate::storage::ObjectStore`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The object or the store root does not exist.
    #[error("'{0}' not found")]
    NotFound(String),

    /// Local filesystem failure.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Remote bucket failure, already rendered to text by the SDK.
    #[error("{0}")]
    Remote(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(JobError::BackendTimeout {
            endpoint: "http://a".into(),
            secs: 5
        }
        .is_transient());
        assert!(JobError::BackendUnreachable {
            endpoint: "http://a".into(),
            detail: "connection refused".into()
        }
        .is_transient());
        assert!(!JobError::too_short(10, 50).is_transient());
        assert!(!JobError::StorageWrite {
            key: "k".into(),
            detail: "denied".into()
        }
        .is_transient());
        assert!(!JobError::SourceRead {
            key: "k".into(),
            detail: "gone".into()
        }
        .is_transient());
    }

    #[test]
    fn too_short_display() {
        let msg = JobError::too_short(10, 50).to_string();
        assert_eq!(msg, "Text too short (10 chars, minimum 50 required)");
        let msg = JobError::too_short(0, 50).to_string();
        assert!(msg.starts_with("Empty extraction"), "got: {msg}");
    }

    #[test]
    fn timeout_display() {
        let e = JobError::BackendTimeout {
            endpoint: "http://127.0.0.1:8002/predict/".into(),
            secs: 300,
        };
        assert!(e.to_string().contains("timed out after 300s"));
        assert!(e.to_string().contains("8002"));
    }

    #[test]
    fn corruption_display() {
        let e = BatchError::ProgressCorruption {
            path: PathBuf::from("extraction_progress_x.json"),
            detail: "expected value at line 1".into(),
        };
        assert!(e.to_string().contains("extraction_progress_x.json"));
    }
}
