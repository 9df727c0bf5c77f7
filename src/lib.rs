//! # edgequake-batch
//!
//! Run a large batch of document conversions (PDF/HTML → Markdown) across a
//! pool of conversion servers, surviving partial failures and resuming later
//! without redoing finished work.
//!
//! ## Why this crate?
//!
//! Model-backed converters are slow, stateful, and flaky at scale: a GPU
//! server stalls, a connection drops, a scanned page yields ten characters of
//! noise. A batch of tens of thousands of documents must keep going through
//! all of that, spread load over every server it was given, and be safe to
//! kill and restart at any point. This crate is the orchestration around the
//! converter; the converter itself stays an opaque HTTP endpoint.
//!
//! ## Pipeline Overview
//!
//! ```text
//! source store
//!  │
//!  ├─ 1. List     enumerate keys under a prefix (skipped on resume)
//!  ├─ 2. Assign   least-loaded endpoint from the backend pool
//!  ├─ 3. Execute  read → convert → clean → length check → write .md
//!  ├─ 4. Retry    backoff on unreachable/timeout, fail fast otherwise
//!  ├─ 5. Record   progress file flushed after every job
//!  └─ 6. Report   counts, throughput, error taxonomy
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_batch::{BatchConfig, Dispatcher, HttpBackend, LocalStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig::builder()
//!         .endpoint("http://127.0.0.1:8002/predict/")
//!         .endpoint("http://127.0.0.1:8003/predict/")
//!         .destination_prefix("markdown")
//!         .build()?;
//!     let dispatcher = Dispatcher::new(
//!         config,
//!         Arc::new(LocalStore::new("pdfs")),
//!         Arc::new(LocalStore::new("out")),
//!         Arc::new(HttpBackend::new()),
//!     );
//!     let summary = dispatcher.run().await?;
//!     eprintln!("{} ok, {} failed",
//!         summary.report.metadata.success_count,
//!         summary.report.metadata.error_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2md-batch` binary (clap + anyhow + tracing-subscriber + indicatif) |
//! | `s3`    | on      | S3-compatible bucket store (aws-sdk-s3) |
//!
//! Disable both when embedding the engine with your own stores:
//! ```toml
//! edgequake-batch = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod callback;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod pool;
pub mod progress;
pub mod report;
pub mod storage;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::{ConversionBackend, HttpBackend};
pub use callback::{BatchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use config::{BatchConfig, BatchConfigBuilder};
pub use dispatch::{BatchPlan, BatchSummary, Dispatcher, DispatcherState};
pub use error::{BatchError, JobError, StorageError};
pub use job::{Job, JobStatus};
pub use pool::{BackendPool, Endpoint, EndpointLease};
pub use progress::{BatchStatus, FailedEntry, ProcessedEntry, ProgressRecord, ProgressTracker};
pub use report::Report;
pub use storage::{LocalStore, Location, ObjectStore};
#[cfg(feature = "s3")]
pub use storage::S3Store;
