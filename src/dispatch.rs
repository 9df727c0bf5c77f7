//! Batch dispatcher: the state machine that drives a whole run.
//!
//! ```text
//! Idle ──▶ Listing ──▶ Running ──▶ Draining ──▶ Completed
//!            │            ▲
//!            └ skipped ───┘  (progress file found: resume)
//! ```
//!
//! `Running` spawns `max_workers` tasks that share one job queue. Each task
//! pops a job, runs it through the retry controller, and hands the outcome
//! to the progress tracker; that hand-off is the only place per-job state is
//! recorded. When the queue runs dry the dispatcher is `Draining` until the
//! last in-flight job finishes. A batch reaches `Completed` even when jobs
//! failed: failure is a per-job outcome, not a batch-level one.
//!
//! There is no cancellation token. Stopping a run means killing the process;
//! the progress file is flushed after every job, so the next run resumes from
//! the last finished one.

use crate::backend::ConversionBackend;
use crate::callback::BatchProgressCallback;
use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::job::{build_jobs, join_key, Job};
use crate::pipeline::execute::JobExecutor;
use crate::pipeline::lister::list_sources;
use crate::pipeline::retry::{run_with_retry, RetryOutcome, RetryPolicy};
use crate::pool::BackendPool;
use crate::progress::{
    self, batch_id_from, progress_path, Completion, FailedEntry, ProcessedEntry, ProgressRecord,
    ProgressTracker,
};
use crate::report::{self, Report};
use crate::storage::ObjectStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Lifecycle state of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Listing,
    Running,
    Draining,
    Completed,
}

/// The job set a run would execute, computed without side effects.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub batch_id: String,
    pub progress_path: PathBuf,
    /// True when the job set came from an existing progress file.
    pub resumed: bool,
    /// Jobs to run, in queue order.
    pub jobs: Vec<Job>,
    /// The record the run starts from.
    pub record: ProgressRecord,
}

/// What a finished run hands back.
#[derive(Debug, Clone)]
pub struct BatchSummary {
    pub batch_id: String,
    pub progress_path: PathBuf,
    /// Final progress record.
    pub record: ProgressRecord,
    pub report: Report,
    /// Local report file, if it could be written.
    pub report_path: Option<PathBuf>,
    /// Jobs that succeeded / failed in this invocation only.
    pub succeeded: usize,
    pub failed: usize,
}

/// Drives one batch from listing (or resume) to report.
pub struct Dispatcher {
    config: BatchConfig,
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    backend: Arc<dyn ConversionBackend>,
    state: Mutex<DispatcherState>,
}

impl Dispatcher {
    pub fn new(
        config: BatchConfig,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        backend: Arc<dyn ConversionBackend>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
            backend,
            state: Mutex::new(DispatcherState::Idle),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Batch id: the configured override, or one derived from the source
    /// location.
    pub fn batch_id(&self) -> String {
        match &self.config.batch_id {
            Some(id) => id.clone(),
            None => batch_id_from(&join_key(
                self.source.describe().trim_end_matches('/'),
                &self.config.source_prefix,
            )),
        }
    }

    /// Path of this batch's progress file.
    pub fn progress_path(&self) -> PathBuf {
        progress_path(&self.config.progress_dir, &self.batch_id())
    }

    /// Work out what [`run`](Self::run) would do, without writing anything.
    pub async fn plan(&self) -> Result<BatchPlan, BatchError> {
        self.prepare(false).await
    }

    /// Run the batch to completion.
    ///
    /// Returns `Err` only for batch-fatal problems: the source could not be
    /// listed, the progress file is corrupt or cannot be written, or a worker
    /// task died. Individual job failures are recorded and reported.
    pub async fn run(&self) -> Result<BatchSummary, BatchError> {
        let started = Instant::now();
        let plan = self.prepare(true).await?;
        let BatchPlan {
            batch_id,
            progress_path,
            resumed,
            jobs,
            record,
        } = plan;

        info!(
            "Batch {}: {} job(s) to run{} ({} already processed, {} failed)",
            batch_id,
            jobs.len(),
            if resumed { " (resumed)" } else { "" },
            record.processed.len(),
            record.failed.len()
        );

        let tracker = Arc::new(ProgressTracker::new(&progress_path, record));
        tracker.flush().await?;

        let callback = self.config.progress_callback.clone();
        if let Some(cb) = &callback {
            cb.on_batch_start(jobs.len(), resumed);
        }
        self.set_state(DispatcherState::Running);

        let (succeeded, failed) = self.drive(jobs, &tracker, callback.clone()).await?;

        let record = tracker.finalize().await?;
        self.set_state(DispatcherState::Completed);
        if let Some(cb) = &callback {
            cb.on_batch_complete(succeeded, failed);
        }

        let report = report::generate(&record, &batch_id);
        let report_path = match report::save(&report, &self.config.progress_dir).await {
            Ok(path) => Some(path),
            Err(e) => {
                error!("Failed to save report: {}", e);
                None
            }
        };
        if self.config.publish_report {
            if let Err(e) =
                report::publish(&report, self.destination.as_ref(), &self.config.destination_prefix)
                    .await
            {
                error!("Failed to upload report: {}", e);
            }
            if let Err(e) = progress::publish(
                &record,
                self.destination.as_ref(),
                &self.config.destination_prefix,
                &batch_id,
            )
            .await
            {
                error!("Failed to upload progress record: {}", e);
            }
        }

        info!(
            "Batch {} complete in {:.1}s: {} succeeded, {} failed this run (overall success rate {})",
            batch_id,
            started.elapsed().as_secs_f64(),
            succeeded,
            failed,
            report.metadata.success_rate
        );

        Ok(BatchSummary {
            batch_id,
            progress_path,
            record,
            report,
            report_path,
            succeeded,
            failed,
        })
    }

    // ── Preparation ──────────────────────────────────────────────────────

    async fn prepare(&self, emit_states: bool) -> Result<BatchPlan, BatchError> {
        let batch_id = self.batch_id();
        let path = progress_path(&self.config.progress_dir, &batch_id);

        let (record, resumed) = match progress::load(&path).await? {
            Some(mut record) => {
                info!("Resuming from {}", path.display());
                if self.config.retry_failed {
                    let moved = record.requeue_failed();
                    info!("Re-queued {} failed job(s) for retry", moved);
                    if let Some(retry) = &self.config.retry_destination_prefix {
                        info!("Re-run output goes under '{}'", retry);
                    }
                }
                (record, true)
            }
            None => {
                if emit_states {
                    self.set_state(DispatcherState::Listing);
                }
                let keys = list_sources(
                    self.source.as_ref(),
                    &self.config.source_prefix,
                    &self.config.extensions,
                )
                .await?;
                (ProgressRecord::new(keys), false)
            }
        };

        let jobs = pending_jobs(
            &record,
            &self.config.source_prefix,
            &self.config.destination_prefix,
            self.config.retry_destination_prefix.as_deref(),
        );
        Ok(BatchPlan {
            batch_id,
            progress_path: path,
            resumed,
            jobs,
            record,
        })
    }

    // ── Worker pool ──────────────────────────────────────────────────────

    async fn drive(
        &self,
        jobs: Vec<Job>,
        tracker: &Arc<ProgressTracker>,
        callback: Option<Arc<dyn BatchProgressCallback>>,
    ) -> Result<(usize, usize), BatchError> {
        let worker_count = self.config.max_workers.min(jobs.len()).max(1);
        let context = Arc::new(WorkerContext {
            queue: Mutex::new(VecDeque::from(jobs)),
            pool: Arc::new(BackendPool::new(
                self.config.endpoints.clone(),
                self.config.per_endpoint_limit(),
            )),
            executor: JobExecutor::new(
                Arc::clone(&self.source),
                Arc::clone(&self.destination),
                Arc::clone(&self.backend),
                Duration::from_secs(self.config.timeout_secs),
                self.config.min_output_chars,
            ),
            policy: RetryPolicy::new(
                self.config.max_retries,
                Duration::from_millis(self.config.retry_backoff_ms),
            ),
            tracker: Arc::clone(tracker),
            callback,
        });

        let mut join_set = tokio::task::JoinSet::new();
        for id in 0..worker_count {
            let ctx = Arc::clone(&context);
            join_set.spawn(async move { worker(id, ctx).await });
        }
        debug!("Spawned {} worker(s)", worker_count);

        let (mut succeeded, mut failed) = (0usize, 0usize);
        while let Some(res) = join_set.join_next().await {
            // A worker only returns once the queue is empty.
            if self.state() == DispatcherState::Running {
                self.set_state(DispatcherState::Draining);
            }
            let tally = res.map_err(|e| {
                BatchError::Internal(format!("worker task failed: {e}"))
            })?;
            succeeded += tally.succeeded;
            failed += tally.failed;
        }
        Ok((succeeded, failed))
    }

    fn set_state(&self, next: DispatcherState) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            debug!("Dispatcher {:?} → {:?}", *state, next);
            *state = next;
        }
        if let Some(cb) = &self.config.progress_callback {
            cb.on_state_change(next);
        }
    }
}

/// Jobs for the record's pending keys, in pending order.
///
/// Destination names are derived over the sorted union of every key in the
/// record, which is the order a fresh listing produced. A resumed job
/// therefore gets the same destination key it would have had originally.
/// Keys re-queued by a retry pass get the same name under `retry_prefix`
/// when one is set.
fn pending_jobs(
    record: &ProgressRecord,
    source_prefix: &str,
    destination_prefix: &str,
    retry_prefix: Option<&str>,
) -> Vec<Job> {
    let mut all: Vec<String> = record
        .processed
        .iter()
        .map(|e| e.file.clone())
        .chain(record.failed.iter().map(|e| e.file.clone()))
        .chain(record.pending.iter().cloned())
        .collect();
    all.sort();

    let pending: HashSet<&str> = record.pending.iter().map(String::as_str).collect();
    let index = |prefix: &str| -> HashMap<String, Job> {
        build_jobs(&all, source_prefix, prefix)
            .into_iter()
            .filter(|j| pending.contains(j.source_key.as_str()))
            .map(|j| (j.source_key.clone(), j))
            .collect()
    };
    let mut by_key = index(destination_prefix);
    let mut retry_by_key = match retry_prefix {
        Some(prefix) if !record.requeued.is_empty() => index(prefix),
        _ => HashMap::new(),
    };
    let requeued: HashSet<&str> = record.requeued.iter().map(String::as_str).collect();

    record
        .pending
        .iter()
        .filter_map(|k| {
            let primary = by_key.remove(k);
            if requeued.contains(k.as_str()) {
                retry_by_key.remove(k).or(primary)
            } else {
                primary
            }
        })
        .collect()
}

// ── Worker ────────────────────────────────────────────────────────────────

struct WorkerContext {
    queue: Mutex<VecDeque<Job>>,
    pool: Arc<BackendPool>,
    executor: JobExecutor,
    policy: RetryPolicy,
    tracker: Arc<ProgressTracker>,
    callback: Option<Arc<dyn BatchProgressCallback>>,
}

impl WorkerContext {
    fn next_job(&self) -> Option<Job> {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
    }
}

#[derive(Debug, Default)]
struct WorkerTally {
    succeeded: usize,
    failed: usize,
}

async fn worker(id: usize, ctx: Arc<WorkerContext>) -> WorkerTally {
    let mut tally = WorkerTally::default();
    while let Some(mut job) = ctx.next_job() {
        let outcome = run_with_retry(
            &mut job,
            &ctx.pool,
            &ctx.executor,
            ctx.policy,
            ctx.callback.as_deref(),
        )
        .await;

        let completion = completion_for(&job, outcome);
        match &completion {
            Completion::Processed(entry) => {
                tally.succeeded += 1;
                info!(
                    "Processed {} → {} ({} chars, {:.1}s, {})",
                    entry.file, entry.markdown_file, entry.chars_extracted, entry.time_sec, entry.server_used
                );
                if let Some(cb) = &ctx.callback {
                    cb.on_job_complete(&entry.file, entry.chars_extracted);
                }
            }
            Completion::Failed(entry) => {
                tally.failed += 1;
                warn!(
                    "Failed {} after {} attempt(s): {}",
                    entry.file, entry.attempts, entry.error
                );
                if let Some(cb) = &ctx.callback {
                    cb.on_job_error(&entry.file, &entry.error);
                }
            }
        }

        if let Err(e) = ctx.tracker.mark_done(completion).await {
            // The in-memory record is up to date; the next flush catches up.
            error!("Failed to persist progress: {}", e);
        }
    }
    debug!("Worker {} finished", id);
    tally
}

fn completion_for(job: &Job, outcome: RetryOutcome) -> Completion {
    let finished_at = Some(Utc::now());
    match outcome.result {
        Ok(done) => Completion::Processed(ProcessedEntry {
            file: job.source_key.clone(),
            markdown_file: job.destination_key.clone(),
            chars_extracted: done.chars_extracted,
            time_sec: done.elapsed_seconds,
            server_used: outcome.server_used,
            attempts: outcome.attempts,
            finished_at,
        }),
        Err(e) => Completion::Failed(FailedEntry {
            file: job.source_key.clone(),
            error: e.to_string(),
            attempts: outcome.attempts,
            server_used: Some(outcome.server_used),
            finished_at,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(key: &str) -> FailedEntry {
        FailedEntry {
            file: key.into(),
            error: "boom".into(),
            attempts: 1,
            server_used: None,
            finished_at: None,
        }
    }

    #[test]
    fn pending_jobs_keep_original_destinations() {
        // "a b.pdf" and "a_b.pdf" collide; "a b.pdf" sorts first and owns the
        // plain name even though only "a_b.pdf" is still pending.
        let mut record = ProgressRecord::new(vec!["in/a_b.pdf".into()]);
        record.failed.push(failed("in/a b.pdf"));

        let jobs = pending_jobs(&record, "in", "out", None);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].source_key, "in/a_b.pdf");
        assert!(jobs[0].destination_key.starts_with("out/a_b_"));
    }

    #[test]
    fn pending_jobs_follow_pending_order() {
        let record = ProgressRecord::new(vec!["c.pdf".into(), "a.pdf".into(), "b.pdf".into()]);
        let keys: Vec<_> = pending_jobs(&record, "", "md", None)
            .into_iter()
            .map(|j| j.source_key)
            .collect();
        assert_eq!(keys, vec!["c.pdf", "a.pdf", "b.pdf"]);
    }

    #[test]
    fn requeued_jobs_go_to_retry_prefix() {
        let mut record = ProgressRecord::new(vec!["in/new.pdf".into()]);
        record.failed.push(failed("in/old.pdf"));
        record.requeue_failed();

        let jobs = pending_jobs(&record, "in", "out", Some("out_retry"));
        let dest: HashMap<_, _> = jobs
            .iter()
            .map(|j| (j.source_key.as_str(), j.destination_key.as_str()))
            .collect();
        assert_eq!(dest["in/new.pdf"], "out/new.md");
        assert_eq!(dest["in/old.pdf"], "out_retry/old.md");

        // Without a retry prefix everything stays under the destination.
        let jobs = pending_jobs(&record, "in", "out", None);
        assert!(jobs.iter().all(|j| j.destination_key.starts_with("out/")));
    }
}
