//! Retry controller: bounded exponential backoff around the job executor.
//!
//! ## Retry Strategy
//!
//! Conversion servers drop connections and stall under GPU memory pressure,
//! so `BackendUnreachable` and `BackendTimeout` are retried with backoff
//! (`base_delay * 2^(attempt-1)`): with a 1 s base and 3 retries the waits
//! are 1 s → 2 s → 4 s. Every other [`JobError`] fails the job on first
//! occurrence.
//!
//! Each attempt acquires an endpoint afresh from the [`BackendPool`], so a
//! retry may land on a different server. The lease is dropped before the
//! backoff sleep; a sleeping job does not count against any endpoint.

use crate::callback::BatchProgressCallback;
use crate::error::JobError;
use crate::job::{Job, JobStatus};
use crate::pipeline::execute::{ExecutionOutcome, JobExecutor};
use crate::pool::BackendPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How many times to retry transient failures, and how long to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

/// Final outcome of a job after all attempts.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    pub result: Result<ExecutionOutcome, JobError>,
    /// Total attempts made (1 + retries).
    pub attempts: u32,
    /// Endpoint of the last attempt.
    pub server_used: String,
}

/// Run `job` until it succeeds, fails terminally, or exhausts `policy`.
///
/// Updates `job.backend`, `job.attempt` and `job.status` as it goes.
pub async fn run_with_retry(
    job: &mut Job,
    pool: &Arc<BackendPool>,
    executor: &JobExecutor,
    policy: RetryPolicy,
    callback: Option<&dyn BatchProgressCallback>,
) -> RetryOutcome {
    job.status = JobStatus::InProgress;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let lease = pool.acquire().await;
        let endpoint = lease.address().clone();
        job.backend = Some(endpoint.clone());
        job.attempt = attempt;

        if let Some(cb) = callback {
            cb.on_job_start(&job.source_key, endpoint.as_str());
        }
        debug!(key = %job.source_key, endpoint = %endpoint, attempt, "Attempt started");

        let result = executor.execute(job, &endpoint).await;
        drop(lease);

        let err = match result {
            Ok(outcome) => {
                job.status = JobStatus::Succeeded;
                return RetryOutcome {
                    result: Ok(outcome),
                    attempts: attempt,
                    server_used: endpoint.to_string(),
                };
            }
            Err(e) => e,
        };

        let retries_used = attempt - 1;
        if !err.is_transient() || retries_used >= policy.max_retries {
            if err.is_transient() {
                warn!(
                    key = %job.source_key,
                    "Giving up after {} attempt(s): {}", attempt, err
                );
            } else {
                warn!(key = %job.source_key, "Terminal failure: {}", err);
            }
            job.status = JobStatus::Failed;
            return RetryOutcome {
                result: Err(err),
                attempts: attempt,
                server_used: endpoint.to_string(),
            };
        }

        let backoff = policy.delay_for(attempt);
        warn!(
            key = %job.source_key,
            "Attempt {} failed ({}); retry {}/{} after {}ms",
            attempt,
            err,
            attempt,
            policy.max_retries,
            backoff.as_millis()
        );
        if let Some(cb) = callback {
            cb.on_job_retry(&job.source_key, attempt, &err.to_string());
        }
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ConversionBackend;
    use crate::storage::LocalStore;
    use async_trait::async_trait;
    use reqwest::Url;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Pops one scripted result per call and records the endpoint used.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, JobError>>>,
        seen: Mutex<Vec<u16>>,
    }

    #[async_trait]
    impl ConversionBackend for Scripted {
        async fn convert(
            &self,
            endpoint: &Url,
            _file_name: &str,
            _bytes: Vec<u8>,
            _timeout: Duration,
        ) -> Result<String, JobError> {
            self.seen.lock().unwrap().push(endpoint.port().unwrap_or(0));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("x".repeat(100)))
        }
    }

    fn timeout_err() -> JobError {
        JobError::BackendTimeout {
            endpoint: "http://127.0.0.1:8002/predict/".into(),
            secs: 1,
        }
    }

    fn harness(script: Vec<Result<String, JobError>>) -> (TempDir, Arc<Scripted>, JobExecutor, Arc<BackendPool>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.pdf"), b"%PDF").unwrap();
        let store = Arc::new(LocalStore::new(dir.path()));
        let backend = Arc::new(Scripted {
            script: Mutex::new(script.into()),
            seen: Mutex::new(Vec::new()),
        });
        let exec = JobExecutor::new(
            store.clone(),
            store,
            backend.clone(),
            Duration::from_secs(5),
            50,
        );
        let pool = Arc::new(BackendPool::new(
            vec![
                Url::parse("http://127.0.0.1:8002/predict/").unwrap(),
                Url::parse("http://127.0.0.1:8003/predict/").unwrap(),
            ],
            2,
        ));
        (dir, backend, exec, pool)
    }

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::new(3, Duration::from_millis(1000));
        assert_eq!(p.delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.delay_for(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn recovers_after_max_retries_timeouts() {
        let (_dir, backend, exec, pool) =
            harness(vec![Err(timeout_err()), Err(timeout_err()), Err(timeout_err())]);
        let mut job = Job::new("a.pdf", "a.md");

        let out = run_with_retry(&mut job, &pool, &exec, fast(3), None).await;
        assert!(out.result.is_ok());
        assert_eq!(out.attempts, 4);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(backend.seen.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn exhausts_retries_on_persistent_timeout() {
        let script = (0..10).map(|_| Err(timeout_err())).collect();
        let (_dir, _backend, exec, pool) = harness(script);
        let mut job = Job::new("a.pdf", "a.md");

        let out = run_with_retry(&mut job, &pool, &exec, fast(3), None).await;
        assert_eq!(out.attempts, 4);
        assert_eq!(out.result.unwrap_err(), timeout_err());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn short_output_is_not_retried() {
        let (_dir, backend, exec, pool) = harness(vec![Ok("tiny".into())]);
        let mut job = Job::new("a.pdf", "a.md");

        let out = run_with_retry(&mut job, &pool, &exec, fast(3), None).await;
        assert_eq!(out.attempts, 1);
        assert!(matches!(out.result, Err(JobError::InvalidOutput { .. })));
        assert_eq!(backend.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn every_attempt_reacquires_an_endpoint() {
        let (_dir, backend, exec, pool) = harness(vec![Err(timeout_err())]);
        let mut job = Job::new("a.pdf", "a.md");

        let out = run_with_retry(&mut job, &pool, &exec, fast(3), None).await;
        assert_eq!(out.attempts, 2);
        // Pool is idle between attempts, so both land on the first endpoint.
        assert_eq!(*backend.seen.lock().unwrap(), vec![8002, 8002]);
        assert!(pool.snapshot().iter().all(|e| e.in_flight_count == 0));
    }
}
