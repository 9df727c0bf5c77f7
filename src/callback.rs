//! Progress-callback trait for per-job batch events.
//!
//! Inject an [`Arc<dyn BatchProgressCallback>`] via
//! [`crate::config::BatchConfigBuilder::progress_callback`] to receive
//! real-time events as the dispatcher works through the job set.
//!
//! Callers can forward events to a channel, a dashboard, or a terminal
//! progress bar without the library knowing how the host application
//! communicates. The durable record of what happened is the progress file;
//! callbacks are for humans watching a run.
//!
//! # Example
//!
//! ```rust
//! use edgequake_batch::{BatchConfig, BatchProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     completed: AtomicUsize,
//! }
//!
//! impl BatchProgressCallback for CountingCallback {
//!     fn on_job_complete(&self, key: &str, chars_extracted: usize) {
//!         let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
//!         eprintln!("#{done} {key}: {chars_extracted} chars");
//!     }
//! }
//!
//! let config = BatchConfig::builder()
//!     .endpoint("http://127.0.0.1:8002/predict/")
//!     .progress_callback(Arc::new(CountingCallback { completed: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::dispatch::DispatcherState;
use std::sync::Arc;

/// Called by the dispatcher as it processes each job.
///
/// Implementations must be `Send + Sync`: workers run as concurrent tokio
/// tasks, so `on_job_*` methods may be called from several threads at once
/// and in completion order, not submission order. All methods have default
/// no-op implementations so callers only override what they care about.
pub trait BatchProgressCallback: Send + Sync {
    /// Called once the job set is known, before any worker starts.
    ///
    /// # Arguments
    /// * `total_jobs`: jobs that will run in this invocation
    /// * `resumed`   : true when the job set came from an existing progress file
    fn on_batch_start(&self, total_jobs: usize, resumed: bool) {
        let _ = (total_jobs, resumed);
    }

    /// Called when the dispatcher moves to a new lifecycle state.
    fn on_state_change(&self, state: DispatcherState) {
        let _ = state;
    }

    /// Called just before a job is sent to an endpoint (every attempt).
    fn on_job_start(&self, key: &str, endpoint: &str) {
        let _ = (key, endpoint);
    }

    /// Called when a transient failure is about to be retried.
    ///
    /// # Arguments
    /// * `attempt`: 1-based number of the attempt that just failed
    fn on_job_retry(&self, key: &str, attempt: u32, error: &str) {
        let _ = (key, attempt, error);
    }

    /// Called when a job's Markdown has been written.
    fn on_job_complete(&self, key: &str, chars_extracted: usize) {
        let _ = (key, chars_extracted);
    }

    /// Called when a job reaches a terminal failure.
    fn on_job_error(&self, key: &str, error: &str) {
        let _ = (key, error);
    }

    /// Called once after the last in-flight job has finished.
    fn on_batch_complete(&self, succeeded: usize, failed: usize) {
        let _ = (succeeded, failed);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl BatchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::BatchConfig`].
pub type ProgressCallback = Arc<dyn BatchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TrackingCallback {
        starts: AtomicUsize,
        retries: AtomicUsize,
        completes: AtomicUsize,
        errors: AtomicUsize,
        states: Mutex<Vec<DispatcherState>>,
    }

    impl BatchProgressCallback for TrackingCallback {
        fn on_state_change(&self, state: DispatcherState) {
            self.states.lock().unwrap().push(state);
        }

        fn on_job_start(&self, _key: &str, _endpoint: &str) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_retry(&self, _key: &str, _attempt: u32, _error: &str) {
            self.retries.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_complete(&self, _key: &str, _chars: usize) {
            self.completes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_job_error(&self, _key: &str, _error: &str) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_batch_start(5, false);
        cb.on_state_change(DispatcherState::Running);
        cb.on_job_start("a.pdf", "http://127.0.0.1:8002/");
        cb.on_job_retry("a.pdf", 1, "timeout");
        cb.on_job_complete("a.pdf", 42);
        cb.on_job_error("b.pdf", "some error");
        cb.on_batch_complete(4, 1);
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();

        tracker.on_state_change(DispatcherState::Listing);
        tracker.on_state_change(DispatcherState::Running);
        tracker.on_job_start("a.pdf", "e1");
        tracker.on_job_complete("a.pdf", 100);
        tracker.on_job_start("b.pdf", "e2");
        tracker.on_job_retry("b.pdf", 1, "timeout");
        tracker.on_job_start("b.pdf", "e1");
        tracker.on_job_error("b.pdf", "timeout");

        assert_eq!(tracker.starts.load(Ordering::SeqCst), 3);
        assert_eq!(tracker.retries.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.completes.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.errors.load(Ordering::SeqCst), 1);
        assert_eq!(
            *tracker.states.lock().unwrap(),
            vec![DispatcherState::Listing, DispatcherState::Running]
        );
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_batch_start(10, true);
        cb.on_job_complete("a.pdf", 512);
    }
}
