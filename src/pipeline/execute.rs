//! Job execution: one attempt at converting one document on one endpoint.
//!
//! ```text
//! read source ──▶ backend.convert (timeout) ──▶ clean ──▶ length check ──▶ write .md
//! ```
//!
//! The destination write happens only after validation, so a failed attempt
//! never leaves a partial or garbage artefact behind.

use crate::backend::ConversionBackend;
use crate::error::{JobError, StorageError};
use crate::job::Job;
use crate::pipeline::postprocess::{char_count, clean_output};
use crate::storage::ObjectStore;
use reqwest::Url;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Content type of the written artefacts.
pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";

/// Result of a successful attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub chars_extracted: usize,
    pub elapsed_seconds: f64,
}

/// Runs single attempts; shared by every worker.
#[derive(Clone)]
pub struct JobExecutor {
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
    backend: Arc<dyn ConversionBackend>,
    timeout: Duration,
    min_output_chars: usize,
}

impl JobExecutor {
    pub fn new(
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        backend: Arc<dyn ConversionBackend>,
        timeout: Duration,
        min_output_chars: usize,
    ) -> Self {
        Self {
            source,
            destination,
            backend,
            timeout,
            min_output_chars,
        }
    }

    /// Convert `job` on `endpoint` once.
    #[instrument(skip(self, job, endpoint), fields(key = %job.source_key, endpoint = %endpoint))]
    pub async fn execute(&self, job: &Job, endpoint: &Url) -> Result<ExecutionOutcome, JobError> {
        let started = Instant::now();

        let bytes = self
            .source
            .read(&job.source_key)
            .await
            .map_err(|e| JobError::SourceRead {
                key: job.source_key.clone(),
                detail: e.to_string(),
            })?;
        debug!("Read {} bytes", bytes.len());

        // Bound the call here too so backends that ignore the timeout argument
        // still cannot hang a worker.
        let raw = tokio::time::timeout(
            self.timeout,
            self.backend
                .convert(endpoint, job.file_name(), bytes, self.timeout),
        )
        .await
        .map_err(|_| JobError::BackendTimeout {
            endpoint: endpoint.to_string(),
            secs: self.timeout.as_secs(),
        })??;

        let markdown = clean_output(&raw);
        let chars = char_count(&markdown);
        if chars < self.min_output_chars {
            return Err(JobError::too_short(chars, self.min_output_chars));
        }

        self.destination
            .write(
                &job.destination_key,
                markdown.into_bytes(),
                MARKDOWN_CONTENT_TYPE,
            )
            .await
            .map_err(|e| storage_write(&job.destination_key, e))?;

        let elapsed_seconds = started.elapsed().as_secs_f64();
        debug!(chars, elapsed_seconds, "Wrote {}", job.destination_key);
        Ok(ExecutionOutcome {
            chars_extracted: chars,
            elapsed_seconds,
        })
    }
}

fn storage_write(key: &str, e: StorageError) -> JobError {
    JobError::StorageWrite {
        key: key.to_string(),
        detail: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Returns a fixed body, or sleeps past any reasonable timeout.
    struct FixedBackend {
        body: Option<String>,
    }

    #[async_trait]
    impl ConversionBackend for FixedBackend {
        async fn convert(
            &self,
            _endpoint: &Url,
            _file_name: &str,
            _bytes: Vec<u8>,
            _timeout: Duration,
        ) -> Result<String, JobError> {
            match &self.body {
                Some(b) => Ok(b.clone()),
                None => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(String::new())
                }
            }
        }
    }

    fn setup(body: Option<&str>, timeout: Duration) -> (TempDir, JobExecutor, Arc<LocalStore>) {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.pdf"), b"%PDF-1.4").unwrap();
        let source = Arc::new(LocalStore::new(dir.path().join("src")));
        let destination = Arc::new(LocalStore::new(dir.path().join("out")));
        let backend = Arc::new(FixedBackend {
            body: body.map(str::to_string),
        });
        let exec = JobExecutor::new(source, destination.clone(), backend, timeout, 50);
        (dir, exec, destination)
    }

    fn endpoint() -> Url {
        Url::parse("http://127.0.0.1:8002/predict/").unwrap()
    }

    #[tokio::test]
    async fn success_writes_cleaned_markdown() {
        let text = format!("\"# Title\\n\\n{}\"", "x".repeat(60));
        let (_dir, exec, dest) = setup(Some(&text), Duration::from_secs(5));
        let job = Job::new("a.pdf", "md/a.md");

        let out = exec.execute(&job, &endpoint()).await.unwrap();
        assert_eq!(out.chars_extracted, "# Title\n\n".len() + 60);

        let written = String::from_utf8(dest.read("md/a.md").await.unwrap()).unwrap();
        assert!(written.starts_with("# Title\n\nxxx"));
        assert!(written.ends_with('\n'));
    }

    #[tokio::test]
    async fn short_output_fails_without_writing() {
        let (dir, exec, _dest) = setup(Some("\"0123456789\""), Duration::from_secs(5));
        let job = Job::new("a.pdf", "md/a.md");

        let err = exec.execute(&job, &endpoint()).await.unwrap_err();
        assert_eq!(err, JobError::too_short(10, 50));
        assert!(!dir.path().join("out/md/a.md").exists());
    }

    #[tokio::test]
    async fn missing_source_is_terminal() {
        let (_dir, exec, _dest) = setup(Some("ignored"), Duration::from_secs(5));
        let job = Job::new("nope.pdf", "md/nope.md");

        let err = exec.execute(&job, &endpoint()).await.unwrap_err();
        assert!(matches!(err, JobError::SourceRead { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let (_dir, exec, _dest) = setup(None, Duration::from_millis(50));
        let job = Job::new("a.pdf", "md/a.md");

        let err = exec.execute(&job, &endpoint()).await.unwrap_err();
        assert!(matches!(err, JobError::BackendTimeout { .. }), "got: {err}");
        assert!(err.is_transient());
    }
}
