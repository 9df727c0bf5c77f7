//! Configuration types for a batch extraction run.
//!
//! All batch behaviour is controlled through [`BatchConfig`], built via its
//! [`BatchConfigBuilder`]. Every knob the dispatcher consumes lives here and
//! is handed to [`crate::Dispatcher::new`] at construction; nothing is read
//! from globals at run time.

use crate::callback::BatchProgressCallback;
use crate::error::BatchError;
use reqwest::Url;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Configuration for one batch run.
///
/// # Example
/// ```rust
/// use edgequake_batch::BatchConfig;
///
/// let config = BatchConfig::builder()
///     .source_prefix("MS2/sample/pdfs/")
///     .destination_prefix("raw_data_extractions")
///     .endpoint("http://127.0.0.1:8002/predict/")
///     .endpoint("http://127.0.0.1:8003/predict/")
///     .max_workers(4)
///     .build()
///     .unwrap();
/// assert_eq!(config.endpoints.len(), 2);
/// ```
#[derive(Clone)]
pub struct BatchConfig {
    /// Prefix under which source objects are enumerated.
    pub source_prefix: String,

    /// Prefix under which Markdown artefacts are written.
    pub destination_prefix: String,

    /// Conversion server addresses, in declaration order. Never empty once built.
    ///
    /// Declaration order matters: it breaks ties when several endpoints carry
    /// the same number of in-flight jobs.
    pub endpoints: Vec<Url>,

    /// Number of concurrent workers. Default: 4.
    ///
    /// Each endpoint may hold at most `ceil(max_workers / endpoints)` jobs at
    /// once, so raising this without adding servers mostly adds queueing on
    /// the server side.
    pub max_workers: usize,

    /// Per-call backend timeout in seconds. Default: 300.
    ///
    /// Scanned books can take several minutes on a busy GPU; the timeout
    /// exists to unstick hung connections, not to police slow documents.
    pub timeout_secs: u64,

    /// Retries after the first attempt on a transient failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds. Default: 1000.
    ///
    /// Doubles after each attempt: 1 s → 2 s → 4 s.
    pub retry_backoff_ms: u64,

    /// Outputs with fewer characters are failures. Default: 50.
    pub min_output_chars: usize,

    /// Accepted source extensions, lowercase, without the dot. Default: `["pdf"]`.
    pub extensions: Vec<String>,

    /// Directory holding progress and report files. Default: current directory.
    pub progress_dir: PathBuf,

    /// Explicit batch identifier. If None, derived from the source location.
    pub batch_id: Option<String>,

    /// On resume, also re-run jobs recorded as failed. Default: false.
    pub retry_failed: bool,

    /// Prefix for the Markdown of re-run failures. If None, they are written
    /// under `destination_prefix` like every other job.
    ///
    /// Keeps a retry pass's output apart from the first pass, e.g.
    /// `raw_data_extractions_retry`.
    pub retry_destination_prefix: Option<String>,

    /// Upload the final report next to the Markdown output. Default: true.
    pub publish_report: bool,

    /// Per-job event sink (progress bars, dashboards).
    pub progress_callback: Option<Arc<dyn BatchProgressCallback>>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            source_prefix: String::new(),
            destination_prefix: String::new(),
            endpoints: Vec::new(),
            max_workers: 4,
            timeout_secs: 300,
            max_retries: 3,
            retry_backoff_ms: 1000,
            min_output_chars: 50,
            extensions: vec!["pdf".to_string()],
            progress_dir: PathBuf::from("."),
            batch_id: None,
            retry_failed: false,
            retry_destination_prefix: None,
            publish_report: true,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("source_prefix", &self.source_prefix)
            .field("destination_prefix", &self.destination_prefix)
            .field(
                "endpoints",
                &self.endpoints.iter().map(Url::as_str).collect::<Vec<_>>(),
            )
            .field("max_workers", &self.max_workers)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("min_output_chars", &self.min_output_chars)
            .field("extensions", &self.extensions)
            .field("progress_dir", &self.progress_dir)
            .field("batch_id", &self.batch_id)
            .field("retry_failed", &self.retry_failed)
            .field("retry_destination_prefix", &self.retry_destination_prefix)
            .field("publish_report", &self.publish_report)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn BatchProgressCallback>"),
            )
            .finish()
    }
}

impl BatchConfig {
    /// Create a new builder for `BatchConfig`.
    pub fn builder() -> BatchConfigBuilder {
        BatchConfigBuilder {
            config: Self::default(),
            raw_endpoints: Vec::new(),
        }
    }

    /// Upper bound on concurrent jobs per endpoint.
    pub fn per_endpoint_limit(&self) -> usize {
        let n = self.endpoints.len().max(1);
        self.max_workers.div_ceil(n).max(1)
    }
}

/// Builder for [`BatchConfig`].
///
/// Endpoints are collected as strings and parsed in [`build`](Self::build) so
/// every malformed address is reported at startup, not on first use.
#[derive(Debug)]
pub struct BatchConfigBuilder {
    config: BatchConfig,
    raw_endpoints: Vec<String>,
}

impl BatchConfigBuilder {
    pub fn source_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.source_prefix = prefix.into();
        self
    }

    pub fn destination_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.destination_prefix = prefix.into();
        self
    }

    /// Append one endpoint address.
    pub fn endpoint(mut self, address: impl Into<String>) -> Self {
        self.raw_endpoints.push(address.into());
        self
    }

    /// Append several endpoint addresses, keeping their order.
    pub fn endpoints<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.raw_endpoints
            .extend(addresses.into_iter().map(Into::into));
        self
    }

    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn min_output_chars(mut self, n: usize) -> Self {
        self.config.min_output_chars = n;
        self
    }

    /// Replace the accepted extensions. Leading dots and case are normalised.
    pub fn extensions<I, S>(mut self, exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.config.extensions = exts
            .into_iter()
            .map(|e| e.as_ref().trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    pub fn progress_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.progress_dir = dir.into();
        self
    }

    pub fn batch_id(mut self, id: impl Into<String>) -> Self {
        self.config.batch_id = Some(id.into());
        self
    }

    pub fn retry_failed(mut self, v: bool) -> Self {
        self.config.retry_failed = v;
        self
    }

    pub fn retry_destination_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.retry_destination_prefix = Some(prefix.into());
        self
    }

    pub fn publish_report(mut self, v: bool) -> Self {
        self.config.publish_report = v;
        self
    }

    pub fn progress_callback(mut self, cb: Arc<dyn BatchProgressCallback>) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(mut self) -> Result<BatchConfig, BatchError> {
        self.config.endpoints = parse_endpoints(&self.raw_endpoints)?;

        let c = &self.config;
        if c.max_workers == 0 {
            return Err(BatchError::InvalidConfig("max_workers must be ≥ 1".into()));
        }
        if c.timeout_secs == 0 {
            return Err(BatchError::InvalidConfig("timeout must be ≥ 1s".into()));
        }
        if c.extensions.is_empty() {
            return Err(BatchError::InvalidConfig(
                "at least one source extension is required".into(),
            ));
        }
        if let Some(ref id) = c.batch_id {
            if id.trim().is_empty() {
                return Err(BatchError::InvalidConfig("batch id must not be empty".into()));
            }
        }
        if c.retry_destination_prefix.as_deref() == Some(c.destination_prefix.as_str()) {
            return Err(BatchError::InvalidConfig(
                "retry destination must differ from the destination".into(),
            ));
        }
        Ok(self.config)
    }
}

/// Parse and validate endpoint addresses, rejecting duplicates.
fn parse_endpoints(raw: &[String]) -> Result<Vec<Url>, BatchError> {
    if raw.is_empty() {
        return Err(BatchError::InvalidConfig(
            "at least one conversion endpoint is required".into(),
        ));
    }

    let mut urls: Vec<Url> = Vec::with_capacity(raw.len());
    for address in raw {
        let url = Url::parse(address.trim()).map_err(|e| {
            BatchError::InvalidConfig(format!("endpoint '{address}' is not a valid URL: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(BatchError::InvalidConfig(format!(
                "endpoint '{address}' must be an http(s) URL with a host"
            )));
        }
        if urls.contains(&url) {
            return Err(BatchError::InvalidConfig(format!(
                "endpoint '{address}' is listed twice"
            )));
        }
        urls.push(url);
    }
    Ok(urls)
}
