//! Conversion servers: the opaque service that turns a document into text.
//!
//! The orchestration engine only needs one operation, "send these bytes to
//! that endpoint, get text back", so that is all [`ConversionBackend`]
//! exposes. [`HttpBackend`] speaks the Nougat-style `/predict/` contract:
//! a multipart POST with a single `file` field, answered by a JSON string.
//!
//! ## Failure mapping
//!
//! | Outcome | [`JobError`] | Retried |
//! |---------|--------------|---------|
//! | connect / transport failure | `BackendUnreachable` | yes |
//! | client-side timeout | `BackendTimeout` | yes |
//! | HTTP 5xx, 429 | `BackendUnreachable` | yes |
//! | other HTTP 4xx | `InvalidOutput` | no |

use crate::error::JobError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tracing::debug;

/// Maximum number of response-body bytes quoted in an error message.
const ERROR_BODY_PREVIEW: usize = 200;

/// Something that can convert a document at a given endpoint.
#[async_trait]
pub trait ConversionBackend: Send + Sync {
    /// Convert `bytes` (named `file_name`) at `endpoint`, giving up after `timeout`.
    async fn convert(
        &self,
        endpoint: &Url,
        file_name: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<String, JobError>;
}

/// Multipart-over-HTTP conversion client.
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a pre-configured client (proxies, TLS roots, connection pool size).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConversionBackend for HttpBackend {
    async fn convert(
        &self,
        endpoint: &Url,
        file_name: &str,
        bytes: Vec<u8>,
        timeout: Duration,
    ) -> Result<String, JobError> {
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))
            .map_err(|e| unreachable_err(endpoint, e.to_string()))?;
        let form = Form::new().part("file", part);

        debug!("Posting {} to {}", file_name, endpoint);
        let response = self
            .client
            .post(endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .multipart(form)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(endpoint, timeout, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| map_transport_error(endpoint, timeout, e))?;

        if status.is_success() {
            return Ok(body);
        }
        Err(map_status(endpoint, status, &body))
    }
}

/// MIME type advertised for the uploaded file.
pub fn mime_for(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

fn unreachable_err(endpoint: &Url, detail: String) -> JobError {
    JobError::BackendUnreachable {
        endpoint: endpoint.to_string(),
        detail,
    }
}

fn map_transport_error(endpoint: &Url, timeout: Duration, e: reqwest::Error) -> JobError {
    if e.is_timeout() {
        JobError::BackendTimeout {
            endpoint: endpoint.to_string(),
            secs: timeout.as_secs(),
        }
    } else {
        unreachable_err(endpoint, e.to_string())
    }
}

fn map_status(endpoint: &Url, status: StatusCode, body: &str) -> JobError {
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        unreachable_err(endpoint, format!("HTTP {status}"))
    } else {
        JobError::InvalidOutput {
            detail: format!("Backend rejected document: HTTP {status} {}", preview.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("http://127.0.0.1:8002/predict/").unwrap()
    }

    #[test]
    fn mime_by_extension() {
        assert_eq!(mime_for("a.PDF"), "application/pdf");
        assert_eq!(mime_for("page.htm"), "text/html");
        assert_eq!(mime_for("blob"), "application/octet-stream");
    }

    #[test]
    fn server_errors_are_transient() {
        assert!(map_status(&url(), StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(map_status(&url(), StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(map_status(&url(), StatusCode::TOO_MANY_REQUESTS, "").is_transient());
    }

    #[test]
    fn client_errors_are_terminal() {
        let e = map_status(&url(), StatusCode::UNPROCESSABLE_ENTITY, "bad pdf");
        assert!(!e.is_transient());
        assert!(e.to_string().contains("422"), "got: {e}");
        assert!(e.to_string().contains("bad pdf"));
    }
}
