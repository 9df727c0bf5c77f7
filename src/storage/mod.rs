//! Object stores: where source documents come from and Markdown goes to.
//!
//! Both sides of a batch sit behind the same [`ObjectStore`] trait so a run
//! can read from a bucket and write to disk, or the other way round, without
//! the dispatcher knowing which. Keys are always `/`-separated strings
//! relative to the store root.
//!
//! | Store | Location syntax | Listing |
//! |-------|-----------------|---------|
//! | [`LocalStore`] | `path/to/dir` | recursive walk, sorted |
//! | `S3Store` (`s3` feature) | `s3://bucket/prefix` | `ListObjectsV2`, key order |

use crate::error::{BatchError, StorageError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

mod local;
#[cfg(feature = "s3")]
mod s3;

pub use local::LocalStore;
#[cfg(feature = "s3")]
pub use s3::S3Store;

/// A key/blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Enumerate keys under `prefix` whose extension (case-insensitive) is in
    /// `extensions`. The result is finite and sorted, so two listings of an
    /// unchanged store return the same sequence.
    async fn list(&self, prefix: &str, extensions: &[String]) -> Result<Vec<String>, StorageError>;

    /// Read a whole object.
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Write a whole object, replacing any previous content.
    async fn write(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError>;

    /// Human-readable root, e.g. `s3://bucket` or `/data/pdfs`.
    fn describe(&self) -> String;
}

/// Whether `key` ends in one of `extensions` (lowercase, no dot).
pub(crate) fn has_extension(key: &str, extensions: &[String]) -> bool {
    let name = key.rsplit('/').next().unwrap_or(key);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => {
            let ext = ext.to_lowercase();
            extensions.iter().any(|e| *e == ext)
        }
        _ => false,
    }
}

/// A parsed source or destination location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A directory on the local filesystem; keys are relative to it.
    Local(PathBuf),
    /// A bucket plus a key prefix.
    Bucket { bucket: String, prefix: String },
}

impl Location {
    /// Parse `s3://bucket/prefix` or a filesystem path.
    pub fn parse(input: &str) -> Result<Self, BatchError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(BatchError::InvalidConfig("empty storage location".into()));
        }
        if let Some(rest) = input.strip_prefix("s3://") {
            let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
            if bucket.is_empty() {
                return Err(BatchError::InvalidConfig(format!(
                    "'{input}' has no bucket name"
                )));
            }
            return Ok(Location::Bucket {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            });
        }
        Ok(Location::Local(PathBuf::from(input)))
    }

    /// Key prefix inside the store (empty for local directories).
    pub fn prefix(&self) -> &str {
        match self {
            Location::Local(_) => "",
            Location::Bucket { prefix, .. } => prefix,
        }
    }

    /// Open the store this location points at.
    ///
    /// `s3_endpoint` overrides the bucket endpoint for S3-compatible services
    /// (MinIO, Ceph); it is ignored for local paths.
    pub async fn open(
        &self,
        s3_endpoint: Option<&str>,
    ) -> Result<Arc<dyn ObjectStore>, BatchError> {
        match self {
            Location::Local(root) => Ok(Arc::new(LocalStore::new(root.clone()))),
            #[cfg(feature = "s3")]
            Location::Bucket { bucket, .. } => {
                Ok(Arc::new(S3Store::connect(bucket, s3_endpoint).await))
            }
            #[cfg(not(feature = "s3"))]
            Location::Bucket { bucket, .. } => {
                let _ = s3_endpoint;
                Err(BatchError::InvalidConfig(format!(
                    "bucket '{bucket}' requires the `s3` feature"
                )))
            }
        }
    }
}
