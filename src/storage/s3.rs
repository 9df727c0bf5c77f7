//! S3-compatible bucket store.
//!
//! Credentials and region come from the standard AWS environment chain
//! (`AWS_ACCESS_KEY_ID`, `AWS_REGION`, profiles, instance metadata).

use super::{has_extension, ObjectStore};
use crate::error::StorageError;
use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, instrument};

/// A bucket addressed by object keys.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Build a client from the environment.
    ///
    /// `endpoint` points the client at an S3-compatible service and switches
    /// to path-style addressing, which those services generally require.
    pub async fn connect(bucket: &str, endpoint: Option<&str>) -> Self {
        let shared = aws_config::load_from_env().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(url) = endpoint {
            builder = builder.endpoint_url(url).force_path_style(true);
        }
        info!("S3 client initialised for bucket: {}", bucket);
        Self {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_string(),
        }
    }

    /// Wrap an already-configured client.
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

fn remote<E>(err: E) -> StorageError
where
    E: std::error::Error,
{
    StorageError::Remote(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, extensions))]
    async fn list(&self, prefix: &str, extensions: &[String]) -> Result<Vec<String>, StorageError> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(remote)?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    if has_extension(key, extensions) {
                        keys.push(key.to_string());
                    }
                }
            }
        }
        // ListObjectsV2 already returns UTF-8 binary order; sort anyway so
        // listings from every store compare equal.
        keys.sort();
        debug!("Listed {} keys under s3://{}/{}", keys.len(), self.bucket, prefix);
        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn read(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|s| s.is_no_such_key()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    remote(e)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(remote)?
            .into_bytes()
            .to_vec();
        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(data)
    }

    #[instrument(skip(self, body))]
    async fn write(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StorageError> {
        let size = body.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(remote)?;
        debug!("Uploaded {} bytes to s3://{}/{}", size, self.bucket, key);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
