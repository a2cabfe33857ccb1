//! Object Storage Module
//!
//! The put-only view of object storage used by the cache writer. Transport,
//! signing and credentials are delegated to the `object_store` crate; the
//! production backend is an S3-compatible bucket addressed path-style, which
//! also covers MinIO and similar services.

use crate::config::StorageConfig;
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::sync::Arc;
use tracing::info;

/// Destination for cached transformation results
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Bucket name, for log context
    fn bucket(&self) -> &str;

    /// Unconditionally write `body` under `key`, replacing any existing object
    async fn put_object(&self, key: &str, body: Bytes) -> Result<()>;
}

/// [`ObjectStorage`] backed by any `object_store` implementation
pub struct ObjectStoreStorage {
    bucket: String,
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreStorage {
    pub fn new(bucket: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            bucket: bucket.into(),
            store,
        }
    }

    /// Build an S3 client for the configured bucket and endpoint
    ///
    /// Credentials are read from the standard `AWS_*` environment variables
    /// once, here, at startup.
    pub fn s3(config: &StorageConfig) -> Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_endpoint(&config.endpoint)
            .with_allow_http(config.endpoint.starts_with("http://"))
            .with_virtual_hosted_style_request(false)
            .build()
            .map_err(|e| {
                ProxyError::ConfigError(format!("Failed to build S3 client: {}", e))
            })?;

        info!(
            "Object storage configured: bucket={}, endpoint={}, region={}",
            config.bucket, config.endpoint, config.region
        );

        Ok(Self::new(config.bucket.clone(), Arc::new(store)))
    }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(&self, key: &str, body: Bytes) -> Result<()> {
        let location = Path::from(key);
        self.store.put(&location, PutPayload::from(body)).await?;
        Ok(())
    }
}
