//! Object store client for the provider's flat-file bucket.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{BackoffConfig, ObjectStore, RetryConfig};
use snafu::prelude::*;
use tracing::debug;

use crate::config::ObjectStoreConfig;
use crate::error::{BuildSnafu, ObjectStoreSnafu, StorageError};

/// Read-only client for the upstream flat-file bucket.
#[derive(Clone)]
pub struct FlatFileStore {
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for FlatFileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FlatFileStore")
    }
}

impl FlatFileStore {
    /// Build an S3 client from configuration.
    ///
    /// Transient request failures (refused, reset, timed out) retry
    /// inside the client with bounded exponential backoff.
    pub fn from_config(config: &ObjectStoreConfig) -> Result<Self, StorageError> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key)
            .with_retry(RetryConfig {
                backoff: BackoffConfig::default(),
                max_retries: 5,
                retry_timeout: Duration::from_secs(60),
            });
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder.build().context(BuildSnafu)?;
        Ok(Self {
            store: Arc::new(store),
        })
    }

    /// Wrap an existing object store (used by tests with the in-memory
    /// backend).
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// List all keys under a prefix, sorted lexicographically.
    ///
    /// The underlying listing is paginated by the object store client;
    /// this drains every page.
    pub async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let path = Path::from(prefix);
        let mut listing = self.store.list(Some(&path));
        let mut keys = Vec::new();
        while let Some(meta) = listing.next().await {
            let meta = meta.context(ObjectStoreSnafu)?;
            keys.push(meta.location.to_string());
        }
        keys.sort();
        debug!(prefix, count = keys.len(), "Listed remote prefix");
        Ok(keys)
    }

    /// Fetch one object fully, bounded by `timeout`.
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Bytes, StorageError> {
        let path = Path::from(key);
        let fetch = async {
            self.store
                .get(&path)
                .await
                .context(ObjectStoreSnafu)?
                .bytes()
                .await
                .context(ObjectStoreSnafu)
        };
        match tokio::time::timeout(timeout, fetch).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::FetchTimeout {
                key: key.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}
