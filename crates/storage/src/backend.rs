use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::{Arc, Mutex};

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tracing::info;

use hbd_core::config::AwsConfig;

use crate::error::StorageError;

/// Unified storage backend wrapping object_store.
///
/// Local and in-memory backends hold every bucket under one store, keyed
/// `{bucket}/{key}`. S3 opens one store per bucket on first use.
pub enum StorageBackend {
    Local(LocalBackend),
    S3(S3Backend),
    Memory(MemoryBackend),
}

impl StorageBackend {
    /// Resolve a bucket to the store holding it and the key prefix inside
    /// that store (`None` for the store root).
    pub fn resolve(&self, bucket: &str) -> Result<(Arc<dyn ObjectStore>, Option<String>), StorageError> {
        match self {
            StorageBackend::Local(b) => Ok((b.store.clone(), Some(bucket.to_string()))),
            StorageBackend::Memory(b) => Ok((b.store.clone(), Some(bucket.to_string()))),
            StorageBackend::S3(b) => Ok((b.store_for(bucket)?, None)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StorageBackend::Local(_) => "local",
            StorageBackend::S3(_) => "s3",
            StorageBackend::Memory(_) => "memory",
        }
    }
}

/// Local filesystem backend. Buckets are subdirectories of `data_dir`.
pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
    pub data_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(data_dir: &FsPath) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let canonical = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| StorageError::Other(format!("local filesystem error: {e}")))?;
        info!("Storage: local backend at {}", canonical.display());
        Ok(Self {
            store: Arc::new(store),
            data_dir: canonical,
        })
    }
}

/// Process-local store. Used by tests and dry runs.
pub struct MemoryBackend {
    pub store: Arc<dyn ObjectStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self { store: Arc::new(InMemory::new()) }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// S3 backend with one client per bucket.
pub struct S3Backend {
    aws: AwsConfig,
    stores: Mutex<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl S3Backend {
    pub fn new(aws: &AwsConfig) -> Result<Self, StorageError> {
        if !aws.is_configured() {
            return Err(StorageError::NotConfigured(
                "AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY not set".into(),
            ));
        }
        info!("Storage: S3 backend (region: {})", aws.region);
        Ok(Self {
            aws: aws.clone(),
            stores: Mutex::new(HashMap::new()),
        })
    }

    fn store_for(&self, bucket: &str) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StorageError::Other("S3 store cache poisoned".into()))?;
        if let Some(store) = stores.get(bucket) {
            return Ok(store.clone());
        }
        let store: Arc<dyn ObjectStore> = Arc::new(self.build(bucket)?);
        stores.insert(bucket.to_string(), store.clone());
        Ok(store)
    }

    fn build(&self, bucket: &str) -> Result<object_store::aws::AmazonS3, StorageError> {
        let aws = &self.aws;
        let mut builder = AmazonS3Builder::new().with_region(&aws.region);

        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        match aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                // object_store requires an absolute URL
                let endpoint_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                    endpoint.to_string()
                } else {
                    format!("https://{}", endpoint)
                };
                builder = builder
                    .with_bucket_name(bucket)
                    .with_endpoint(&endpoint_url)
                    .with_allow_http(endpoint_url.starts_with("http://"));
            }
            None => {
                builder = builder.with_url(format!("s3://{}", bucket));
            }
        }

        Ok(builder.build()?)
    }
}
