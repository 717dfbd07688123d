pub mod backend;
pub mod error;

use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path;
use object_store::ObjectStore;
use tracing::debug;

use hbd_core::StorageLocation;

pub use backend::{LocalBackend, MemoryBackend, S3Backend, StorageBackend};
pub use error::StorageError;

/// One object returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    /// File name relative to the listed location.
    pub name: String,
    pub size: u64,
}

/// High-level storage engine: config-driven backend exposing the five blob
/// primitives the pipeline relies on (list, get, put, rename, exists).
pub struct StorageEngine {
    pub backend: StorageBackend,
}

impl StorageEngine {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    /// In-memory engine, for tests and dry runs.
    pub fn in_memory() -> Self {
        Self::new(StorageBackend::Memory(MemoryBackend::new()))
    }

    /// Create a StorageEngine from config. `STORAGE_BACKEND` selects
    /// local, s3 or memory.
    pub fn from_config(config: &hbd_core::Config) -> Result<Self, StorageError> {
        let backend = match config.storage.backend.as_str() {
            "s3" => StorageBackend::S3(S3Backend::new(&config.aws)?),
            "memory" => StorageBackend::Memory(MemoryBackend::new()),
            "local" => StorageBackend::Local(LocalBackend::new(&config.storage.data_dir)?),
            other => {
                return Err(StorageError::NotConfigured(format!("unknown storage backend '{other}'")))
            }
        };
        debug!(backend = backend.kind(), "storage engine ready");
        Ok(Self::new(backend))
    }

    fn object_path(&self, loc: &StorageLocation, name: &str) -> Result<(Arc<dyn ObjectStore>, Path), StorageError> {
        let (store, root) = self.backend.resolve(&loc.bucket)?;
        let key = loc.key(name);
        let path = match root {
            Some(root) => Path::from(format!("{root}/{key}")),
            None => Path::from(key),
        };
        Ok((store, path))
    }

    /// List files directly under `loc` (no recursion into sub-paths) whose
    /// names fall inside the inclusive `[start, end]` bounds. Sorted by name.
    pub async fn list_with_prefix(
        &self,
        loc: &StorageLocation,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<Vec<BlobInfo>, StorageError> {
        let (store, root) = self.backend.resolve(&loc.bucket)?;
        let prefix = match (root, loc.path.is_empty()) {
            (Some(root), true) => Some(Path::from(root)),
            (Some(root), false) => Some(Path::from(format!("{root}/{}", loc.path))),
            (None, true) => None,
            (None, false) => Some(Path::from(loc.path.as_str())),
        };

        let listing = match store.list_with_delimiter(prefix.as_ref()).await {
            Ok(listing) => listing,
            Err(object_store::Error::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut blobs: Vec<BlobInfo> = listing
            .objects
            .into_iter()
            .filter_map(|meta| {
                let name = meta.location.filename()?.to_string();
                let after_start = start.map_or(true, |s| name.as_str() >= s);
                let before_end = end.map_or(true, |e| name.as_str() <= e);
                (after_start && before_end).then_some(BlobInfo { name, size: meta.size as u64 })
            })
            .collect();
        blobs.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(location = %loc, count = blobs.len(), "listed blobs");
        Ok(blobs)
    }

    pub async fn get(&self, loc: &StorageLocation, name: &str) -> Result<Bytes, StorageError> {
        let (store, path) = self.object_path(loc, name)?;
        let result = store.get(&path).await?;
        Ok(result.bytes().await?)
    }

    pub async fn put(&self, loc: &StorageLocation, name: &str, body: Bytes) -> Result<(), StorageError> {
        let (store, path) = self.object_path(loc, name)?;
        store.put(&path, body.into()).await?;
        Ok(())
    }

    pub async fn exists(&self, loc: &StorageLocation, name: &str) -> Result<bool, StorageError> {
        let (store, path) = self.object_path(loc, name)?;
        match store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move a blob. Within one bucket this is the store's native rename;
    /// across buckets it is copy then delete.
    pub async fn rename(
        &self,
        from: &StorageLocation,
        from_name: &str,
        to: &StorageLocation,
        to_name: &str,
    ) -> Result<(), StorageError> {
        let (src_store, src) = self.object_path(from, from_name)?;
        if from.bucket == to.bucket {
            let (_, dst) = self.object_path(to, to_name)?;
            src_store.rename(&src, &dst).await?;
        } else {
            let body = self.get(from, from_name).await?;
            self.put(to, to_name, body).await?;
            src_store.delete(&src).await?;
        }
        debug!(from = %from, from_name, to = %to, to_name, "renamed blob");
        Ok(())
    }
}
