use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error};

use hbd_core::StorageLocation;
use hbd_storage::{StorageEngine, StorageError};

use crate::error::IngestError;
use crate::retry::RetryPolicy;
use crate::status::{StatusAccumulator, StatusEntry};
use crate::StageContext;

/// A blob waiting to be written, optionally reported to a status stream
/// once it is safely stored.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub location: StorageLocation,
    pub file_name: String,
    pub body: Bytes,
    pub status: Option<StatusEntry>,
}

#[derive(Debug, Default)]
pub struct UploadStats {
    stored: AtomicUsize,
    failed: AtomicUsize,
}

impl UploadStats {
    pub fn stored(&self) -> usize {
        self.stored.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Writes [`UploadJob`]s with bounded retries. Status entries are appended
/// only after the write succeeds, so a status document never points at a
/// file that is not in the store.
pub struct Uploader {
    store: Arc<StorageEngine>,
    retry: RetryPolicy,
    status: Option<Arc<StatusAccumulator>>,
    stats: Arc<UploadStats>,
}

impl Uploader {
    pub fn new(ctx: &StageContext, status: Option<Arc<StatusAccumulator>>) -> Self {
        Self {
            store: ctx.store.clone(),
            retry: ctx.retry_policy(),
            status,
            stats: Arc::new(UploadStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<UploadStats> {
        self.stats.clone()
    }

    pub async fn upload(&self, job: UploadJob) -> Result<(), IngestError> {
        let what = format!("put {}/{}", job.location, job.file_name);
        let body = job.body;
        let result = self
            .retry
            .run(
                &what,
                |e: &StorageError| !matches!(e, StorageError::NotConfigured(_)),
                || self.store.put(&job.location, &job.file_name, body.clone()),
            )
            .await;

        if let Err(e) = result {
            self.stats.failed.fetch_add(1, Ordering::SeqCst);
            error!(location = %job.location, file = %job.file_name, error = %e, "upload failed permanently");
            return Err(e.into());
        }
        self.stats.stored.fetch_add(1, Ordering::SeqCst);
        debug!(location = %job.location, file = %job.file_name, "stored");

        if let (Some(entry), Some(status)) = (job.status, &self.status) {
            status.append(entry)?;
        }
        Ok(())
    }
}
