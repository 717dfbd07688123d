//! Fetch stage: one raw payload per missed key.
//!
//! A payload already in the raw store is reused; otherwise the vendor is
//! called with bounded retries. Either way the payload is re-persisted and
//! handed to standardize. Only fresh payloads are reported to the fetch
//! status stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use hbd_core::{MeterDescriptor, StorageLocation};
use hbd_queue::WorkSender;
use hbd_storage::StorageEngine;

use crate::error::IngestError;
use crate::index::MissedKey;
use crate::retry::RetryPolicy;
use crate::source::{SourceError, VendorSource};
use crate::status::{FileRef, StatusEntry};
use crate::upload::UploadJob;
use crate::StageContext;

/// A raw payload and every (meter, hour) pair it serves.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub file_name: String,
    pub location: StorageLocation,
    pub body: Bytes,
    pub meters: Vec<MeterDescriptor>,
    pub hours: Vec<DateTime<Utc>>,
    /// Loaded from the raw store rather than fetched.
    pub cached: bool,
}

#[derive(Debug, Default)]
pub struct FetchStats {
    fetched: AtomicUsize,
    cached: AtomicUsize,
    failed: AtomicUsize,
}

impl FetchStats {
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }

    pub fn cached(&self) -> usize {
        self.cached.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }
}

pub struct FetchStage {
    store: Arc<StorageEngine>,
    source: Arc<dyn VendorSource>,
    raw: StorageLocation,
    retry: RetryPolicy,
    records: WorkSender<RawRecord>,
    uploads: WorkSender<UploadJob>,
    stats: Arc<FetchStats>,
}

impl FetchStage {
    pub fn new(
        ctx: &StageContext,
        source: Arc<dyn VendorSource>,
        raw: StorageLocation,
        records: WorkSender<RawRecord>,
        uploads: WorkSender<UploadJob>,
    ) -> Self {
        Self {
            store: ctx.store.clone(),
            source,
            raw,
            retry: ctx.retry_policy(),
            records,
            uploads,
            stats: Arc::new(FetchStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<FetchStats> {
        self.stats.clone()
    }

    /// Stored payload for `name`, if any. Cache trouble is never fatal: the
    /// caller falls back to the vendor.
    async fn cached(&self, name: &str) -> Option<Bytes> {
        match self.store.exists(&self.raw, name).await {
            Ok(true) => match self.store.get(&self.raw, name).await {
                Ok(body) => Some(body),
                Err(e) => {
                    warn!(file = name, error = %e, "cached raw file unreadable, refetching");
                    None
                }
            },
            Ok(false) => None,
            Err(e) => {
                warn!(file = name, error = %e, "raw cache check failed, refetching");
                None
            }
        }
    }

    /// Handle one missed key. Errors are scoped to this key: the hour (or
    /// range) is dropped and left for the next run to rediscover.
    pub async fn fetch_entry(&self, key: MissedKey, meters: Vec<MeterDescriptor>) -> Result<(), IngestError> {
        let file_name = self.source.raw_file_name(&key);

        let (body, cached) = match self.cached(&file_name).await {
            Some(body) => {
                debug!(file = %file_name, "raw file reused from store");
                (body, true)
            }
            None => {
                let what = format!("fetch {} from {}", file_name, self.source.name());
                match self.retry.run(&what, SourceError::is_retryable, || self.source.fetch(&key)).await {
                    Ok(body) if !body.is_empty() => (body, false),
                    Ok(_) => return Err(self.fail(&file_name, SourceError::EmptyResponse(file_name.clone()))),
                    Err(e) => return Err(self.fail(&file_name, e)),
                }
            }
        };

        if cached {
            self.stats.cached.fetch_add(1, Ordering::SeqCst);
        } else {
            self.stats.fetched.fetch_add(1, Ordering::SeqCst);
        }

        self.records.send(RawRecord {
            file_name: file_name.clone(),
            location: self.raw.clone(),
            body: body.clone(),
            meters,
            hours: key.hours(),
            cached,
        })?;

        let status = (!cached).then(|| StatusEntry { file: FileRef::new(&self.raw, &file_name), update: None });
        self.uploads.send(UploadJob {
            location: self.raw.clone(),
            file_name,
            body,
            status,
        })?;
        Ok(())
    }

    fn fail(&self, file_name: &str, e: SourceError) -> IngestError {
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        error!(file = file_name, error = %e, "cannot fetch data, skipping");
        e.into()
    }
}
