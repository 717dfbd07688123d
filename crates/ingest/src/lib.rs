//! Incremental hourly ingestion stages: gap detection, fetch, standardize
//! and chunked status persistence.

pub mod error;
pub mod extract;
pub mod fetch;
pub mod gap;
pub mod index;
pub mod retry;
pub mod source;
pub mod standardize;
pub mod status;
pub mod upload;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hbd_core::config::PipelineConfig;
use hbd_storage::StorageEngine;

pub use error::IngestError;
pub use extract::{Extraction, ExtractError, Extractor, ExtractorRegistry};
pub use fetch::{FetchStage, FetchStats, RawRecord};
pub use gap::{GapDetector, GapReport};
pub use index::{HourRange, MissedHoursIndex, MissedKey};
pub use retry::RetryPolicy;
pub use source::{HttpSource, SourceError, VendorSource};
pub use standardize::{StandardizeStage, StandardizeStats, StandardizedRecord};
pub use status::{FileRef, StatusAccumulator, StatusDocument, StatusEntry, StatusStream, UpdateRow};
pub use upload::{UploadJob, UploadStats, Uploader};

/// What every stage of one run shares.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<StorageEngine>,
    pub settings: Arc<PipelineConfig>,
    pub run_time: DateTime<Utc>,
}

impl StageContext {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.settings)
    }
}
