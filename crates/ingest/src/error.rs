use thiserror::Error;

use crate::extract::ExtractError;
use crate::source::SourceError;

/// Errors scoped to one work item (one meter, one hour, one upload). The
/// stages log these and move on; none of them aborts a run.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("storage error: {0}")]
    Storage(#[from] hbd_storage::StorageError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("extract error: {0}")]
    Extract(#[from] ExtractError),

    #[error("queue error: {0}")]
    Queue(#[from] hbd_queue::QueueError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}
