use thiserror::Error;

use hbd_core::ConfigError;
use hbd_ingest::IngestError;
use hbd_storage::StorageError;

use crate::pipeline::ConnectorState;

#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Fatal: raised before any storage or network activity.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("cannot run phase: connector is {actual}, expected {expected}")]
    InvalidState {
        expected: ConnectorState,
        actual: ConnectorState,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("malformed status document: {0}")]
    MalformedStatus(#[from] serde_json::Error),

    #[error(transparent)]
    Ingest(#[from] IngestError),
}
