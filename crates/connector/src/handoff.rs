//! Loader side of the status hand-off.
//!
//! Pending documents sit at `{path}/{update_prefix}/{update_prefix}-*`. A
//! loader reads one, loads its rows, then moves it to
//! `{path}/{processed_prefix}/` under the same name. Moving a document that
//! is already gone fails with a not-found storage error, which a loader
//! retrying after a crash can treat as done.

use tracing::info;

use hbd_core::config::PipelineConfig;
use hbd_core::StorageLocation;
use hbd_ingest::StatusDocument;
use hbd_storage::StorageEngine;

use crate::error::ConnectorError;

/// Names of status documents waiting under `location`, sorted.
pub async fn pending_documents(
    store: &StorageEngine,
    location: &StorageLocation,
    settings: &PipelineConfig,
) -> Result<Vec<String>, ConnectorError> {
    let prefix = format!("{}-", settings.update_prefix);
    let names = store
        .list_with_prefix(&location.join(&settings.update_prefix), None, None)
        .await?
        .into_iter()
        .map(|blob| blob.name)
        .filter(|name| name.starts_with(&prefix))
        .collect();
    Ok(names)
}

pub async fn read_document(
    store: &StorageEngine,
    location: &StorageLocation,
    name: &str,
    settings: &PipelineConfig,
) -> Result<StatusDocument, ConnectorError> {
    let body = store.get(&location.join(&settings.update_prefix), name).await?;
    Ok(serde_json::from_slice(&body)?)
}

pub async fn mark_processed(
    store: &StorageEngine,
    location: &StorageLocation,
    name: &str,
    settings: &PipelineConfig,
) -> Result<(), ConnectorError> {
    store
        .rename(
            &location.join(&settings.update_prefix),
            name,
            &location.join(&settings.processed_prefix),
            name,
        )
        .await?;
    info!(location = %location, document = name, "status document marked processed");
    Ok(())
}
