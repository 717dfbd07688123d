//! connector-worker: one incremental ingestion pass for one job.
//!
//! Reads a dispatcher payload (or plain job JSON), builds the storage
//! backend from the environment, runs gap detection, fetch and standardize,
//! then logs the run summary and the status documents awaiting the loader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use tracing::info;

use hbd_connector::{handoff, Connector, ConnectorRuntime};
use hbd_core::{Config, JobConfig};
use hbd_ingest::{ExtractorRegistry, HttpSource};
use hbd_storage::StorageEngine;

// ── CLI ─────────────────────────────────────────────────────────────

/// Hourly meter ingestion connector.
#[derive(Parser, Debug)]
#[command(name = "connector-worker", version, about)]
struct Cli {
    /// Job payload file.
    #[arg(long, env = "CONNECTOR_PAYLOAD")]
    payload: PathBuf,

    /// The payload is plain job JSON rather than a base64 dispatcher envelope.
    #[arg(long)]
    plain: bool,

    /// Vendor endpoint, overriding `extra.endpoint` in the job.
    #[arg(long, env = "CONNECTOR_ENDPOINT")]
    endpoint: Option<String>,

    /// Run time (RFC 3339). Defaults to now.
    #[arg(long)]
    run_time: Option<DateTime<Utc>>,

    /// Audit author written to every reading.
    #[arg(long, env = "CONNECTOR_CREATED_BY", default_value = "connector-worker")]
    created_by: String,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    hbd_core::config::load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let payload = std::fs::read(&cli.payload)
        .with_context(|| format!("cannot read payload {}", cli.payload.display()))?;
    let mut job = if cli.plain {
        JobConfig::from_json(&payload)?
    } else {
        JobConfig::from_payload(&payload)?
    };
    if let Some(endpoint) = cli.endpoint {
        job.endpoint = Some(endpoint);
    }

    let timeout = Duration::from_secs(config.pipeline.request_timeout_secs);
    let source = HttpSource::from_job(&job, timeout)?;
    let store = Arc::new(StorageEngine::from_config(&config)?);
    let runtime = ConnectorRuntime {
        settings: config.pipeline.clone(),
        store: store.clone(),
        source: Arc::new(source),
        registry: Arc::new(ExtractorRegistry::builtin()),
        created_by: cli.created_by,
    };

    let mut connector = Connector::from_job(job, runtime)?;
    let run_time = cli.run_time.unwrap_or_else(Utc::now);
    let summary = connector.run(run_time).await?;
    info!(?summary, "run summary");

    for location in connector.status_locations() {
        let pending = handoff::pending_documents(&store, &location, &config.pipeline).await?;
        if !pending.is_empty() {
            info!(location = %location, documents = pending.len(), "status documents awaiting loader");
        }
    }

    info!("connector-worker exited cleanly");
    Ok(())
}
