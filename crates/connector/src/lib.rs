//! Run orchestration for hourly meter ingestion connectors.

pub mod error;
pub mod handoff;
pub mod pipeline;

pub use error::ConnectorError;
pub use pipeline::{Connector, ConnectorRuntime, ConnectorState, RunSummary};
