//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue closed: every consumer has gone away")]
    Closed,

    #[error("worker {worker} of pool '{pool}' panicked: {message}")]
    WorkerPanicked {
        pool: String,
        worker: usize,
        message: String,
    },
}
