pub mod batcher;
pub mod error;
pub mod pool;
pub mod work;

pub use batcher::{Chunk, ChunkBatcher};
pub use error::QueueError;
pub use pool::{PoolReport, WorkerFailure, WorkerPool};
pub use work::{work_queue, WorkReceiver, WorkSender};
