//! Bounded-concurrency worker pool draining a shared [`WorkReceiver`].
//!
//! Each call to [`WorkerPool::spawn`] starts `replicas` tasks running one
//! handler against one queue; a pool may host several handlers. A failing
//! item is logged and recorded, never aborting its siblings. After
//! [`WorkerPool::join`] the caller owns every recorded failure in the
//! returned [`PoolReport`].

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::work::WorkReceiver;

/// One item that failed inside a worker.
#[derive(Debug, Clone)]
pub struct WorkerFailure {
    pub pool: String,
    pub worker: usize,
    pub message: String,
}

/// Outcome of a joined pool. `errors` is the pool's error sink.
#[derive(Debug, Default)]
pub struct PoolReport {
    pub processed: usize,
    pub failed: usize,
    pub errors: Vec<WorkerFailure>,
    /// Workers that died by panic; their in-flight item is lost.
    pub panicked: Vec<QueueError>,
}

impl PoolReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.panicked.is_empty()
    }

    fn merge(&mut self, tally: WorkerTally) {
        self.processed += tally.processed;
        self.failed += tally.failures.len();
        self.errors.extend(tally.failures);
    }
}

#[derive(Default)]
struct WorkerTally {
    processed: usize,
    failures: Vec<WorkerFailure>,
}

pub struct WorkerPool {
    name: String,
    replicas: usize,
    handles: Vec<(usize, JoinHandle<WorkerTally>)>,
    started: Instant,
}

impl WorkerPool {
    /// `replicas` is clamped to at least one worker per handler.
    pub fn new(name: impl Into<String>, replicas: usize) -> Self {
        Self {
            name: name.into(),
            replicas: replicas.max(1),
            handles: Vec::new(),
            started: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start `replicas` workers applying `handler` to items from `queue`.
    /// Workers exit once the queue is closed and drained.
    pub fn spawn<T, F, Fut, E>(&mut self, queue: WorkReceiver<T>, handler: F) -> &mut Self
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let handler = Arc::new(handler);
        let first = self.handles.len();
        for worker in first..first + self.replicas {
            let queue = queue.clone();
            let handler = handler.clone();
            let pool = self.name.clone();
            let handle = tokio::spawn(async move {
                let mut tally = WorkerTally::default();
                while let Some(item) = queue.pop().await {
                    match handler(item).await {
                        Ok(()) => tally.processed += 1,
                        Err(e) => {
                            warn!(pool = %pool, worker, error = %e, "work item failed");
                            tally.failures.push(WorkerFailure {
                                pool: pool.clone(),
                                worker,
                                message: e.to_string(),
                            });
                        }
                    }
                }
                debug!(pool = %pool, worker, processed = tally.processed, "worker drained");
                tally
            });
            self.handles.push((worker, handle));
        }
        self
    }

    /// Wait for every worker and collect their tallies.
    pub async fn join(self) -> PoolReport {
        let mut report = PoolReport::default();
        for (worker, handle) in self.handles {
            match handle.await {
                Ok(tally) => report.merge(tally),
                Err(e) => {
                    let err = QueueError::WorkerPanicked {
                        pool: self.name.clone(),
                        worker,
                        message: e.to_string(),
                    };
                    warn!(pool = %self.name, worker, error = %err, "worker aborted");
                    report.panicked.push(err);
                }
            }
        }
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            pool = %self.name,
            processed = report.processed,
            failed = report.failed,
            panicked = report.panicked.len(),
            elapsed_ms,
            "pool finished"
        );
        report
    }

    /// Run `handler` over a finite list of items and wait for completion.
    pub async fn run_items<T, F, Fut, E>(
        name: impl Into<String>,
        replicas: usize,
        items: impl IntoIterator<Item = T>,
        handler: F,
    ) -> PoolReport
    where
        T: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut pool = WorkerPool::new(name, replicas);
        pool.spawn(WorkReceiver::from_items(items), handler);
        pool.join().await
    }
}
