//! Closable multi-consumer work queue.
//!
//! Producers hold [`WorkSender`] clones; consumers share one
//! [`WorkReceiver`]. [`WorkReceiver::pop`] waits for the next item and
//! returns `None` only once every sender is dropped and the queue is empty,
//! so consumers never exit while a producer is still enqueueing.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::QueueError;

/// Create a connected sender/receiver pair.
pub fn work_queue<T>() -> (WorkSender<T>, WorkReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (WorkSender { tx }, WorkReceiver { rx: Arc::new(Mutex::new(rx)) })
}

pub struct WorkSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for WorkSender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> WorkSender<T> {
    pub fn send(&self, item: T) -> Result<(), QueueError> {
        self.tx.send(item).map_err(|_| QueueError::Closed)
    }
}

pub struct WorkReceiver<T> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
}

impl<T> Clone for WorkReceiver<T> {
    fn clone(&self) -> Self {
        Self { rx: self.rx.clone() }
    }
}

impl<T> WorkReceiver<T> {
    /// A finite queue holding `items`, already closed for sending.
    pub fn from_items(items: impl IntoIterator<Item = T>) -> Self {
        let (tx, rx) = work_queue();
        for item in items {
            // The receiver is alive, so this cannot fail.
            let _ = tx.send(item);
        }
        rx
    }

    /// Next item, or `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Take everything currently queued without waiting.
    pub async fn drain_ready(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }
}
