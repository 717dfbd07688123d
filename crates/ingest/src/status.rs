//! Chunked status documents for the downstream loader.
//!
//! Every stored file is reported in exactly one status document. Documents
//! never exceed `max_chunk_size` references: a chunk is flushed the moment
//! it fills, and [`StatusAccumulator::finalize`] flushes whatever remains.
//! Documents land at `{path}/{update_prefix}/{update_prefix}-{index}-{run_date}`
//! next to the files they reference; names are deterministic per run so a
//! rerun overwrites instead of duplicating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use hbd_core::config::PipelineConfig;
use hbd_core::hours::HOUR_FILE_FORMAT;
use hbd_core::StorageLocation;
use hbd_queue::batcher::Chunk;
use hbd_queue::{work_queue, ChunkBatcher, QueueError, WorkReceiver, WorkSender};

use crate::error::IngestError;
use crate::upload::UploadJob;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileRef {
    pub bucket: String,
    pub path: String,
    pub filename: String,
}

impl FileRef {
    pub fn new(location: &StorageLocation, filename: impl Into<String>) -> Self {
        Self {
            bucket: location.bucket.clone(),
            path: location.path.clone(),
            filename: filename.into(),
        }
    }

    pub fn location(&self) -> StorageLocation {
        StorageLocation::new(self.bucket.clone(), self.path.clone())
    }
}

/// One warehouse row per standardized reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRow {
    pub hour_id: i64,
    pub participant_id: i64,
    pub meter_id: u64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusEntry {
    pub file: FileRef,
    pub update: Option<UpdateRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusDocument {
    pub amounts: usize,
    pub files: Vec<FileRef>,
    /// Present for the standardize stream only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<UpdateRow>>,
}

impl StatusDocument {
    fn from_entries(stream: StatusStream, entries: Vec<StatusEntry>) -> Self {
        let mut files = Vec::with_capacity(entries.len());
        let mut updates = Vec::new();
        for entry in entries {
            files.push(entry.file);
            updates.extend(entry.update);
        }
        Self {
            amounts: files.len(),
            files,
            updates: match stream {
                StatusStream::Fetch => None,
                StatusStream::Standardize => Some(updates),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusStream {
    Fetch,
    Standardize,
}

impl StatusStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusStream::Fetch => "fetch",
            StatusStream::Standardize => "standardize",
        }
    }
}

type SharedChunk = Arc<Mutex<ChunkBatcher<StatusEntry>>>;

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StatusAccumulator {
    stream: StatusStream,
    update_prefix: String,
    run_date: String,
    max_chunk_size: usize,
    /// Destination → its open chunk. Each chunk has its own lock so appends
    /// to different destinations never contend.
    chunks: Mutex<HashMap<StorageLocation, SharedChunk>>,
    out: Mutex<Option<WorkSender<UploadJob>>>,
    documents: AtomicUsize,
}

impl StatusAccumulator {
    /// Returns the accumulator and the queue its documents are sent to. The
    /// queue closes when [`finalize`](Self::finalize) completes.
    pub fn new(
        stream: StatusStream,
        settings: &PipelineConfig,
        run_time: DateTime<Utc>,
    ) -> (Self, WorkReceiver<UploadJob>) {
        let (tx, rx) = work_queue();
        let accumulator = Self {
            stream,
            update_prefix: settings.update_prefix.clone(),
            run_date: run_time.format(HOUR_FILE_FORMAT).to_string(),
            max_chunk_size: settings.max_chunk_size.max(1),
            chunks: Mutex::new(HashMap::new()),
            out: Mutex::new(Some(tx)),
            documents: AtomicUsize::new(0),
        };
        (accumulator, rx)
    }

    pub fn stream(&self) -> StatusStream {
        self.stream
    }

    /// Status document file name for chunk `index`.
    pub fn document_name(&self, index: usize) -> String {
        format!("{}-{}-{}", self.update_prefix, index, self.run_date)
    }

    /// Documents emitted so far.
    pub fn documents(&self) -> usize {
        self.documents.load(Ordering::SeqCst)
    }

    /// Add a stored file to its destination's chunk. Fails once
    /// [`finalize`](Self::finalize) has closed the document queue.
    pub fn append(&self, entry: StatusEntry) -> Result<(), IngestError> {
        if relock(&self.out).is_none() {
            return Err(QueueError::Closed.into());
        }
        let destination = entry.file.location();
        let chunk = {
            let mut chunks = relock(&self.chunks);
            chunks
                .entry(destination.clone())
                .or_insert_with(|| Arc::new(Mutex::new(ChunkBatcher::new(self.max_chunk_size))))
                .clone()
        };

        let mut batcher = relock(&chunk);
        if let Some(full) = batcher.push(entry) {
            // Emit while still holding the chunk so the next append for this
            // destination cannot overtake a full chunk.
            self.emit(&destination, full)?;
        }
        Ok(())
    }

    /// Flush every open chunk and close the document queue. Returns the
    /// number of documents flushed here.
    pub fn finalize(&self) -> Result<usize, IngestError> {
        let open: Vec<(StorageLocation, SharedChunk)> = relock(&self.chunks)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut flushed = 0;
        for (destination, chunk) in open {
            if let Some(rest) = relock(&chunk).finish() {
                self.emit(&destination, rest)?;
                flushed += 1;
            }
        }
        relock(&self.out).take();
        info!(
            stream = self.stream.as_str(),
            destinations = relock(&self.chunks).len(),
            documents = self.documents(),
            "status accumulator finalized"
        );
        Ok(flushed)
    }

    fn emit(&self, destination: &StorageLocation, chunk: Chunk<StatusEntry>) -> Result<(), IngestError> {
        let document = StatusDocument::from_entries(self.stream, chunk.items);
        let body = serde_json::to_vec(&document)?;
        let job = UploadJob {
            location: destination.join(&self.update_prefix),
            file_name: self.document_name(chunk.index),
            body: Bytes::from(body),
            status: None,
        };
        debug!(
            stream = self.stream.as_str(),
            destination = %destination,
            file = %job.file_name,
            amounts = document.amounts,
            "status chunk flushed"
        );
        relock(&self.out)
            .as_ref()
            .ok_or(QueueError::Closed)?
            .send(job)?;
        self.documents.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
