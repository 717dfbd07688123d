//! Standardize stage: raw payloads to canonical hourly readings.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use hbd_core::hours::{hour_file_name, hour_id};
use hbd_core::{Audit, MeterDescriptor, StandardizedReading, StorageLocation};
use hbd_queue::WorkSender;

use crate::error::IngestError;
use crate::extract::ExtractorRegistry;
use crate::fetch::RawRecord;
use crate::status::{FileRef, StatusEntry, UpdateRow};
use crate::upload::UploadJob;

/// A canonical reading ready to be stored.
#[derive(Debug, Clone)]
pub struct StandardizedRecord {
    pub file_name: String,
    pub location: StorageLocation,
    pub body: Bytes,
    pub reading: StandardizedReading,
    pub meter: MeterDescriptor,
}

impl StandardizedRecord {
    /// Upload job reporting this reading to the standardize status stream.
    pub fn into_upload(self, participant_id: i64) -> UploadJob {
        let update = UpdateRow {
            hour_id: hour_id(self.reading.start_time),
            participant_id,
            meter_id: self.meter.id,
            value: self.reading.usage,
        };
        UploadJob {
            status: Some(StatusEntry {
                file: FileRef::new(&self.location, &self.file_name),
                update: Some(update),
            }),
            location: self.location,
            file_name: self.file_name,
            body: self.body,
        }
    }
}

#[derive(Debug, Default)]
pub struct StandardizeStats {
    produced: AtomicUsize,
    skipped: AtomicUsize,
}

impl StandardizeStats {
    pub fn produced(&self) -> usize {
        self.produced.load(Ordering::SeqCst)
    }

    /// (meter, hour) pairs dropped for missing or unusable data.
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }
}

pub struct StandardizeStage {
    registry: Arc<ExtractorRegistry>,
    participant_id: i64,
    created_by: String,
    run_time: DateTime<Utc>,
    uploads: WorkSender<UploadJob>,
    stats: Arc<StandardizeStats>,
}

impl StandardizeStage {
    pub fn new(
        registry: Arc<ExtractorRegistry>,
        participant_id: i64,
        created_by: impl Into<String>,
        run_time: DateTime<Utc>,
        uploads: WorkSender<UploadJob>,
    ) -> Self {
        Self {
            registry,
            participant_id,
            created_by: created_by.into(),
            run_time,
            uploads,
            stats: Arc::new(StandardizeStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<StandardizeStats> {
        self.stats.clone()
    }

    /// Every reading `record` yields. Each (meter, hour) pair is independent:
    /// one that cannot be extracted is logged and skipped.
    pub fn standardize(&self, record: &RawRecord) -> Result<Vec<StandardizedRecord>, IngestError> {
        if record.body.iter().all(u8::is_ascii_whitespace) {
            debug!(file = %record.file_name, "empty raw body, nothing to standardize");
            return Ok(Vec::new());
        }
        let body: serde_json::Value = serde_json::from_slice(&record.body).map_err(|e| {
            let pairs = record.meters.len() * record.hours.len();
            self.stats.skipped.fetch_add(pairs, Ordering::SeqCst);
            warn!(file = %record.file_name, error = %e, "raw payload is not JSON, skipping record");
            e
        })?;

        let mut out = Vec::new();
        for hour in &record.hours {
            for meter in &record.meters {
                let extracted = self
                    .registry
                    .get(meter.reading_type)
                    .and_then(|extractor| extractor.extract(&body, *hour, meter));
                let extraction = match extracted {
                    Ok(x) => x,
                    Err(e) => {
                        self.stats.skipped.fetch_add(1, Ordering::SeqCst);
                        warn!(meter = %meter.name, hour = %hour, error = %e, "cannot standardize, skipping");
                        continue;
                    }
                };

                let reading = StandardizedReading {
                    meter_uri: meter.uri.clone(),
                    start_time: extraction.start,
                    end_time: extraction.end,
                    usage: extraction.usage,
                    audit: Audit { created_by: self.created_by.clone(), created_date: self.run_time },
                };
                let body = Bytes::from(reading.to_bytes()?);
                out.push(StandardizedRecord {
                    file_name: hour_file_name(*hour),
                    location: meter.standardized.clone(),
                    body,
                    reading,
                    meter: meter.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Standardize `record` and queue every reading for upload.
    pub async fn process(&self, record: RawRecord) -> Result<(), IngestError> {
        let readings = self.standardize(&record)?;
        let produced = readings.len();
        for reading in readings {
            self.uploads.send(reading.into_upload(self.participant_id))?;
        }
        self.stats.produced.fetch_add(produced, Ordering::SeqCst);
        debug!(file = %record.file_name, produced, "raw record standardized");
        Ok(())
    }
}
