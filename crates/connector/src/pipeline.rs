//! One incremental run for one participant.
//!
//! A [`Connector`] walks `Configured → GapDetected → Fetched → Standardized
//! → Done`. Each phase drains the previous phase's queue with a bounded
//! [`WorkerPool`] and uploads its artifacts, then flushes its status stream
//! before the next phase starts. Nothing survives a run except what landed
//! in the store, so the next run re-derives its work from there.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use hbd_core::config::PipelineConfig;
use hbd_core::{JobConfig, MeterDescriptor, StorageLocation};
use hbd_ingest::{
    ExtractorRegistry, FetchStage, GapDetector, GapReport, MissedHoursIndex, MissedKey, RawRecord,
    StageContext, StandardizeStage, StatusAccumulator, StatusStream, UploadJob, Uploader, VendorSource,
};
use hbd_queue::{work_queue, PoolReport, WorkReceiver, WorkSender, WorkerPool};
use hbd_storage::StorageEngine;

use crate::error::ConnectorError;

// ── State ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Configured,
    GapDetected,
    Fetched,
    Standardized,
    Done,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Configured => "configured",
            ConnectorState::GapDetected => "gap_detected",
            ConnectorState::Fetched => "fetched",
            ConnectorState::Standardized => "standardized",
            ConnectorState::Done => "done",
        }
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Runtime collaborators ───────────────────────────────────────────

/// Everything a connector needs besides the job itself.
pub struct ConnectorRuntime {
    pub settings: PipelineConfig,
    pub store: Arc<StorageEngine>,
    pub source: Arc<dyn VendorSource>,
    pub registry: Arc<ExtractorRegistry>,
    /// Written to every reading's audit block.
    pub created_by: String,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub meters_checked: usize,
    pub meters_up_to_date: usize,
    pub meters_failed: usize,
    pub missed_entries: usize,
    pub raw_fetched: usize,
    pub raw_cached: usize,
    pub raw_failed: usize,
    pub readings_produced: usize,
    pub readings_skipped: usize,
    /// Raw records rejected as a whole (unparsable body).
    pub records_failed: usize,
    pub uploads_stored: usize,
    pub uploads_failed: usize,
    pub status_documents: usize,
    pub elapsed_ms: u64,
}

// ── Upload phase ────────────────────────────────────────────────────

/// File upload workers for one stage and the status stream they report to.
struct UploadPhase {
    stream: StatusStream,
    accumulator: Arc<StatusAccumulator>,
    documents: WorkReceiver<UploadJob>,
    uploader: Arc<Uploader>,
    pool: WorkerPool,
}

#[derive(Debug, Default)]
struct UploadOutcome {
    stored: usize,
    failed: usize,
    documents: usize,
}

fn spawn_uploads(pool: &mut WorkerPool, queue: WorkReceiver<UploadJob>, uploader: Arc<Uploader>) {
    pool.spawn(queue, move |job: UploadJob| {
        let uploader = uploader.clone();
        async move { uploader.upload(job).await }
    });
}

impl UploadPhase {
    fn start(ctx: &StageContext, stream: StatusStream) -> (Self, WorkSender<UploadJob>) {
        let (accumulator, documents) = StatusAccumulator::new(stream, &ctx.settings, ctx.run_time);
        let accumulator = Arc::new(accumulator);
        let uploader = Arc::new(Uploader::new(ctx, Some(accumulator.clone())));

        let (tx, rx) = work_queue();
        let mut pool = WorkerPool::new(format!("{}-upload", stream.as_str()), ctx.settings.worker_replica);
        spawn_uploads(&mut pool, rx, uploader.clone());

        let phase = Self { stream, accumulator, documents, uploader, pool };
        (phase, tx)
    }

    /// Wait for the file uploads, then flush and store the status documents.
    /// Every sender returned by [`start`](Self::start) must be dropped first.
    async fn finish(self, ctx: &StageContext) -> UploadOutcome {
        let files = self.pool.join().await;
        report_failures(&files);

        if let Err(e) = self.accumulator.finalize() {
            error!(stream = self.stream.as_str(), error = %e, "cannot finalize status stream");
        }

        let status_uploader = Arc::new(Uploader::new(ctx, None));
        let mut pool = WorkerPool::new(format!("{}-status", self.stream.as_str()), ctx.settings.worker_replica);
        spawn_uploads(&mut pool, self.documents, status_uploader.clone());
        report_failures(&pool.join().await);

        let stats = self.uploader.stats();
        let status_stats = status_uploader.stats();
        UploadOutcome {
            stored: stats.stored(),
            failed: stats.failed() + status_stats.failed(),
            documents: status_stats.stored(),
        }
    }
}

/// Drain a pool's error sink. Items were already logged one by one.
fn report_failures(report: &PoolReport) {
    if report.is_clean() {
        return;
    }
    let first = report.errors.first().map(|f| f.message.as_str()).unwrap_or("");
    warn!(
        processed = report.processed,
        failed = report.failed,
        panicked = report.panicked.len(),
        first_error = first,
        "pool finished with skipped items"
    );
    for lost in &report.panicked {
        error!(error = %lost, "worker lost its in-flight item");
    }
}

// ── Connector ───────────────────────────────────────────────────────

pub struct Connector {
    job: JobConfig,
    settings: Arc<PipelineConfig>,
    store: Arc<StorageEngine>,
    source: Arc<dyn VendorSource>,
    registry: Arc<ExtractorRegistry>,
    created_by: String,
    index: Arc<MissedHoursIndex>,
    state: ConnectorState,
    ctx: Option<StageContext>,
    raw: Option<WorkReceiver<RawRecord>>,
    summary: RunSummary,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Decode a dispatcher payload and validate it against `runtime`.
    /// Every failure here is a configuration error raised before any I/O.
    pub fn configure(payload: &[u8], runtime: ConnectorRuntime) -> Result<Self, ConnectorError> {
        runtime.settings.validate()?;
        let job = JobConfig::from_payload(payload)?;
        Self::from_job(job, runtime)
    }

    pub fn from_job(job: JobConfig, runtime: ConnectorRuntime) -> Result<Self, ConnectorError> {
        runtime.settings.validate()?;
        runtime.registry.ensure_supported(&job.meters)?;
        info!(
            participant_id = job.participant_id,
            meters = job.meters.len(),
            window = job.gap_regeneration_window,
            source = runtime.source.name(),
            "connector configured"
        );
        Ok(Self {
            job,
            settings: Arc::new(runtime.settings),
            store: runtime.store,
            source: runtime.source,
            registry: runtime.registry,
            created_by: runtime.created_by,
            index: Arc::new(MissedHoursIndex::new()),
            state: ConnectorState::Configured,
            ctx: None,
            raw: None,
            summary: RunSummary::default(),
        })
    }

    pub fn job(&self) -> &JobConfig {
        &self.job
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn index(&self) -> Arc<MissedHoursIndex> {
        self.index.clone()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Every location status documents are written under: the raw location
    /// and each distinct standardized location.
    pub fn status_locations(&self) -> Vec<StorageLocation> {
        let mut locations = vec![self.job.raw.clone()];
        for meter in &self.job.meters {
            if !locations.contains(&meter.standardized) {
                locations.push(meter.standardized.clone());
            }
        }
        locations
    }

    fn ensure_state(&self, expected: ConnectorState) -> Result<(), ConnectorError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ConnectorError::InvalidState { expected, actual: self.state })
        }
    }

    fn context(&self) -> Result<StageContext, ConnectorError> {
        self.ctx.clone().ok_or(ConnectorError::InvalidState {
            expected: ConnectorState::GapDetected,
            actual: self.state,
        })
    }

    fn reset(&mut self) {
        self.index.clear();
        self.state = ConnectorState::Configured;
        self.ctx = None;
        self.raw = None;
        self.summary = RunSummary::default();
    }

    // ── Phases ──────────────────────────────────────────────────────

    /// Rebuild the missed-hours index for the window ending at `run_time`.
    pub async fn detect_gaps(&mut self, run_time: DateTime<Utc>) -> Result<GapReport, ConnectorError> {
        self.ensure_state(ConnectorState::Configured)?;
        let started = Instant::now();

        let detector = GapDetector::new(
            self.store.clone(),
            self.index.clone(),
            self.job.gap_regeneration_window,
            self.job.fetch_strategy,
            self.settings.worker_replica,
        );
        let report = detector.run(&self.job.meters, run_time).await;

        self.summary.meters_checked = report.meters_checked;
        self.summary.meters_up_to_date = report.meters_up_to_date;
        self.summary.meters_failed = report.meters_failed;
        self.summary.missed_entries = report.missed_entries;
        self.ctx = Some(StageContext {
            store: self.store.clone(),
            settings: self.settings.clone(),
            run_time,
        });
        self.state = ConnectorState::GapDetected;
        info!(
            missed = report.missed_entries,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "gap detection phase complete"
        );
        Ok(report)
    }

    /// Fetch every missed entry, store the raw payloads and buffer them
    /// for standardize.
    pub async fn fetch(&mut self) -> Result<(), ConnectorError> {
        self.ensure_state(ConnectorState::GapDetected)?;
        let ctx = self.context()?;
        let started = Instant::now();

        let (raw_tx, raw_rx) = work_queue();
        let (uploads, upload_tx) = UploadPhase::start(&ctx, StatusStream::Fetch);
        let stage = Arc::new(FetchStage::new(&ctx, self.source.clone(), self.job.raw.clone(), raw_tx, upload_tx));
        let stats = stage.stats();

        let worker = stage.clone();
        let report = WorkerPool::run_items(
            "fetch",
            self.settings.worker_replica,
            self.index.drain(),
            move |(key, meters): (MissedKey, Vec<MeterDescriptor>)| {
                let stage = worker.clone();
                async move { stage.fetch_entry(key, meters).await }
            },
        )
        .await;
        report_failures(&report);
        // Closes the raw and upload queues.
        drop(stage);

        let outcome = uploads.finish(&ctx).await;
        self.summary.raw_fetched = stats.fetched();
        self.summary.raw_cached = stats.cached();
        self.summary.raw_failed = stats.failed();
        self.absorb(outcome);

        self.raw = Some(raw_rx);
        self.state = ConnectorState::Fetched;
        info!(
            fetched = stats.fetched(),
            cached = stats.cached(),
            failed = stats.failed(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "fetch phase complete"
        );
        Ok(())
    }

    /// Turn buffered raw records into canonical readings and store them.
    pub async fn standardize(&mut self) -> Result<(), ConnectorError> {
        self.ensure_state(ConnectorState::Fetched)?;
        let ctx = self.context()?;
        let started = Instant::now();
        let raw = self.raw.take().unwrap_or_else(|| WorkReceiver::from_items(Vec::new()));

        let (uploads, upload_tx) = UploadPhase::start(&ctx, StatusStream::Standardize);
        let stage = Arc::new(StandardizeStage::new(
            self.registry.clone(),
            self.job.participant_id,
            self.created_by.clone(),
            ctx.run_time,
            upload_tx,
        ));
        let stats = stage.stats();

        let worker = stage.clone();
        let mut pool = WorkerPool::new("standardize", self.settings.worker_replica);
        pool.spawn(raw, move |record: RawRecord| {
            let stage = worker.clone();
            async move { stage.process(record).await }
        });
        let report = pool.join().await;
        report_failures(&report);
        drop(stage);

        let outcome = uploads.finish(&ctx).await;
        self.summary.readings_produced = stats.produced();
        self.summary.readings_skipped = stats.skipped();
        self.summary.records_failed = report.failed + report.panicked.len();
        self.absorb(outcome);

        self.state = ConnectorState::Standardized;
        info!(
            produced = stats.produced(),
            skipped = stats.skipped(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "standardize phase complete"
        );
        Ok(())
    }

    pub fn finish(&mut self) -> Result<RunSummary, ConnectorError> {
        self.ensure_state(ConnectorState::Standardized)?;
        self.state = ConnectorState::Done;
        self.index.clear();
        Ok(self.summary.clone())
    }

    fn absorb(&mut self, outcome: UploadOutcome) {
        self.summary.uploads_stored += outcome.stored;
        self.summary.uploads_failed += outcome.failed;
        self.summary.status_documents += outcome.documents;
    }

    /// One full pass. A connector that finished a previous run starts over.
    pub async fn run(&mut self, run_time: DateTime<Utc>) -> Result<RunSummary, ConnectorError> {
        if self.state == ConnectorState::Done {
            self.reset();
        }
        let span = info_span!(
            "connector_run",
            trace_id = %Uuid::new_v4(),
            participant_id = self.job.participant_id
        );
        self.run_phases(run_time).instrument(span).await
    }

    async fn run_phases(&mut self, run_time: DateTime<Utc>) -> Result<RunSummary, ConnectorError> {
        let started = Instant::now();
        info!(run_time = %run_time, meters = self.job.meters.len(), "connector run started");

        self.detect_gaps(run_time).await?;
        self.fetch().await?;
        self.standardize().await?;
        self.summary.elapsed_ms = started.elapsed().as_millis() as u64;
        let summary = self.finish()?;

        info!(
            missed = summary.missed_entries,
            fetched = summary.raw_fetched,
            produced = summary.readings_produced,
            status_documents = summary.status_documents,
            uploads_failed = summary.uploads_failed,
            elapsed_ms = summary.elapsed_ms,
            "connector run finished"
        );
        Ok(summary)
    }
}
