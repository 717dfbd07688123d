//! End-to-end connector runs against an in-memory store and a scripted
//! vendor: gap healing, caching, retries, chunked status and phase order.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};

use hbd_connector::{handoff, Connector, ConnectorError, ConnectorRuntime, ConnectorState};
use hbd_core::config::PipelineConfig;
use hbd_core::hours::{hour_end, hour_file_name, hour_id, truncate_hour};
use hbd_core::{ConfigError, StandardizedReading, StorageLocation};
use hbd_ingest::{ExtractorRegistry, FileRef, MissedKey, SourceError, VendorSource};
use hbd_storage::StorageEngine;

// ============================================================================
// Test Helpers
// ============================================================================

/// Weather vendor that refuses the first `fail_first` calls.
struct ScriptedSource {
    calls: AtomicU32,
    fail_first: u32,
}

impl ScriptedSource {
    fn new(fail_first: u32) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), fail_first })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VendorSource for ScriptedSource {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, _key: &MissedKey) -> Result<Bytes, SourceError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_first {
            return Err(SourceError::BadStatus { status: 503, body: "busy".into() });
        }
        Ok(Bytes::from_static(br#"{"data":[{"temp": 280.5, "humidity": 61}]}"#))
    }
}

fn run_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 20, 0).unwrap()
}

fn t() -> DateTime<Utc> {
    truncate_hour(run_time())
}

fn std_loc(meter: &str) -> StorageLocation {
    StorageLocation::new("std", format!("p1/{meter}"))
}

fn raw_loc() -> StorageLocation {
    StorageLocation::new("raw", "p1/weather")
}

fn job(meters: &[&str], extra: Value) -> Value {
    let mut extra_obj = json!({
        "raw": {"bucket": "raw", "path": "p1/weather"},
        "participant_id": 42,
        "timezone": "UTC",
    });
    if let (Some(base), Some(more)) = (extra_obj.as_object_mut(), extra.as_object()) {
        base.extend(more.clone());
    }
    json!({
        "data": {
            "meters": meters.iter().map(|m| json!({
                "meter_name": m,
                "meter_uri": format!("https://meters.example/{m}"),
                "type": "Ambient Temperature",
                "standardized": {"bucket": "std", "path": format!("p1/{m}")},
            })).collect::<Vec<_>>(),
            "extra": extra_obj,
        }
    })
}

fn envelope(job: &Value) -> Vec<u8> {
    let encoded = STANDARD.encode(serde_json::to_vec(job).unwrap());
    serde_json::to_vec(&json!({ "data": encoded })).unwrap()
}

fn settings() -> PipelineConfig {
    PipelineConfig { worker_replica: 4, retry_delay_ms: 1, ..Default::default() }
}

fn runtime(store: &Arc<StorageEngine>, source: &Arc<ScriptedSource>, settings: PipelineConfig) -> ConnectorRuntime {
    ConnectorRuntime {
        settings,
        store: store.clone(),
        source: source.clone(),
        registry: Arc::new(ExtractorRegistry::builtin()),
        created_by: "pipeline-test".into(),
    }
}

fn connector(store: &Arc<StorageEngine>, source: &Arc<ScriptedSource>, job: &Value) -> Connector {
    Connector::configure(&envelope(job), runtime(store, source, settings())).unwrap()
}

/// Placeholder standardized files for `T - h` for every `h` in `hours_back`.
async fn fill(store: &StorageEngine, meter: &str, hours_back: impl IntoIterator<Item = i64>) {
    for h in hours_back {
        let name = hour_file_name(t() - Duration::hours(h));
        store.put(&std_loc(meter), &name, Bytes::from_static(b"{}")).await.unwrap();
    }
}

async fn status_docs(store: &StorageEngine, loc: &StorageLocation) -> Vec<hbd_ingest::StatusDocument> {
    let settings = PipelineConfig::default();
    let mut docs = Vec::new();
    for name in handoff::pending_documents(store, loc, &settings).await.unwrap() {
        docs.push(handoff::read_document(store, loc, &name, &settings).await.unwrap());
    }
    docs
}

// ============================================================================
// Gap healing
// ============================================================================

#[tokio::test]
async fn single_gap_flows_through_every_stage() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    fill(&store, "a", (0..=24).filter(|h| *h != 5)).await;
    let gap = t() - Duration::hours(5);

    let mut c = connector(&store, &source, &job(&["a"], json!({})));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(c.state(), ConnectorState::Done);
    assert_eq!(summary.meters_checked, 1);
    assert_eq!(summary.missed_entries, 1);
    assert_eq!(summary.raw_fetched, 1);
    assert_eq!(summary.readings_produced, 1);
    assert_eq!(summary.uploads_failed, 0);
    assert_eq!(source.calls(), 1);

    // Raw artifact persisted under its hour name.
    assert!(store.exists(&raw_loc(), &hour_file_name(gap)).await.unwrap());

    // Canonical reading for exactly the missing hour.
    let body = store.get(&std_loc("a"), &hour_file_name(gap)).await.unwrap();
    let reading = StandardizedReading::from_bytes(&body).unwrap();
    assert_eq!(reading.meter_uri, "https://meters.example/a");
    assert_eq!(reading.start_time, gap);
    assert_eq!(reading.end_time, hour_end(gap));
    assert_eq!(reading.end_time - reading.start_time, Duration::minutes(59) + Duration::seconds(59));
    assert_eq!(reading.usage, 280.5);
    assert_eq!(reading.audit.created_by, "pipeline-test");
    assert_eq!(reading.audit.created_date, run_time());

    // One standardize status document referencing that single file.
    let docs = status_docs(&store, &std_loc("a")).await;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].amounts, 1);
    assert_eq!(docs[0].files, vec![FileRef::new(&std_loc("a"), hour_file_name(gap))]);
    let updates = docs[0].updates.as_ref().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].hour_id, hour_id(gap));
    assert_eq!(updates[0].participant_id, 42);
    assert_eq!(updates[0].value, 280.5);

    // One fetch status document, without update rows.
    let raw_docs = status_docs(&store, &raw_loc()).await;
    assert_eq!(raw_docs.len(), 1);
    assert!(raw_docs[0].updates.is_none());
    assert_eq!(summary.status_documents, 2);
}

#[tokio::test]
async fn rerun_finds_nothing_to_do() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    fill(&store, "a", 1..24).await;

    let mut c = connector(&store, &source, &job(&["a"], json!({})));
    let first = c.run(run_time()).await.unwrap();
    assert_eq!(first.readings_produced, 1);

    let second = c.run(run_time()).await.unwrap();
    assert_eq!(second.missed_entries, 0);
    assert_eq!(second.meters_up_to_date, 1);
    assert_eq!(second.raw_fetched, 0);
    assert_eq!(second.status_documents, 0);
    assert_eq!(source.calls(), 1);
}

#[tokio::test]
async fn window_bounds_what_is_fetched() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);

    let mut c = connector(&store, &source, &job(&["a"], json!({"gap_regeneration_window": 3})));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(summary.missed_entries, 3);
    assert_eq!(summary.readings_produced, 3);
    for back in 0..3 {
        let name = hour_file_name(t() - Duration::hours(back));
        assert!(store.exists(&std_loc("a"), &name).await.unwrap(), "missing {name}");
    }
    let outside = hour_file_name(t() - Duration::hours(3));
    assert!(!store.exists(&std_loc("a"), &outside).await.unwrap());
    assert!(!store.exists(&raw_loc(), &outside).await.unwrap());
}

#[tokio::test]
async fn meters_missing_the_same_hour_share_one_fetch() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    fill(&store, "a", 1..4).await;
    fill(&store, "b", 1..4).await;

    let mut c = connector(&store, &source, &job(&["a", "b"], json!({"gap_regeneration_window": 4})));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(summary.missed_entries, 1);
    assert_eq!(source.calls(), 1);
    assert_eq!(summary.readings_produced, 2);
    assert_eq!(status_docs(&store, &std_loc("a")).await.len(), 1);
    assert_eq!(status_docs(&store, &std_loc("b")).await.len(), 1);
}

#[tokio::test]
async fn batch_strategy_fetches_a_month_range_once() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    let extra = json!({"gap_regeneration_window": 3, "fetch_strategy": {"type": "batch"}});

    let mut c = connector(&store, &source, &job(&["a"], extra));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(source.calls(), 1);
    assert_eq!(summary.readings_produced, 3);
    let raw_name = format!(
        "{}_{}",
        hour_file_name(t() - Duration::hours(2)),
        hour_file_name(t())
    );
    assert!(store.exists(&raw_loc(), &raw_name).await.unwrap());
}

// ============================================================================
// Fetch behavior
// ============================================================================

#[tokio::test]
async fn cached_raw_payload_skips_vendor_and_fetch_status() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    fill(&store, "a", 1..24).await;
    let cached = br#"{"data":[{"temp": 275.0}]}"#;
    store.put(&raw_loc(), &hour_file_name(t()), Bytes::from_static(cached)).await.unwrap();

    let mut c = connector(&store, &source, &job(&["a"], json!({})));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(source.calls(), 0);
    assert_eq!(summary.raw_cached, 1);
    assert_eq!(summary.readings_produced, 1);
    assert!(status_docs(&store, &raw_loc()).await.is_empty());
    assert_eq!(status_docs(&store, &std_loc("a")).await.len(), 1);
    let body = store.get(&std_loc("a"), &hour_file_name(t())).await.unwrap();
    assert_eq!(StandardizedReading::from_bytes(&body).unwrap().usage, 275.0);
}

#[tokio::test]
async fn transient_failures_below_the_limit_are_invisible() {
    let store = Arc::new(StorageEngine::in_memory());
    // Default limit is 3 attempts.
    let source = ScriptedSource::new(2);
    fill(&store, "a", 1..24).await;

    let mut c = connector(&store, &source, &job(&["a"], json!({})));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(source.calls(), 3);
    assert_eq!(summary.raw_failed, 0);
    assert_eq!(summary.readings_produced, 1);
    assert_eq!(summary.uploads_failed, 0);
}

#[tokio::test]
async fn always_failing_source_drops_the_hour_everywhere() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(u32::MAX);
    fill(&store, "a", 1..24).await;

    let mut c = connector(&store, &source, &job(&["a"], json!({})));
    let summary = c.run(run_time()).await.unwrap();

    assert_eq!(c.state(), ConnectorState::Done);
    assert_eq!(summary.raw_failed, 1);
    assert_eq!(summary.readings_produced, 0);
    assert_eq!(summary.status_documents, 0);
    assert_eq!(source.calls(), 3);
    assert!(!store.exists(&raw_loc(), &hour_file_name(t())).await.unwrap());
    assert!(!store.exists(&std_loc("a"), &hour_file_name(t())).await.unwrap());
    assert!(status_docs(&store, &raw_loc()).await.is_empty());
    assert!(status_docs(&store, &std_loc("a")).await.is_empty());
}

// ============================================================================
// Status chunking
// ============================================================================

#[tokio::test]
async fn status_documents_respect_chunk_limit() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    let settings = PipelineConfig { max_chunk_size: 2, ..settings() };
    let payload = envelope(&job(&["a"], json!({"gap_regeneration_window": 5})));

    let mut c = Connector::configure(&payload, runtime(&store, &source, settings)).unwrap();
    let summary = c.run(run_time()).await.unwrap();
    assert_eq!(summary.readings_produced, 5);

    let docs = status_docs(&store, &std_loc("a")).await;
    assert_eq!(docs.len(), 3);
    let mut files: Vec<String> = docs.iter().flat_map(|d| d.files.iter().map(|f| f.filename.clone())).collect();
    assert!(docs.iter().all(|d| d.files.len() <= 2));
    files.sort();
    files.dedup();
    assert_eq!(files.len(), 5);
    assert_eq!(status_docs(&store, &raw_loc()).await.len(), 3);
}

// ============================================================================
// Configuration and phase order
// ============================================================================

#[tokio::test]
async fn malformed_payload_fails_before_any_io() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);

    for payload in [&b"not json"[..], &br#"{"data": "%%%"}"#[..]] {
        let err = Connector::configure(payload, runtime(&store, &source, settings())).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(ConfigError::MalformedPayload(_))), "{err}");
    }

    let no_meters = json!({"data": {"meters": [], "extra": {"raw": {"bucket": "raw"}, "participant_id": 1}}});
    let err = Connector::configure(&envelope(&no_meters), runtime(&store, &source, settings())).unwrap_err();
    assert!(matches!(err, ConnectorError::Config(ConfigError::Invalid(_))));

    let bad_settings = PipelineConfig { worker_replica: 0, ..settings() };
    let err = Connector::configure(&envelope(&job(&["a"], json!({}))), runtime(&store, &source, bad_settings)).unwrap_err();
    assert!(matches!(err, ConnectorError::Config(_)));

    assert_eq!(source.calls(), 0);
    assert!(store.list_with_prefix(&raw_loc(), None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn reading_type_without_extractor_is_a_config_error() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    let rt = ConnectorRuntime { registry: Arc::new(ExtractorRegistry::new()), ..runtime(&store, &source, settings()) };

    let err = Connector::configure(&envelope(&job(&["a"], json!({}))), rt).unwrap_err();
    assert!(matches!(err, ConnectorError::Config(ConfigError::UnsupportedReadingType(_))));
}

#[tokio::test]
async fn phases_run_in_order() {
    let store = Arc::new(StorageEngine::in_memory());
    let source = ScriptedSource::new(0);
    let mut c = connector(&store, &source, &job(&["a"], json!({"gap_regeneration_window": 1})));

    let err = c.fetch().await.unwrap_err();
    assert!(matches!(
        err,
        ConnectorError::InvalidState { expected: ConnectorState::GapDetected, actual: ConnectorState::Configured }
    ));
    assert!(matches!(c.finish(), Err(ConnectorError::InvalidState { .. })));

    let report = c.detect_gaps(run_time()).await.unwrap();
    assert_eq!(report.missed_entries, 1);
    assert!(c.detect_gaps(run_time()).await.is_err());
    assert!(c.standardize().await.is_err());

    c.fetch().await.unwrap();
    assert_eq!(c.state(), ConnectorState::Fetched);
    assert!(c.index().is_empty());
    c.standardize().await.unwrap();
    let summary = c.finish().unwrap();
    assert_eq!(summary.readings_produced, 1);
    assert_eq!(c.state(), ConnectorState::Done);
}
