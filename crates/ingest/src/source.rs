//! Vendor data sources.
//!
//! A source turns a [`MissedKey`] into one raw payload. Sources only fetch;
//! retries, caching and persistence belong to the fetch stage.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use hbd_core::hours::{hour_end, hour_file_name};
use hbd_core::{ConfigError, Credentials, JobConfig};

use crate::index::MissedKey;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("unexpected status {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("empty response for {0}")]
    EmptyResponse(String),
}

impl SourceError {
    /// Empty responses are a property of the data, so asking again is pointless.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SourceError::EmptyResponse(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(e.to_string())
        } else {
            SourceError::Connection(e.to_string())
        }
    }
}

/// Anything that can fetch raw vendor data for a missed hour or range.
#[async_trait]
pub trait VendorSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, key: &MissedKey) -> Result<Bytes, SourceError>;

    /// Deterministic raw artifact name for `key`, so a re-run finds the
    /// payload a previous run already stored.
    fn raw_file_name(&self, key: &MissedKey) -> String {
        match key {
            MissedKey::Hour(hour) => hour_file_name(*hour),
            MissedKey::Range(_) => format!("{}_{}", hour_file_name(key.first()), hour_file_name(key.last())),
        }
    }
}

/// True for `null`, `{}`, `[]` and objects whose `data` member is empty.
pub fn is_empty_payload(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => {
            map.is_empty()
                || map.get("data").is_some_and(|d| match d {
                    serde_json::Value::Null => true,
                    serde_json::Value::Array(items) => items.is_empty(),
                    serde_json::Value::Object(inner) => inner.is_empty(),
                    _ => false,
                })
        }
        _ => false,
    }
}

// ── HTTP source ───────────────────────────────────────────────

/// Generic JSON-over-HTTP source. Single hours are requested with a unix
/// `dt` parameter, ranges with RFC 3339 `starttime`/`endtime`.
pub struct HttpSource {
    client: Client,
    endpoint: String,
    params: BTreeMap<String, String>,
    credentials: Credentials,
}

impl HttpSource {
    pub fn new(
        endpoint: impl Into<String>,
        params: BTreeMap<String, String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint: endpoint.into(),
            params,
            credentials,
        }
    }

    pub fn from_job(job: &JobConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let endpoint = job
            .endpoint
            .clone()
            .filter(|e| e.starts_with("http://") || e.starts_with("https://"))
            .ok_or_else(|| ConfigError::Invalid("extra.endpoint must be an http(s) URL".into()))?;
        Ok(Self::new(endpoint, job.parameters.clone(), job.credentials.clone(), timeout))
    }

    /// Full query string for `key`: static params, API key, then time bounds.
    pub fn query_params(&self, key: &MissedKey) -> Vec<(String, String)> {
        let mut query: Vec<(String, String)> =
            self.params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        if let Some(ref api_key) = self.credentials.api_key {
            let param = self.credentials.api_key_param.as_deref().unwrap_or("appid");
            query.push((param.to_string(), api_key.clone()));
        }
        match key {
            MissedKey::Hour(hour) => query.push(("dt".into(), hour.timestamp().to_string())),
            MissedKey::Range(_) => {
                query.push(("starttime".into(), key.first().to_rfc3339()));
                query.push(("endtime".into(), hour_end(key.last()).to_rfc3339()));
            }
        }
        query
    }
}

#[async_trait]
impl VendorSource for HttpSource {
    fn name(&self) -> &str {
        &self.endpoint
    }

    async fn fetch(&self, key: &MissedKey) -> Result<Bytes, SourceError> {
        let mut request = self.client.get(&self.endpoint).query(&self.query_params(key));
        if let Some(ref user) = self.credentials.username {
            request = request.basic_auth(user, self.credentials.password.as_deref());
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::BadStatus { status, body });
        }

        let body = response.bytes().await?;
        let parsed: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| SourceError::Malformed(e.to_string()))?;
        if is_empty_payload(&parsed) {
            return Err(SourceError::EmptyResponse(self.raw_file_name(key)));
        }
        debug!(endpoint = %self.endpoint, bytes = body.len(), "fetched payload");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn source(api_key: Option<&str>) -> HttpSource {
        let mut params = BTreeMap::new();
        params.insert("lat".to_string(), "1.5".to_string());
        HttpSource::new(
            "https://vendor.example/api",
            params,
            Credentials { api_key: api_key.map(String::from), ..Default::default() },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn hour_query_uses_unix_dt() {
        let hour = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let q = source(Some("k")).query_params(&MissedKey::Hour(hour));
        assert!(q.contains(&("lat".into(), "1.5".into())));
        assert!(q.contains(&("appid".into(), "k".into())));
        assert!(q.contains(&("dt".into(), "1704067200".into())));
    }

    #[test]
    fn range_query_spans_whole_last_hour() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 5, 0, 0).unwrap();
        let q = source(None).query_params(&MissedKey::range(vec![a, b]).unwrap());
        assert!(q.contains(&("starttime".into(), "2024-01-01T00:00:00+00:00".into())));
        assert!(q.contains(&("endtime".into(), "2024-01-01T05:59:59+00:00".into())));
        assert!(!q.iter().any(|(k, _)| k == "appid"));
    }

    #[test]
    fn raw_names_are_deterministic() {
        let s = source(None);
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 2, 3, 0, 0).unwrap();
        assert_eq!(s.raw_file_name(&MissedKey::Hour(a)), "2024-01-01T00:00:00");
        assert_eq!(
            s.raw_file_name(&MissedKey::range(vec![b, a]).unwrap()),
            "2024-01-01T00:00:00_2024-01-02T03:00:00"
        );
    }

    #[test]
    fn empty_payload_detection() {
        assert!(is_empty_payload(&json!(null)));
        assert!(is_empty_payload(&json!([])));
        assert!(is_empty_payload(&json!({})));
        assert!(is_empty_payload(&json!({"data": []})));
        assert!(!is_empty_payload(&json!({"data": [{"temp": 1.0}]})));
        assert!(!is_empty_payload(&json!([{"value": 1}])));
    }

    #[test]
    fn only_empty_response_is_final() {
        assert!(SourceError::Timeout("t".into()).is_retryable());
        assert!(SourceError::BadStatus { status: 503, body: String::new() }.is_retryable());
        assert!(!SourceError::EmptyResponse("h".into()).is_retryable());
    }

    #[test]
    fn from_job_requires_http_endpoint() {
        let job = JobConfig {
            participant_id: 1,
            timezone: String::new(),
            raw: hbd_core::StorageLocation::new("raw", "p"),
            meters: Vec::new(),
            fetch_strategy: Default::default(),
            gap_regeneration_window: 24,
            credentials: Credentials::default(),
            endpoint: Some("ftp://nope".into()),
            parameters: BTreeMap::new(),
        };
        assert!(HttpSource::from_job(&job, Duration::from_secs(1)).is_err());
    }
}
