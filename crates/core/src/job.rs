//! Typed job configuration decoded from a dispatcher payload.
//!
//! The dispatcher sends `{"data": "<base64>"}`. The decoded JSON is
//! `{"data": {"meters": [...], "extra": {...}}}`. Everything is validated up
//! front so a bad payload fails before the run touches storage or a vendor.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::meter::{MeterDescriptor, ReadingType, StorageLocation};

pub const DEFAULT_GAP_WINDOW: u32 = 24;

/// Five years of hours. Larger windows are rejected before any listing.
pub const MAX_GAP_WINDOW: u32 = 5 * 366 * 24;

// ── Wire shapes ───────────────────────────────────────────────

#[derive(Deserialize)]
struct Envelope {
    data: String,
}

#[derive(Deserialize)]
struct Wrapped {
    data: JobSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub meters: Vec<MeterSpec>,
    pub extra: ExtraSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSpec {
    pub meter_name: String,
    pub meter_uri: String,
    #[serde(rename = "type")]
    pub reading_type: String,
    pub standardized: LocationSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationSpec {
    pub bucket: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraSpec {
    pub raw: LocationSpec,
    pub participant_id: i64,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub fetch_strategy: FetchStrategy,
    #[serde(default)]
    pub gap_regeneration_window: Option<u32>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// How missing hours are grouped into vendor requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FetchStrategy {
    /// One request per missing hour.
    #[default]
    Hourly,
    /// One request per calendar month of missing hours.
    Batch,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub api_key: Option<String>,
    /// Query parameter carrying `api_key`; defaults to `appid`.
    #[serde(default)]
    pub api_key_param: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("api_key_param", &self.api_key_param)
            .field("username", &self.username)
            .field("password", &redact(&self.password))
            .finish()
    }
}

// ── Validated config ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub participant_id: i64,
    /// Informational; hours are always computed in UTC.
    pub timezone: String,
    pub raw: StorageLocation,
    pub meters: Vec<MeterDescriptor>,
    pub fetch_strategy: FetchStrategy,
    pub gap_regeneration_window: u32,
    pub credentials: Credentials,
    pub endpoint: Option<String>,
    pub parameters: BTreeMap<String, String>,
}

impl JobConfig {
    /// Decode a dispatcher envelope (`{"data": "<base64 JSON>"}`).
    pub fn from_payload(payload: &[u8]) -> Result<Self, ConfigError> {
        let envelope: Envelope = serde_json::from_slice(payload)?;
        let decoded = STANDARD.decode(envelope.data.trim())?;
        Self::from_json(&decoded)
    }

    /// Decode the already-unwrapped job JSON (`{"data": {...}}`).
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let wrapped: Wrapped = serde_json::from_slice(json)?;
        Self::from_spec(wrapped.data)
    }

    pub fn from_spec(spec: JobSpec) -> Result<Self, ConfigError> {
        if spec.meters.is_empty() {
            return Err(ConfigError::Invalid("job has no meters".into()));
        }
        let raw = location("raw", spec.extra.raw)?;

        let mut seen = HashSet::new();
        let mut meters = Vec::with_capacity(spec.meters.len());
        for m in spec.meters {
            if m.meter_uri.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("meter '{}' has no uri", m.meter_name)));
            }
            if !seen.insert(m.meter_uri.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate meter uri '{}'", m.meter_uri)));
            }
            let reading_type: ReadingType = m.reading_type.parse()?;
            let standardized = location(&m.meter_name, m.standardized)?;
            meters.push(MeterDescriptor::new(m.meter_name, m.meter_uri, reading_type, standardized));
        }

        let window = spec.extra.gap_regeneration_window.unwrap_or(DEFAULT_GAP_WINDOW);
        if window == 0 {
            return Err(ConfigError::Invalid("gap_regeneration_window must be at least 1".into()));
        }
        if window > MAX_GAP_WINDOW {
            return Err(ConfigError::Invalid(format!(
                "gap_regeneration_window {window} exceeds {MAX_GAP_WINDOW} hours"
            )));
        }

        Ok(Self {
            participant_id: spec.extra.participant_id,
            timezone: spec.extra.timezone,
            raw,
            meters,
            fetch_strategy: spec.extra.fetch_strategy,
            gap_regeneration_window: window,
            credentials: spec.extra.credentials,
            endpoint: spec.extra.endpoint,
            parameters: spec.extra.parameters,
        })
    }
}

fn location(owner: &str, spec: LocationSpec) -> Result<StorageLocation, ConfigError> {
    if spec.bucket.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{owner}: bucket is empty")));
    }
    Ok(StorageLocation::new(spec.bucket.trim(), spec.path))
}
