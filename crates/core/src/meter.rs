use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

// ── Reading type ──────────────────────────────────────────────

/// What a meter measures. Drives extractor selection during standardize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingType {
    Electricity,
    NaturalGas,
    Water,
    Steam,
    Occupancy,
    AmbientTemperature,
    AmbientRealFeelTemperature,
    AmbientDewPoint,
    AmbientHumidity,
    AmbientWindSpeed,
    AmbientWindDirection,
    AmbientCloudCover,
    MarginalGridEmissions,
    AverageGridEmissions,
}

impl ReadingType {
    pub const ALL: [ReadingType; 14] = [
        ReadingType::Electricity,
        ReadingType::NaturalGas,
        ReadingType::Water,
        ReadingType::Steam,
        ReadingType::Occupancy,
        ReadingType::AmbientTemperature,
        ReadingType::AmbientRealFeelTemperature,
        ReadingType::AmbientDewPoint,
        ReadingType::AmbientHumidity,
        ReadingType::AmbientWindSpeed,
        ReadingType::AmbientWindDirection,
        ReadingType::AmbientCloudCover,
        ReadingType::MarginalGridEmissions,
        ReadingType::AverageGridEmissions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingType::Electricity => "electricity",
            ReadingType::NaturalGas => "natural_gas",
            ReadingType::Water => "water",
            ReadingType::Steam => "steam",
            ReadingType::Occupancy => "occupancy",
            ReadingType::AmbientTemperature => "ambient_temperature",
            ReadingType::AmbientRealFeelTemperature => "ambient_real_feel_temperature",
            ReadingType::AmbientDewPoint => "ambient_dew_point",
            ReadingType::AmbientHumidity => "ambient_humidity",
            ReadingType::AmbientWindSpeed => "ambient_wind_speed",
            ReadingType::AmbientWindDirection => "ambient_wind_direction",
            ReadingType::AmbientCloudCover => "ambient_cloud_cover",
            ReadingType::MarginalGridEmissions => "marginal_grid_emissions",
            ReadingType::AverageGridEmissions => "average_grid_emissions",
        }
    }
}

impl fmt::Display for ReadingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the free-form labels found in meter configs ("Ambient Temperature",
/// " electricity ", "natural-gas") by normalizing case and separators.
impl FromStr for ReadingType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        ReadingType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnsupportedReadingType(s.to_string()))
    }
}

// ── Locations ─────────────────────────────────────────────────

/// A bucket plus a slash-separated path inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageLocation {
    pub bucket: String,
    pub path: String,
}

impl StorageLocation {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), path: normalize_path(&path.into()) }
    }

    /// `{path}/{file_name}` within the bucket.
    pub fn key(&self, file_name: &str) -> String {
        if self.path.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.path, file_name)
        }
    }

    /// Child location `{path}/{segment}` in the same bucket.
    pub fn join(&self, segment: &str) -> StorageLocation {
        StorageLocation::new(self.bucket.clone(), self.key(segment))
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.path)
    }
}

fn normalize_path(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

// ── Meter descriptor ──────────────────────────────────────────

/// One meter as supplied by the participant configuration. Immutable for the
/// duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterDescriptor {
    pub name: String,
    pub id: u64,
    pub uri: String,
    pub reading_type: ReadingType,
    pub standardized: StorageLocation,
}

impl MeterDescriptor {
    pub fn new(
        name: impl Into<String>,
        uri: impl Into<String>,
        reading_type: ReadingType,
        standardized: StorageLocation,
    ) -> Self {
        let uri = uri.into();
        Self { name: name.into(), id: meter_id(&uri), uri, reading_type, standardized }
    }
}

/// Stable 48-bit identifier: the first six bytes of SHA-256 over the URI,
/// big-endian. Fits an INT64 warehouse column with room to spare.
pub fn meter_id(uri: &str) -> u64 {
    let digest = Sha256::digest(uri.as_bytes());
    digest[..6].iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
