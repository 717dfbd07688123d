//! Per-reading-type extraction of a usage value from a raw payload.
//!
//! Extractors are looked up in an [`ExtractorRegistry`] keyed by
//! [`ReadingType`]. The registry is checked against the job's meters when a
//! connector is configured, so a meter with no extractor is a configuration
//! error rather than a silent skip at standardize time.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use hbd_core::hours::{hour_end, truncate_hour, HOUR_FILE_FORMAT};
use hbd_core::{ConfigError, MeterDescriptor, ReadingType};

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no data for {0}")]
    EmptyData(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("no extractor registered for {0}")]
    Unsupported(ReadingType),
}

/// Usage plus the interval it covers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extraction {
    pub usage: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Extraction {
    /// A reading spanning the whole hour starting at `hour`.
    pub fn hourly(usage: f64, hour: DateTime<Utc>) -> Self {
        Self { usage, start: hour, end: hour_end(hour) }
    }
}

pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        body: &Value,
        hour: DateTime<Utc>,
        meter: &MeterDescriptor,
    ) -> Result<Extraction, ExtractError>;
}

#[derive(Default, Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<ReadingType, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Weather readings from `{"data": [{...}]}` snapshots and grid
    /// emissions from `[{"point_time", "value"}]` series.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        let weather = [
            (ReadingType::AmbientTemperature, "temp"),
            (ReadingType::AmbientRealFeelTemperature, "feels_like"),
            (ReadingType::AmbientDewPoint, "dew_point"),
            (ReadingType::AmbientHumidity, "humidity"),
            (ReadingType::AmbientWindSpeed, "wind_speed"),
            (ReadingType::AmbientWindDirection, "wind_deg"),
            (ReadingType::AmbientCloudCover, "clouds"),
        ];
        for (reading_type, field) in weather {
            registry.register(reading_type, JsonPointerExtractor::new(format!("/data/0/{field}")));
        }
        for reading_type in [ReadingType::MarginalGridEmissions, ReadingType::AverageGridEmissions] {
            registry.register(reading_type, PointSeriesExtractor::new("point_time", "value"));
        }
        registry
    }

    pub fn register(&mut self, reading_type: ReadingType, extractor: impl Extractor + 'static) -> &mut Self {
        self.extractors.insert(reading_type, Arc::new(extractor));
        self
    }

    pub fn get(&self, reading_type: ReadingType) -> Result<Arc<dyn Extractor>, ExtractError> {
        self.extractors
            .get(&reading_type)
            .cloned()
            .ok_or(ExtractError::Unsupported(reading_type))
    }

    /// Fail if any meter's reading type has no extractor.
    pub fn ensure_supported(&self, meters: &[MeterDescriptor]) -> Result<(), ConfigError> {
        match meters.iter().find(|m| !self.extractors.contains_key(&m.reading_type)) {
            Some(m) => Err(ConfigError::UnsupportedReadingType(format!(
                "{} (meter '{}')",
                m.reading_type, m.name
            ))),
            None => Ok(()),
        }
    }
}

fn as_usage(value: &Value, what: &str) -> Result<f64, ExtractError> {
    match value {
        Value::Null => Err(ExtractError::EmptyData(what.to_string())),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExtractError::Malformed(format!("{what}: {n} is not finite"))),
        // `f64::from_str` accepts "NaN" and "inf", which cannot be written back as JSON.
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ExtractError::Malformed(format!("{what}: '{s}' is not a finite number"))),
        other => Err(ExtractError::Malformed(format!("{what}: unexpected {other}"))),
    }
}

// ── Snapshot payloads ─────────────────────────────────────────

/// Reads a single value at a JSON pointer; the payload describes one hour.
pub struct JsonPointerExtractor {
    pointer: String,
}

impl JsonPointerExtractor {
    pub fn new(pointer: impl Into<String>) -> Self {
        Self { pointer: pointer.into() }
    }
}

impl Extractor for JsonPointerExtractor {
    fn extract(&self, body: &Value, hour: DateTime<Utc>, meter: &MeterDescriptor) -> Result<Extraction, ExtractError> {
        let what = format!("{} at {}", meter.name, self.pointer);
        let value = body
            .pointer(&self.pointer)
            .ok_or_else(|| ExtractError::EmptyData(what.clone()))?;
        Ok(Extraction::hourly(as_usage(value, &what)?, hour))
    }
}

// ── Time series payloads ──────────────────────────────────────

/// Picks the point whose timestamp falls inside the requested hour from an
/// array of records (bare, or under a `data` member).
pub struct PointSeriesExtractor {
    time_field: String,
    value_field: String,
}

impl PointSeriesExtractor {
    pub fn new(time_field: impl Into<String>, value_field: impl Into<String>) -> Self {
        Self { time_field: time_field.into(), value_field: value_field.into() }
    }
}

fn parse_point_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| NaiveDateTime::parse_from_str(raw, HOUR_FILE_FORMAT).ok().map(|n| n.and_utc()))
}

impl Extractor for PointSeriesExtractor {
    fn extract(&self, body: &Value, hour: DateTime<Utc>, meter: &MeterDescriptor) -> Result<Extraction, ExtractError> {
        let points = match body {
            Value::Array(points) => points,
            Value::Object(map) => match map.get("data") {
                Some(Value::Array(points)) => points,
                _ => return Err(ExtractError::Malformed(format!("{}: expected a point array", meter.name))),
            },
            _ => return Err(ExtractError::Malformed(format!("{}: expected a point array", meter.name))),
        };

        let point = points
            .iter()
            .find(|p| {
                p.get(&self.time_field)
                    .and_then(Value::as_str)
                    .and_then(parse_point_time)
                    .is_some_and(|t| truncate_hour(t) == hour)
            })
            .ok_or_else(|| ExtractError::EmptyData(format!("{} at {}", meter.name, hour)))?;

        let what = format!("{}.{}", meter.name, self.value_field);
        let value = point.get(&self.value_field).unwrap_or(&Value::Null);
        Ok(Extraction::hourly(as_usage(value, &what)?, hour))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hbd_core::StorageLocation;
    use serde_json::json;

    fn meter(reading_type: ReadingType) -> MeterDescriptor {
        MeterDescriptor::new("m", "urn:m", reading_type, StorageLocation::new("std", "m"))
    }

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn weather_snapshot() {
        let registry = ExtractorRegistry::builtin();
        let body = json!({"data": [{"temp": 271.5, "humidity": "80"}]});
        let temp = registry
            .get(ReadingType::AmbientTemperature)
            .unwrap()
            .extract(&body, hour(), &meter(ReadingType::AmbientTemperature))
            .unwrap();
        assert_eq!(temp, Extraction { usage: 271.5, start: hour(), end: hour_end(hour()) });

        let humidity = registry
            .get(ReadingType::AmbientHumidity)
            .unwrap()
            .extract(&body, hour(), &meter(ReadingType::AmbientHumidity))
            .unwrap();
        assert_eq!(humidity.usage, 80.0);
    }

    #[test]
    fn missing_field_is_empty_data() {
        let ex = JsonPointerExtractor::new("/data/0/clouds");
        let err = ex.extract(&json!({"data": [{}]}), hour(), &meter(ReadingType::AmbientCloudCover)).unwrap_err();
        assert!(matches!(err, ExtractError::EmptyData(_)));
        let err = ex.extract(&json!({"data": [{"clouds": null}]}), hour(), &meter(ReadingType::AmbientCloudCover)).unwrap_err();
        assert!(matches!(err, ExtractError::EmptyData(_)));
    }

    #[test]
    fn non_finite_strings_are_malformed() {
        let ex = JsonPointerExtractor::new("/data/0/temp");
        let m = meter(ReadingType::AmbientTemperature);
        for raw in ["NaN", "inf", "-infinity", "abc"] {
            let err = ex.extract(&json!({"data": [{"temp": raw}]}), hour(), &m).unwrap_err();
            assert!(matches!(err, ExtractError::Malformed(_)), "{raw}");
        }
        let got = ex.extract(&json!({"data": [{"temp": " 12.5 "}]}), hour(), &m).unwrap();
        assert_eq!(got.usage, 12.5);
    }

    #[test]
    fn point_series_picks_matching_hour() {
        let ex = PointSeriesExtractor::new("point_time", "value");
        let body = json!([
            {"point_time": "2024-02-01T08:00:00Z", "value": 1.0},
            {"point_time": "2024-02-01T09:05:00+00:00", "value": 2.5}
        ]);
        let got = ex.extract(&body, hour(), &meter(ReadingType::MarginalGridEmissions)).unwrap();
        assert_eq!(got.usage, 2.5);
        assert_eq!(got.start, hour());

        let later = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        assert!(matches!(
            ex.extract(&body, later, &meter(ReadingType::MarginalGridEmissions)),
            Err(ExtractError::EmptyData(_))
        ));
    }

    #[test]
    fn unsupported_types_fail_configuration() {
        let registry = ExtractorRegistry::builtin();
        assert!(matches!(registry.get(ReadingType::Steam), Err(ExtractError::Unsupported(_))));
        let meters = vec![meter(ReadingType::AmbientHumidity), meter(ReadingType::Steam)];
        assert!(matches!(
            registry.ensure_supported(&meters),
            Err(ConfigError::UnsupportedReadingType(_))
        ));
        assert!(registry.ensure_supported(&meters[..1]).is_ok());
    }
}
