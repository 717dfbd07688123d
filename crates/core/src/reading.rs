use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical one-hour reading every connector converges to. This is the body
/// stored at `{bucket}/{path}/{hour}` in the standardized location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardizedReading {
    #[serde(rename = "meterURI")]
    pub meter_uri: String,
    #[serde(with = "hour_format")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "hour_format")]
    pub end_time: DateTime<Utc>,
    pub usage: f64,
    pub audit: Audit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub created_by: String,
    #[serde(with = "hour_format")]
    pub created_date: DateTime<Utc>,
}

impl StandardizedReading {
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_bytes(body: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(body)
    }
}

/// Second-precision UTC timestamps without offset, matching the artifact
/// file names.
mod hour_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    use crate::hours::HOUR_FILE_FORMAT;

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&dt.format(HOUR_FILE_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, HOUR_FILE_FORMAT)
            .map(|naive| naive.and_utc())
            .map_err(de::Error::custom)
    }
}
