use thiserror::Error;

/// Errors raised while turning a job payload or environment into typed
/// configuration. These are the only errors that abort a run, and they are
/// always raised before any storage or network activity.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unsupported reading type: {0}")]
    UnsupportedReadingType(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::MalformedPayload(e.to_string())
    }
}

impl From<base64::DecodeError> for ConfigError {
    fn from(e: base64::DecodeError) -> Self {
        ConfigError::MalformedPayload(format!("base64: {e}"))
    }
}
