use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub storage: StorageConfig,
    pub aws: AwsConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `HBD_PROFILE`. When set (e.g. `PROD`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("HBD_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            storage: StorageConfig::from_env_profiled(p),
            aws: AwsConfig::from_env_profiled(p),
            pipeline: PipelineConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  storage:     backend={}, data_dir={}",
            self.storage.backend,
            self.storage.data_dir.display()
        );
        tracing::info!(
            "  aws:         region={}, credentials={}",
            self.aws.region,
            if self.aws.is_configured() { "set" } else { "(none)" }
        );
        tracing::info!(
            "  pipeline:    replicas={}, retries={}, chunk={}",
            self.pipeline.worker_replica,
            self.pipeline.max_retry_count,
            self.pipeline.max_chunk_size
        );
    }
}

// ── Storage ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "local", "s3" or "memory".
    pub backend: String,
    /// Root directory for the local backend; buckets are subdirectories.
    pub data_dir: PathBuf,
}

impl StorageConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            backend: profiled_env_or(p, "STORAGE_BACKEND", "local").to_lowercase(),
            data_dir: PathBuf::from(profiled_env_or(p, "DATA_DIR", "data")),
        }
    }
}

// ── AWS / S3 ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            endpoint_url: profiled_env_opt(p, "AWS_ENDPOINT_URL"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Pipeline ──────────────────────────────────────────────────

/// Knobs shared by every stage of a connector run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Concurrent workers per stage.
    pub worker_replica: usize,
    /// Attempts per vendor call or upload before the item is dropped.
    pub max_retry_count: u32,
    /// Base delay between attempts.
    pub retry_delay_ms: u64,
    /// When set, delays grow geometrically by this factor instead of linearly.
    pub retry_backoff: Option<f64>,
    /// Hard cap on references per status document.
    pub max_chunk_size: usize,
    pub update_prefix: String,
    pub processed_prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_replica: 20,
            max_retry_count: 3,
            retry_delay_ms: 500,
            retry_backoff: None,
            max_chunk_size: 10_000,
            update_prefix: "updates".to_string(),
            processed_prefix: "processed".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl PipelineConfig {
    fn from_env_profiled(p: &str) -> Self {
        let d = Self::default();
        Self {
            worker_replica: profiled_env_u32(p, "WORKER_REPLICA", d.worker_replica as u32) as usize,
            max_retry_count: profiled_env_u32(p, "MAX_RETRY_COUNT", d.max_retry_count),
            retry_delay_ms: profiled_env_u64(p, "RETRY_DELAY_MS", d.retry_delay_ms),
            retry_backoff: profiled_env_opt(p, "RETRY_BACKOFF").and_then(|v| v.parse().ok()),
            max_chunk_size: profiled_env_u32(p, "MAX_CHUNK_SIZE", d.max_chunk_size as u32) as usize,
            update_prefix: profiled_env_or(p, "UPDATE_PREFIX", &d.update_prefix),
            processed_prefix: profiled_env_or(p, "PROCESSED_PREFIX", &d.processed_prefix),
            request_timeout_secs: profiled_env_u64(p, "REQUEST_TIMEOUT_SECS", d.request_timeout_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_replica == 0 {
            return Err(ConfigError::Invalid("worker_replica must be at least 1".into()));
        }
        if self.max_retry_count == 0 {
            return Err(ConfigError::Invalid("max_retry_count must be at least 1".into()));
        }
        if self.max_chunk_size == 0 {
            return Err(ConfigError::Invalid("max_chunk_size must be at least 1".into()));
        }
        if let Some(factor) = self.retry_backoff {
            if !(factor.is_finite() && factor >= 1.0) {
                return Err(ConfigError::Invalid(format!("retry_backoff {factor} must be >= 1")));
            }
        }
        if self.update_prefix.is_empty() || self.update_prefix == self.processed_prefix {
            return Err(ConfigError::Invalid(
                "update_prefix must be non-empty and differ from processed_prefix".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_chunk_size_rejected() {
        let cfg = PipelineConfig { max_chunk_size: 0, ..Default::default() };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn shrinking_backoff_rejected() {
        let cfg = PipelineConfig { retry_backoff: Some(0.5), ..Default::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn profile_prefix_takes_precedence() {
        env::set_var("HBDTEST_WORKER_REPLICA", "7");
        let cfg = PipelineConfig::from_env_profiled("HBDTEST");
        assert_eq!(cfg.worker_replica, 7);
        env::remove_var("HBDTEST_WORKER_REPLICA");
    }
}
