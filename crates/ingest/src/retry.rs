use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use hbd_core::config::PipelineConfig;

/// Upper bound on a single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Bounded retry with a delay that grows per attempt: linearly
/// (`base * attempt`) by default, geometrically when a multiplier is set.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: Option<f64>,
}

impl RetryPolicy {
    pub fn from_settings(settings: &PipelineConfig) -> Self {
        Self {
            max_attempts: settings.max_retry_count.max(1),
            base_delay: Duration::from_millis(settings.retry_delay_ms),
            multiplier: settings.retry_backoff,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based), capped at
    /// [`MAX_RETRY_DELAY`].
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.multiplier {
            Some(factor) => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                let secs = self.base_delay.as_secs_f64() * factor.powi(exponent);
                Duration::try_from_secs_f64(secs).unwrap_or(MAX_RETRY_DELAY)
            }
            None => self.base_delay.checked_mul(attempt).unwrap_or(MAX_RETRY_DELAY),
        };
        delay.min(MAX_RETRY_DELAY)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned.
    pub async fn run<T, E, F, Fut>(
        &self,
        what: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(what, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
