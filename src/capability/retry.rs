use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AtomizerConfig;
use crate::error::CapabilityError;

/// Timeout and exponential backoff applied to every capability call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AtomizerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            call_timeout: config.call_timeout(),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay after the `failed`-th failed attempt (1-based): doubles from
    /// `initial_backoff`, capped at `max_backoff`.
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 2u32.saturating_pow(failed.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AtomizerConfig::default())
    }
}

/// Every attempt failed; carries the last error.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: CapabilityError,
}

/// Run `call` until it succeeds or `policy.max_attempts` attempts have failed.
/// Each attempt is bounded by `policy.call_timeout`.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                duration_ms: policy.call_timeout.as_millis() as u64,
            }),
        };
        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "capability call recovered");
                }
                return Ok(value);
            }
            Err(e) if attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    operation,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "capability call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(RetryExhausted {
                    attempts: attempt,
                    last_error: e,
                })
            }
        }
    }
}
