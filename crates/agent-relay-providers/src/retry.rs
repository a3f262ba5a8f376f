//! Bounded retry with exponential backoff.

use std::future::Future;
use std::time::Duration;

use agent_relay_core::config::LlmConfig;
use tracing::{debug, info, warn};

/// How many times to try, how long each try may take, and how long to wait
/// between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (2 means 3 attempts in total).
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries(),
            attempt_timeout: Duration::from_secs(config.timeout_secs()),
            base_delay: Duration::from_millis(config.retry_base_delay_ms()),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `op` receives the 0-based attempt number. Each attempt is bounded by
/// `attempt_timeout`; a timeout counts as a failed attempt.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..policy.attempts() {
        if attempt > 0 {
            let delay = policy.delay_for(attempt - 1);
            debug!(label, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::time::sleep(delay).await;
        }

        match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
            Ok(Ok(value)) => {
                if attempt > 0 {
                    info!(label, attempt = attempt + 1, "Retry succeeded");
                }
                return Ok(value);
            }
            Ok(Err(e)) => {
                warn!(label, attempt = attempt + 1, %e, "Attempt failed");
                last_error = Some(e);
            }
            Err(_) => {
                warn!(label, attempt = attempt + 1, "Attempt timed out");
                last_error = Some(anyhow::anyhow!(
                    "{label} timed out after {}ms",
                    policy.attempt_timeout.as_millis()
                ));
            }
        }
    }

    let error = last_error.unwrap_or_else(|| anyhow::anyhow!("{label}: no attempts made"));
    Err(error.context(format!("{label} failed after {} attempts", policy.attempts())))
}
