use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use super::error::{ProvisionError, RetryError};
use super::types::RetryConfig;

/// Bounded retry with capped exponential backoff and a wall-clock deadline.
///
/// Each attempt is itself bounded by the time left before the deadline, so
/// a hung backend call cannot outlive `timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            timeout: config.timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, timeout: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
            max_delay: Duration::from_secs(30),
            timeout,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` counts failures so far (>= 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// runs out of attempts, or would overrun the deadline.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let remaining = self.timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(RetryError::DeadlineExceeded {
                    operation: operation.to_string(),
                    attempts: attempt,
                    timeout: self.timeout,
                    last: None,
                });
            }

            let outcome = match tokio::time::timeout(remaining, op()).await {
                Ok(result) => result,
                Err(_) => Err(ProvisionError::Timeout(self.timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(operation, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                return Err(RetryError::Fatal {
                    operation: operation.to_string(),
                    source: err,
                });
            }

            attempt += 1;
            if attempt >= self.max_retries {
                return Err(RetryError::Exhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.delay_for(attempt);
            let elapsed = started.elapsed();
            if elapsed + delay >= self.timeout {
                return Err(RetryError::DeadlineExceeded {
                    operation: operation.to_string(),
                    attempts: attempt,
                    timeout: self.timeout,
                    last: Some(err),
                });
            }

            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
