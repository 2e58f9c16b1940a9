use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;
use veritask_common::VerificationConfig;

/// Retry configuration for chain operations
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(10_000),
            exponential_base: 2.0,
        }
    }
}

impl From<&VerificationConfig> for RetryPolicy {
    fn from(config: &VerificationConfig) -> Self {
        Self {
            max_attempts: config.max_submit_attempts,
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            exponential_base: config.backoff_base,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.exponential_base.powi(retry.saturating_sub(1) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }
}

/// Errors that know whether trying again can help
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// The last error once retries stop
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub error: E,
}

/// Execute async operation with exponential backoff retry
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
) -> Result<T, RetryExhausted<E>>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) if attempt >= policy.max_attempts || !error.is_retryable() => {
                return Err(RetryExhausted { attempts: attempt, error });
            }
            Err(error) => {
                let delay = policy.delay_for(attempt);
                debug!(attempt, ?delay, %error, "retrying after backoff");
                sleep(delay).await;
            }
        }
    }
}
