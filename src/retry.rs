//! Retry with exponential backoff.
//!
//! Discovery requests go through [`retry_async`]; bandwidth workers use
//! [`RetryConfig::delay_for_attempt`] directly when replacing a dropped
//! connection.

use log::{debug, warn};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Default number of retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (in milliseconds).
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Maximum delay cap for exponential backoff (in milliseconds).
pub const DEFAULT_MAX_DELAY_MS: u64 = 2000;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self { max_retries, base_delay_ms, max_delay_ms }
    }

    /// The delay is calculated as: base_delay * 2^attempt, capped at max_delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms =
            self.base_delay_ms.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    Failed {
        /// The last error that occurred.
        last_error: E,
        /// Number of attempts made.
        attempts: u32,
    },
}

/// Execute an async operation with retry logic and exponential backoff.
pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> RetryResult<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt - 1);
            debug!(
                "{}: Retry attempt {}/{} after {:?} delay",
                operation_name, attempt, config.max_retries, delay
            );
            sleep(delay).await;
        }

        match f().await {
            Ok(result) => return RetryResult::Success(result),
            Err(e) if attempt + 1 < total_attempts => {
                warn!("{}: Attempt {} failed: {}", operation_name, attempt + 1, e);
            }
            Err(e) => {
                warn!(
                    "{}: All {} attempts failed. Last error: {}",
                    operation_name, total_attempts, e
                );
                return RetryResult::Failed {
                    last_error: e,
                    attempts: total_attempts,
                };
            }
        }

        attempt += 1;
    }
}
