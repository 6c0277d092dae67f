//! Fixed-delay retry for operations that must eventually succeed, such as
//! registering with the control plane.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (default: 5, so 6 attempts in total).
    pub max_retries: u32,
    /// Pause between attempts (default: 5 seconds).
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Total number of attempts, first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// Operation succeeded.
    Success(T),
    /// All retries exhausted.
    Exhausted {
        /// The last error that occurred.
        last_error: E,
        /// Total number of attempts made.
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Returns true if the operation succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }
}

/// Executor for retry operations.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new RetryExecutor with the given configuration.
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Configuration of this executor.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation` until it succeeds or `max_retries` retries have
    /// failed, sleeping `delay` between attempts. Every failure is retried.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.config.max_attempts();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation(attempt).await {
                Ok(value) => {
                    debug!(attempt, "operation succeeded");
                    return RetryOutcome::Success(value);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(attempt, error = %e, "giving up after final attempt");
                    return RetryOutcome::Exhausted {
                        last_error: e,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = self.config.delay.as_millis() as u64,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(self.config.delay).await;
                }
            }
        }
    }
}
