//! Retry policies for network-bound operations
//!
//! A policy is plain configuration: how many attempts, how the delay grows, and where
//! it is capped. Which errors are worth retrying is decided by the caller.

use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Exponential backoff retry policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Funding a new account from the host: 5 attempts, delays capped at one minute
    pub fn create_and_fund_account() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Registering a custodial recipient: 5 attempts starting at 100ms
    pub fn custodial_recipient() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    /// Submitting a payment transaction within one worker pass
    pub fn submission() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Disable jitter, for deterministic delays
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Override the delays, keeping attempts and growth
    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let delay = (capped + jitter).clamp(0.0, self.max_delay.as_millis() as f64);

        Duration::from_millis(delay as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. Returns the last error.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation_name: &str,
        is_retryable: P,
        mut operation: F,
    ) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = operation_name, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt < max_attempts && is_retryable(&e) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(operation = operation_name, attempt, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}
