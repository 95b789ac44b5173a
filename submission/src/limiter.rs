//! Adaptive claim limit
//!
//! Congestion shows up as timeouts, rate limiting and fee rejections. After enough of
//! them in one window the worker claims fewer rows per pass until the window passes
//! quietly.

use crate::metrics::{INDETERMINATE_RESPONSES, PROCESSING_LIMIT};
use ledger_client::LedgerError;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Rows claimed per pass when nothing is wrong
pub const DEFAULT_PROCESSING_LIMIT: usize = 8;

/// Rows claimed per pass while the ledger is congested
pub const REDUCED_PROCESSING_LIMIT: usize = 1;

/// Indeterminate responses tolerated per window
pub const INDETERMINATE_RESPONSES_TOLERANCE: usize = 10;

/// Length of the counting window
pub const LIMITER_WINDOW: Duration = Duration::from_secs(3 * 60);

struct LimiterState {
    limit: usize,
    responses: usize,
    window_started: Instant,
}

/// Shared claim limit
pub struct ProcessingLimiter {
    normal_limit: usize,
    state: Mutex<LimiterState>,
}

impl Default for ProcessingLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSING_LIMIT)
    }
}

impl ProcessingLimiter {
    /// Create a limiter; `limit` of zero falls back to the default
    pub fn new(limit: usize) -> Self {
        let normal_limit = if limit == 0 { DEFAULT_PROCESSING_LIMIT } else { limit };
        PROCESSING_LIMIT.set(normal_limit as i64);
        Self {
            normal_limit,
            state: Mutex::new(LimiterState {
                limit: normal_limit,
                responses: 0,
                window_started: Instant::now(),
            }),
        }
    }

    /// Whether `error` says the ledger is congested
    pub fn is_congestion(error: &LedgerError) -> bool {
        error.is_indeterminate() || error.is_rate_limited() || error.is_insufficient_fee()
    }

    /// Count `error` if it signals congestion
    pub fn record(&self, error: &LedgerError) {
        if !Self::is_congestion(error) {
            return;
        }
        INDETERMINATE_RESPONSES.inc();

        let mut state = self.state.lock();
        state.responses += 1;
        if state.responses >= INDETERMINATE_RESPONSES_TOLERANCE && state.limit != REDUCED_PROCESSING_LIMIT {
            warn!(
                responses = state.responses,
                limit = REDUCED_PROCESSING_LIMIT,
                "Ledger looks congested, reducing processing limit"
            );
            state.limit = REDUCED_PROCESSING_LIMIT;
            state.window_started = Instant::now();
            PROCESSING_LIMIT.set(REDUCED_PROCESSING_LIMIT as i64);
        }
    }

    /// Rows to claim in the next pass
    pub fn limit(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        if now.duration_since(state.window_started) > LIMITER_WINDOW {
            state.responses = 0;
            state.window_started = now;
            state.limit = self.normal_limit;
            PROCESSING_LIMIT.set(self.normal_limit as i64);
        }
        state.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::ResultCodes;

    #[tokio::test(start_paused = true)]
    async fn test_limit_drops_after_tolerance_and_recovers() {
        let limiter = ProcessingLimiter::new(8);
        assert_eq!(limiter.limit(), 8);

        for _ in 0..INDETERMINATE_RESPONSES_TOLERANCE - 1 {
            limiter.record(&LedgerError::Timeout);
        }
        assert_eq!(limiter.limit(), 8);

        limiter.record(&LedgerError::Http {
            status: 429,
            detail: "slow down".to_string(),
        });
        assert_eq!(limiter.limit(), REDUCED_PROCESSING_LIMIT);

        tokio::time::advance(LIMITER_WINDOW + Duration::from_secs(1)).await;
        assert_eq!(limiter.limit(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_errors_are_not_counted() {
        let limiter = ProcessingLimiter::new(4);
        for _ in 0..20 {
            limiter.record(&LedgerError::Rejected(ResultCodes::transaction("tx_bad_auth")));
        }
        assert_eq!(limiter.limit(), 4);
    }

    #[test]
    fn test_zero_limit_uses_default() {
        assert_eq!(ProcessingLimiter::new(0).limit(), DEFAULT_PROCESSING_LIMIT);
    }
}
