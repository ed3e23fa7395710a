//! Per-call retry bookkeeping with exponential backoff.

use std::time::Duration;

use drivestash_common::BackoffConfig;

/// Delay before retry number `retry` (0-based) under `config`.
///
/// No jitter and no cap: with the defaults the sequence is 2, 4, 8, 16, 32
/// seconds.
pub fn delay_for_retry(config: &BackoffConfig, retry: u32) -> Duration {
    let factor = u64::from(config.multiplier).saturating_pow(retry);
    Duration::from_secs(config.initial_seconds.saturating_mul(factor))
}

/// Retry state of one logical API call.
#[derive(Debug, Clone)]
pub struct RetryState {
    config: BackoffConfig,
    attempts: u32,
    retries: u32,
    refresh_pending: bool,
    refresh_attempted: bool,
}

impl RetryState {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            config: config.clone(),
            attempts: 0,
            retries: 0,
            refresh_pending: false,
            refresh_attempted: false,
        }
    }

    /// Record the start of an attempt and return its 1-based number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether the last attempt used up the retry budget.
    pub fn exhausted(&self) -> bool {
        self.attempts > self.config.max_retries
    }

    /// Delay to wait before the next attempt; grows the backoff.
    pub fn next_delay(&mut self) -> Duration {
        let delay = delay_for_retry(&self.config, self.retries);
        self.retries += 1;
        delay
    }

    /// Whether the credential refresh retry is still available.
    pub fn can_refresh(&self) -> bool {
        !self.refresh_attempted
    }

    /// Ask the next attempt to force a credential refresh.
    pub fn request_refresh(&mut self) {
        self.refresh_pending = true;
        self.refresh_attempted = true;
    }

    /// Consume a pending refresh request.
    pub fn take_refresh(&mut self) -> bool {
        std::mem::take(&mut self.refresh_pending)
    }
}
