//! Configuration for the sync engine.

use std::time::Duration;

/// Configuration for engine behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry and backoff policy for transient failures.
    pub retry: RetryPolicy,
    /// Deadline passed to every remote apply call. Exceeding it is a
    /// transient failure.
    pub apply_timeout: Duration,
}

impl EngineConfig {
    /// Creates a configuration with default retry behavior.
    pub fn new() -> Self {
        Self {
            retry: RetryPolicy::default(),
            apply_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the remote apply deadline.
    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded exponential backoff policy.
///
/// A record that fails transiently is requeued with an eligibility
/// delay of `base_delay * 2^retry_count`, capped at `max_delay`.
/// Once `retry_count` exceeds `max_retries` the record is
/// dead-lettered instead.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before dead-lettering.
    pub max_retries: u32,
    /// Base delay for the exponential backoff.
    pub base_delay: Duration,
    /// Upper bound on any single backoff delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given retry cap.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
        }
    }

    /// A policy with no delay between attempts, for tests and drains.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the backoff delay for a record with the given
    /// (already incremented) retry count.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 1u32 << retry_count.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
