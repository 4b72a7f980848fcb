//! Bounded exponential backoff for transient provisioning errors.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProvisionError;

/// Retry behavior of the convergence executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts per operation, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Upper bound of any single delay.
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Whether to apply equal jitter (half fixed, half random).
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Creates the default retry policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` failed with `error`.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32, error: &ProvisionError) -> bool {
        error.is_transient() && attempt < self.max_attempts
    }

    /// Computes the delay before the retry following `attempt` (1-based).
    ///
    /// The delay is `base * 2^(attempt - 1)` capped at `max_delay`; with jitter
    /// the first half is fixed and the second half random. A provider hint
    /// (`retry-after`) raises the delay to at least the hint, still capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, error: &ProvisionError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jittered = if self.jitter && !backoff.is_zero() {
            let half = backoff / 2;
            let spread = u64::try_from(half.as_millis()).unwrap_or(u64::MAX);
            let random = rand::thread_rng().gen_range(0..=spread);
            half + Duration::from_millis(random)
        } else {
            backoff
        };

        match error.retry_after() {
            Some(hint) => jittered.max(hint).min(self.max_delay.max(self.base_delay)),
            None => jittered,
        }
    }
}

/// Serializes durations as integer milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
