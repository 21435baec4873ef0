//! Retry policy configuration for tasks.
//!
//! A [`RetryPolicy`] is pure configuration: the scheduler consults
//! [`RetryPolicy::decide`] after each failed attempt and either waits out the
//! returned delay or gives up. Delays grow exponentially, optionally
//! perturbed by bounded random jitter so many tasks failing at once do not
//! retry in lockstep.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::task::TaskError;

/// Upper bound applied to computed delays when none is configured.
///
/// Exponential backoff overflows quickly for large attempt counts; delays
/// are clamped to this cap instead of growing without bound.
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Decision returned by [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    Retry(Duration),
    /// Do not retry; the failure is terminal.
    GiveUp,
}

/// Retry policy for a task.
///
/// `max_retries` counts retries, not attempts: a task with `max_retries = 2`
/// has its body invoked at most 3 times (1 initial + 2 retries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the initial one (0 = no retries).
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "serde_duration")]
    pub base_delay: Duration,

    /// Multiplier applied per retry: delay k = base × factor^(k−1).
    pub backoff_factor: f64,

    /// Jitter as a fraction of the computed delay (0.0 disables, 0.1 adds
    /// up to 10%).
    pub jitter: f64,

    /// Cap on the computed delay, applied before and after jitter.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter: 0.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Create a policy with a fixed delay between retries.
    ///
    /// # Arguments
    /// * `max_retries` - Maximum retry attempts (not including the initial try)
    /// * `delay` - Fixed delay between retries
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            backoff_factor: 1.0,
            jitter: 0.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff_factor,
            jitter: 0.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Builder: add bounded random jitter as a fraction of the delay.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.max(0.0);
        self
    }

    /// Builder: cap the computed delay.
    pub fn with_max_delay(mut self, cap: Duration) -> Self {
        self.max_delay = cap;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    /// Decide whether to retry after a failed attempt.
    ///
    /// # Arguments
    /// * `attempt` - Number of attempts already made, including the one that
    ///   just failed (1-indexed).
    /// * `error` - The failure that ended the attempt.
    pub fn decide(&self, attempt: u32, error: &TaskError) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp;
        }
        if attempt > self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// Computed in f64 seconds and clamped to `max_delay` so large attempt
    /// counts or factors cannot overflow into unbounded waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        let mut delay = if scaled.is_finite() && scaled >= 0.0 {
            Duration::try_from_secs_f64(scaled).unwrap_or(self.max_delay)
        } else {
            self.max_delay
        };
        delay = delay.min(self.max_delay);

        if self.jitter > 0.0 {
            let extra = delay.mul_f64(rand::random::<f64>() * self.jitter);
            delay = delay.saturating_add(extra).min(self.max_delay);
        }

        delay
    }
}

impl Default for RetryPolicy {
    /// Default policy: no retries.
    fn default() -> Self {
        Self::none()
    }
}

/// Serde helper for Duration serialization as fractional seconds.
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
