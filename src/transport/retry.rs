//! Retry policy: attempt count, per-attempt timeout, exponential backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Governs one transport call.
///
/// Attempts count from 1. Before attempt `n + 1` the caller waits
/// `base_delay * backoff_multiplier^(n - 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay", with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(
        default = "default_per_attempt_timeout",
        with = "duration_ms",
        rename = "per_attempt_timeout_ms"
    )]
    pub per_attempt_timeout: Duration,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_per_attempt_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            per_attempt_timeout: default_per_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn single_attempt(per_attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            per_attempt_timeout,
        }
    }

    /// Effective attempt count; a zero in config still makes one attempt.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait after a failed `attempt` (1-based) before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.max(0.0).powi(exponent);
        self.base_delay.mul_f64(factor)
    }

    /// Sum of all inter-attempt delays when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..self.attempts()).map(|i| self.delay_after(i)).sum()
    }
}

/// Serde adapter: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
