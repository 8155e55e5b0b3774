//! Bounded retry with fixed or exponential backoff.
//!
//! Attempts are 1-based and `max_attempts` includes the first one: a policy
//! with `max_attempts = 3` invokes a handler at most three times.

use std::time::Duration;

use orchestrion_types::config::{BackoffKind, RetryPolicyConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Whether another attempt may follow failed attempt number `attempt`.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.base_delay
                    .checked_mul(1u32 << exponent)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// `delay` as a chrono duration, for computing `run_at`.
    pub fn chrono_delay(&self, attempt: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.delay(attempt)).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms.max(config.base_delay_ms)),
        }
    }
}
