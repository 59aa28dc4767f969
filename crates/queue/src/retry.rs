//! Retry policies and dead letter entries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobMessage;

/// Upper bound for any computed redelivery delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600 * 24);

/// Delay growth between redelivery attempts of a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Redeliver immediately.
    None,
    /// Same delay before every redelivery.
    Fixed(Duration),
    /// `base * multiplier^(attempt - 1)`.
    Exponential {
        /// Delay before the first redelivery.
        base: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before redelivery number `attempt` (1-based), capped at [`MAX_RETRY_DELAY`].
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = match self {
            Self::None => Duration::ZERO,
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, multiplier } => {
                let exponent = attempt.saturating_sub(1).min(64) as i32;
                let secs = base.as_secs_f64() * multiplier.powi(exponent);
                if secs.is_finite() && secs < MAX_RETRY_DELAY.as_secs_f64() {
                    // A negative multiplier can flip the sign.
                    Duration::from_secs_f64(secs.max(0.0))
                } else {
                    MAX_RETRY_DELAY
                }
            }
        };

        delay.min(MAX_RETRY_DELAY)
    }
}

/// Exponential backoff used for broker reconnects and bulk write retries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial delay.
    pub initial_delay: Duration,
    /// Maximum delay.
    pub max_delay: Duration,
    /// Multiplier per attempt.
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ExponentialBackoff {
    /// Create a backoff with the given bounds and a multiplier of 2.
    #[must_use]
    pub const fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
        }
    }

    /// Calculate delay for the given attempt number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let delay_secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs.max(0.0))
        }
    }
}

/// Dead letter entry for a job that exhausted its retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// The failed message.
    pub message: JobMessage,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error message.
    pub last_error: String,
    /// Timestamp of last failure.
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Create a new dead letter entry.
    #[must_use]
    pub fn new(message: JobMessage, attempts: u32, error: String) -> Self {
        Self {
            message,
            attempts,
            last_error: error,
            failed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_policy_is_one_based() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_secs(10),
            multiplier: 3.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(90));
    }

    #[test]
    fn test_fixed_and_none_policies() {
        let fixed = BackoffPolicy::Fixed(Duration::from_secs(5));
        assert_eq!(fixed.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(fixed.delay_for_attempt(7), Duration::from_secs(5));

        assert_eq!(BackoffPolicy::None.delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn test_policy_capped() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_secs(3600),
            multiplier: 10.0,
        };
        assert_eq!(policy.delay_for_attempt(40), MAX_RETRY_DELAY);
    }

    #[test]
    fn test_policy_with_bad_multiplier_never_panics() {
        let negative = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            multiplier: -2.0,
        };
        assert_eq!(negative.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(negative.delay_for_attempt(3), Duration::from_secs(4));

        let nan = BackoffPolicy::Exponential {
            base: Duration::from_secs(1),
            multiplier: f64::NAN,
        };
        assert_eq!(nan.delay_for_attempt(2), MAX_RETRY_DELAY);

        let reconnect = ExponentialBackoff {
            multiplier: -1.5,
            ..ExponentialBackoff::default()
        };
        assert_eq!(reconnect.delay_for_attempt(1), Duration::ZERO);
    }

    #[test]
    fn test_reconnect_backoff() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        // Should be capped at max_delay
        assert_eq!(backoff.delay_for_attempt(10), Duration::from_secs(1));
    }
}
