//! Retry policy with capped backoff and additive jitter.
//!
//! The policy is a pure function from (attempt number, error, elapsed time)
//! to a [`RetryDecision`]. It never sleeps; the dispatcher performs the wait
//! through its injected clock.

use std::{fmt, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first one.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single computed delay.
    pub max_delay: Duration,

    /// Jitter factor in `[0.0, 1.0)`. Adds up to `delay * jitter_factor`.
    pub jitter_factor: f64,

    /// Total time budget across all attempts of one delivery.
    pub max_elapsed: Duration,

    /// Upper bound on a server-supplied `Retry-After` delay.
    pub max_retry_after: Duration,

    /// Strategy for calculating retry delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.2,
            max_elapsed: Duration::from_secs(300),
            max_retry_after: Duration::from_secs(120),
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles after every attempt.
    #[default]
    Exponential,
    /// Delay grows by `base_delay` after every attempt.
    Linear,
}

/// Outcome of consulting the retry policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then retry the same attempt.
    Retry {
        /// How long to wait before the next attempt.
        delay: Duration,
    },
    /// Stop retrying this delivery.
    GiveUp {
        /// Why retrying stopped.
        reason: GiveUpReason,
    },
}

/// Why the policy refused another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The error is not transient.
    NotRetryable {
        /// The error that ended the delivery.
        error: String,
    },
    /// The attempt limit was reached.
    AttemptsExhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// Waiting again would exceed the total time budget.
    BudgetExhausted {
        /// Time spent so far.
        elapsed: Duration,
        /// Configured budget.
        budget: Duration,
    },
}

impl fmt::Display for GiveUpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotRetryable { error } => write!(f, "non-retryable error: {error}"),
            Self::AttemptsExhausted { attempts } => {
                write!(f, "maximum attempts ({attempts}) exhausted")
            },
            Self::BudgetExhausted { elapsed, budget } => write!(
                f,
                "retry budget of {}ms exhausted after {}ms",
                budget.as_millis(),
                elapsed.as_millis()
            ),
        }
    }
}

impl RetryPolicy {
    /// Returns a copy with a different attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns a copy without jitter, for reproducible schedules.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Decides whether attempt `attempt_number` (1-based), which failed with
    /// `error` after `elapsed` total time, should be retried.
    pub fn next(
        &self,
        attempt_number: u32,
        error: &DeliveryError,
        elapsed: Duration,
    ) -> RetryDecision {
        self.next_with_rng(attempt_number, error, elapsed, &mut rand::rng())
    }

    /// Same as [`RetryPolicy::next`] with an explicit random source.
    pub fn next_with_rng<R: Rng + ?Sized>(
        &self,
        attempt_number: u32,
        error: &DeliveryError,
        elapsed: Duration,
        rng: &mut R,
    ) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::NotRetryable { error: error.to_string() },
            };
        }

        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::AttemptsExhausted { attempts: attempt_number },
            };
        }

        let delay = match error.retry_after_seconds() {
            Some(seconds) => std::cmp::min(Duration::from_secs(seconds), self.max_retry_after),
            None => {
                let base = self.scheduled_delay(attempt_number);
                std::cmp::min(add_jitter(base, self.jitter_factor, rng), self.max_delay)
            },
        };

        let budget = self.max_elapsed;
        if elapsed.saturating_add(delay) > budget {
            return RetryDecision::GiveUp {
                reason: GiveUpReason::BudgetExhausted { elapsed, budget },
            };
        }

        RetryDecision::Retry { delay }
    }

    /// Un-jittered delay after attempt `attempt_number`, capped at
    /// `max_delay`.
    pub fn scheduled_delay(&self, attempt_number: u32) -> Duration {
        let attempt = attempt_number.max(1);
        let delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let exponent = (attempt - 1).min(31);
                self.base_delay.saturating_mul(1_u32 << exponent)
            },
        };

        std::cmp::min(delay, self.max_delay)
    }
}

/// Adds a random offset in `[0, duration * jitter_factor]`.
///
/// Jitter never shortens the delay, so an exponential schedule stays
/// strictly increasing below the cap.
fn add_jitter<R: Rng + ?Sized>(duration: Duration, jitter_factor: f64, rng: &mut R) -> Duration {
    if jitter_factor <= 0.0 || duration.is_zero() {
        return duration;
    }

    let factor = jitter_factor.min(0.99);
    let extra = rng.random_range(0.0..=duration.as_secs_f64() * factor);

    duration + Duration::from_secs_f64(extra)
}
