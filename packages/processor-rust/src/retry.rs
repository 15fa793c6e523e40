//! Retry policies for partition receive calls.

use std::fmt::Debug;
use std::time::Duration;

use rand::Rng;

use crate::config::{RetryMode, RetryOptions};
use crate::error::ReceiveError;

/// Fraction of the computed delay randomly added or removed.
const JITTER_FACTOR: f64 = 0.2;

/// Decides whether and when a failed receive is attempted again.
///
/// Supplied either implicitly (built from [`RetryOptions`]) or as a fully
/// custom implementation through `RetryOptions::custom_policy`.
pub trait RetryPolicy: Send + Sync + Debug {
    /// Upper bound on the duration of attempt number `attempt` (0-based).
    fn try_timeout(&self, attempt: u32) -> Duration;

    /// Delay before retrying after `error` on failed attempt number
    /// `attempt` (1-based count of failures so far). `None` means give up.
    fn retry_delay(&self, error: &ReceiveError, attempt: u32) -> Option<Duration>;
}

/// Fixed or exponential backoff with jitter, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BasicRetryPolicy {
    options: RetryOptions,
}

impl BasicRetryPolicy {
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// Delay before jitter is applied.
    fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.options.delay;
        let delay = match self.options.mode {
            RetryMode::Fixed => base,
            RetryMode::Exponential => {
                let exponent = attempt.saturating_sub(1).min(30);
                base.saturating_mul(1u32 << exponent)
            }
        };
        delay.min(self.options.max_delay)
    }
}

impl RetryPolicy for BasicRetryPolicy {
    fn try_timeout(&self, _attempt: u32) -> Duration {
        self.options.try_timeout
    }

    fn retry_delay(&self, error: &ReceiveError, attempt: u32) -> Option<Duration> {
        if !error.is_transient() || attempt > self.options.max_retries {
            return None;
        }
        let base = self.base_delay(attempt);
        let jitter = rand::rng().random_range(-JITTER_FACTOR..=JITTER_FACTOR);
        let jittered = Duration::try_from_secs_f64(base.as_secs_f64() * (1.0 + jitter))
            .unwrap_or(self.options.max_delay);
        Some(jittered.min(self.options.max_delay))
    }
}
