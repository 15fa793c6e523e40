//! Processor configuration types.

use std::sync::Arc;
use std::time::Duration;

use eventflow_core::EventPosition;

use crate::error::ProcessorError;
use crate::retry::{BasicRetryPolicy, RetryPolicy};

/// Top-level configuration for an [`EventProcessor`](crate::EventProcessor).
///
/// Cloned at construction: mutating the caller's copy afterwards has no
/// effect on a constructed processor.
#[derive(Debug, Clone)]
pub struct EventProcessorOptions {
    /// How long a receive may wait for data. When set, an empty wait
    /// invokes the event handler once with no event (liveness signal).
    pub maximum_wait_time: Option<Duration>,
    /// Ask receivers to report last-enqueued metadata with each batch.
    pub track_last_enqueued_event_properties: bool,
    /// Events a receiver may buffer ahead of the handler.
    pub prefetch_count: usize,
    /// Maximum events requested per receive call.
    pub max_batch_size: usize,
    /// Start position for partitions without a checkpoint, unless the
    /// partition-initializing handler overrides it.
    pub default_starting_position: EventPosition,
    /// How aggressively new partitions are claimed.
    pub load_balancing_strategy: LoadBalancingStrategy,
    /// Interval between renewal cycles.
    pub load_balancing_interval: Duration,
    /// Lease duration: an ownership not renewed within this window is stale.
    pub ownership_expiration: Duration,
    /// How long a discovered partition list is reused before re-querying.
    pub partition_refresh_interval: Duration,
    /// Grace period `stop()` grants pumps to unwind.
    pub shutdown_timeout: Duration,
    /// Transport settings for the stream connection.
    pub connection: ConnectionOptions,
    /// Retry settings for receive calls.
    pub retry: RetryOptions,
}

impl Default for EventProcessorOptions {
    fn default() -> Self {
        Self {
            maximum_wait_time: None,
            track_last_enqueued_event_properties: false,
            prefetch_count: 300,
            max_batch_size: 100,
            default_starting_position: EventPosition::Earliest,
            load_balancing_strategy: LoadBalancingStrategy::Balanced,
            load_balancing_interval: Duration::from_secs(10),
            ownership_expiration: Duration::from_secs(30),
            partition_refresh_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            connection: ConnectionOptions::default(),
            retry: RetryOptions::default(),
        }
    }
}

impl EventProcessorOptions {
    /// Checks cross-field invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the lease is not longer than the
    /// balancing interval, or if any count or interval is zero.
    pub fn validate(&self) -> Result<(), ProcessorError> {
        if self.max_batch_size == 0 {
            return Err(ProcessorError::invalid_argument(
                "max_batch_size",
                "must be greater than zero",
            ));
        }
        if self.load_balancing_interval.is_zero() {
            return Err(ProcessorError::invalid_argument(
                "load_balancing_interval",
                "must be greater than zero",
            ));
        }
        if self.ownership_expiration <= self.load_balancing_interval {
            return Err(ProcessorError::invalid_argument(
                "ownership_expiration",
                "must be longer than load_balancing_interval",
            ));
        }
        if self.maximum_wait_time.is_some_and(|wait| wait.is_zero()) {
            return Err(ProcessorError::invalid_argument(
                "maximum_wait_time",
                "must be greater than zero when set",
            ));
        }
        self.retry.validate()
    }

    /// Lease duration in milliseconds, as compared against store stamps.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn ownership_expiration_ms(&self) -> u64 {
        self.ownership_expiration.as_millis() as u64
    }
}

/// Claiming behaviour of the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    /// Claim at most one new partition per cycle.
    Balanced,
    /// Claim up to the full fair share in one cycle.
    Greedy,
}

/// Wire transport used by the stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportType {
    /// Plain TCP transport.
    #[default]
    Amqp,
    /// Transport tunneled over web sockets (port 443).
    AmqpWebSockets,
}

/// Stream connection options.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub transport: TransportType,
    /// Optional proxy address, only meaningful for web-socket transport.
    pub proxy: Option<String>,
}

/// Backoff shape for the basic retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    Fixed,
    #[default]
    Exponential,
}

/// Retry configuration for receive calls.
///
/// When `custom_policy` is set it replaces every numeric setting.
#[derive(Debug, Clone)]
pub struct RetryOptions {
    pub mode: RetryMode,
    pub max_retries: u32,
    pub delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single attempt.
    pub try_timeout: Duration,
    pub custom_policy: Option<Arc<dyn RetryPolicy>>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            mode: RetryMode::Exponential,
            max_retries: 3,
            delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
            try_timeout: Duration::from_secs(60),
            custom_policy: None,
        }
    }
}

impl RetryOptions {
    /// Returns the effective policy: the custom one if supplied, otherwise a
    /// [`BasicRetryPolicy`] built from the numeric settings.
    #[must_use]
    pub fn policy(&self) -> Arc<dyn RetryPolicy> {
        match &self.custom_policy {
            Some(policy) => Arc::clone(policy),
            None => Arc::new(BasicRetryPolicy::new(self.clone())),
        }
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        if self.custom_policy.is_some() {
            return Ok(());
        }
        if self.try_timeout.is_zero() {
            return Err(ProcessorError::invalid_argument(
                "retry.try_timeout",
                "must be greater than zero",
            ));
        }
        if self.max_delay < self.delay {
            return Err(ProcessorError::invalid_argument(
                "retry.max_delay",
                "must not be shorter than retry.delay",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReceiveError;

    #[derive(Debug)]
    struct NeverRetry;

    impl RetryPolicy for NeverRetry {
        fn try_timeout(&self, _attempt: u32) -> Duration {
            Duration::from_secs(1)
        }

        fn retry_delay(&self, _error: &ReceiveError, _attempt: u32) -> Option<Duration> {
            None
        }
    }

    #[test]
    fn processor_options_defaults() {
        let options = EventProcessorOptions::default();
        assert!(options.maximum_wait_time.is_none());
        assert!(!options.track_last_enqueued_event_properties);
        assert_eq!(options.default_starting_position, EventPosition::Earliest);
        assert_eq!(options.load_balancing_strategy, LoadBalancingStrategy::Balanced);
        assert_eq!(options.load_balancing_interval, Duration::from_secs(10));
        assert_eq!(options.ownership_expiration, Duration::from_secs(30));
        assert_eq!(options.ownership_expiration_ms(), 30_000);
        assert_eq!(options.connection.transport, TransportType::Amqp);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn retry_options_defaults() {
        let retry = RetryOptions::default();
        assert_eq!(retry.mode, RetryMode::Exponential);
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.delay, Duration::from_millis(800));
        assert_eq!(retry.max_delay, Duration::from_secs(60));
        assert!(retry.custom_policy.is_none());
    }

    #[test]
    fn lease_must_outlive_interval() {
        let options = EventProcessorOptions {
            load_balancing_interval: Duration::from_secs(30),
            ownership_expiration: Duration::from_secs(30),
            ..Default::default()
        };
        let err = options.validate().unwrap_err();
        assert!(matches!(
            err,
            ProcessorError::InvalidArgument {
                name: "ownership_expiration",
                ..
            }
        ));
    }

    #[test]
    fn zero_batch_and_zero_wait_rejected() {
        let options = EventProcessorOptions {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = EventProcessorOptions {
            maximum_wait_time: Some(Duration::ZERO),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn custom_policy_overrides_numeric_settings() {
        let custom: Arc<dyn RetryPolicy> = Arc::new(NeverRetry);
        let retry = RetryOptions {
            // Would fail validation on its own.
            try_timeout: Duration::ZERO,
            custom_policy: Some(Arc::clone(&custom)),
            ..Default::default()
        };
        assert!(retry.validate().is_ok());
        assert!(Arc::ptr_eq(&retry.policy(), &custom));
    }

    #[test]
    fn cloned_options_are_independent() {
        let mut original = EventProcessorOptions {
            maximum_wait_time: Some(Duration::from_secs(2)),
            track_last_enqueued_event_properties: true,
            ..Default::default()
        };
        original.connection.transport = TransportType::AmqpWebSockets;
        original.retry.max_retries = 7;

        let cloned = original.clone();
        original.retry.max_retries = 1;
        original.connection.transport = TransportType::Amqp;

        assert_eq!(cloned.maximum_wait_time, Some(Duration::from_secs(2)));
        assert!(cloned.track_last_enqueued_event_properties);
        assert_eq!(cloned.connection.transport, TransportType::AmqpWebSockets);
        assert_eq!(cloned.retry.max_retries, 7);
        assert_eq!(original.retry.max_retries, 1);
    }
}
