//! Error types surfaced by the processor.
//!
//! [`ProcessorError`] is returned synchronously from construction, lifecycle
//! and checkpoint calls. [`ReceiveError`] classifies failures raised by a
//! partition receiver so the pump can decide between retrying, stopping with
//! `OwnershipLost`, or faulting.

/// Errors returned by processor operations.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    /// A constructor or option argument failed validation.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },
    /// The call is not allowed in the processor's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// `start()` was called before a required handler was registered.
    #[error("the `{handler}` handler must be set before starting the processor")]
    MissingHandler { handler: &'static str },
    /// A conditional write found that another processor now owns the partition.
    #[error("ownership of partition {partition_id} was lost")]
    OwnershipLost { partition_id: String },
    /// The ownership store failed; retryable on the next cycle.
    #[error("ownership store error: {0}")]
    Store(#[source] anyhow::Error),
    /// The stream connection failed.
    #[error("connection error: {0}")]
    Connection(#[source] anyhow::Error),
}

impl ProcessorError {
    pub(crate) fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    /// Returns `true` if retrying the same call later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Connection(_))
    }
}

/// Failures raised by a partition receiver.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// Network blip, throttling, timeout: retried per the retry policy.
    #[error("transient receive failure: {0}")]
    Transient(#[source] anyhow::Error),
    /// The service handed the partition's read to another consumer.
    #[error("receiver for partition {partition_id} was displaced by another reader")]
    OwnershipLost { partition_id: String },
    /// Anything the pump cannot recover from.
    #[error("fatal receive failure: {0}")]
    Fatal(#[source] anyhow::Error),
}

impl ReceiveError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
