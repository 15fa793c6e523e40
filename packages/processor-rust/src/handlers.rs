//! Handler registration surface and the argument types handlers receive.
//!
//! A processor has four single-slot handlers. `process_event` and
//! `process_error` are required before `start()`; `initialize_partition` and
//! `partition_stopped` default to no-ops. Slots are only mutable while the
//! processor is stopped, which the processor enforces; this module holds the
//! slots and the invocation guards.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use eventflow_core::{EventPosition, LastEnqueuedEventProperties, ReceivedEvent, StreamScope};

use crate::checkpoint::Checkpointer;
use crate::error::ProcessorError;

/// Future returned by every handler.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Type-erased handler taking `A`.
pub type Handler<A> = Arc<dyn Fn(A) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure into a [`Handler`].
pub fn handler<A, F, Fut>(f: F) -> Handler<A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |args| f(args).boxed())
}

// ---------------------------------------------------------------------------
// StopReason
// ---------------------------------------------------------------------------

/// Why processing of a partition ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// The processor is stopping.
    Shutdown,
    /// Another processor holds the lease, this processor released it while
    /// rebalancing, or the partition no longer exists.
    OwnershipLost,
    /// The pump hit an unrecoverable error.
    Fatal,
}

impl StopReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shutdown => "shutdown",
            Self::OwnershipLost => "ownership_lost",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Argument types
// ---------------------------------------------------------------------------

/// Describes the partition a handler invocation belongs to.
#[derive(Clone)]
pub struct PartitionContext {
    scope: Arc<StreamScope>,
    partition_id: String,
    last_enqueued: Arc<ArcSwapOption<LastEnqueuedEventProperties>>,
}

impl fmt::Debug for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionContext")
            .field("scope", &self.scope)
            .field("partition_id", &self.partition_id)
            .finish_non_exhaustive()
    }
}

impl PartitionContext {
    pub(crate) fn new(scope: Arc<StreamScope>, partition_id: String) -> Self {
        Self {
            scope,
            partition_id,
            last_enqueued: Arc::new(ArcSwapOption::empty()),
        }
    }

    #[must_use]
    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.scope.consumer_group
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.scope.stream_name
    }

    #[must_use]
    pub fn fully_qualified_namespace(&self) -> &str {
        &self.scope.fully_qualified_namespace
    }

    /// Last-enqueued metadata from the most recent receive, if the
    /// processor tracks it and the receiver reported it.
    #[must_use]
    pub fn read_last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        self.last_enqueued.load_full().map(|props| (*props).clone())
    }

    pub(crate) fn record_last_enqueued(&self, props: Option<LastEnqueuedEventProperties>) {
        if let Some(props) = props {
            self.last_enqueued.store(Some(Arc::new(props)));
        }
    }
}

/// Passed to the partition-initializing handler before the receiver opens.
#[derive(Debug, Clone)]
pub struct InitializePartitionArgs {
    pub partition: PartitionContext,
    starting_position: Arc<Mutex<EventPosition>>,
}

impl InitializePartitionArgs {
    pub(crate) fn new(partition: PartitionContext, default_position: EventPosition) -> Self {
        Self {
            partition,
            starting_position: Arc::new(Mutex::new(default_position)),
        }
    }

    /// Position used when the partition has no checkpoint.
    #[must_use]
    pub fn default_starting_position(&self) -> EventPosition {
        *self.starting_position.lock()
    }

    /// Overrides the position used when the partition has no checkpoint.
    pub fn set_default_starting_position(&self, position: EventPosition) {
        *self.starting_position.lock() = position;
    }
}

/// Passed to the event handler once per event, or once with no event when
/// the maximum wait time elapsed without data.
#[derive(Debug, Clone)]
pub struct ProcessEventArgs {
    pub partition: PartitionContext,
    pub event: Option<ReceivedEvent>,
    checkpointer: Checkpointer,
}

impl ProcessEventArgs {
    pub(crate) fn new(
        partition: PartitionContext,
        event: Option<ReceivedEvent>,
        checkpointer: Checkpointer,
    ) -> Self {
        Self {
            partition,
            event,
            checkpointer,
        }
    }

    #[must_use]
    pub fn has_event(&self) -> bool {
        self.event.is_some()
    }

    /// Records this event as processed in the ownership store.
    ///
    /// A no-op for empty (liveness) invocations.
    ///
    /// # Errors
    ///
    /// `OwnershipLost` if another processor now holds the partition (the pump
    /// then stops); `Store` if the store is unreachable.
    pub async fn update_checkpoint(&self) -> Result<(), ProcessorError> {
        match &self.event {
            Some(event) => self.checkpointer.checkpoint(event).await,
            None => Ok(()),
        }
    }
}

/// Passed to the stop handler when a partition's pump ends.
#[derive(Debug, Clone)]
pub struct PartitionStoppedArgs {
    pub partition: PartitionContext,
    pub reason: StopReason,
}

/// Passed to the error handler. `partition_id` is `None` for stream-level
/// failures such as listing ownership or discovering partitions.
#[derive(Debug, Clone)]
pub struct ProcessErrorArgs {
    pub partition_id: Option<String>,
    pub operation: String,
    pub error: Arc<anyhow::Error>,
}

// ---------------------------------------------------------------------------
// HandlerSet
// ---------------------------------------------------------------------------

/// The four handler slots as registered by the caller.
#[derive(Default, Clone)]
pub struct HandlerSet {
    pub(crate) initialize_partition: Option<Handler<InitializePartitionArgs>>,
    pub(crate) process_event: Option<Handler<ProcessEventArgs>>,
    pub(crate) partition_stopped: Option<Handler<PartitionStoppedArgs>>,
    pub(crate) process_error: Option<Handler<ProcessErrorArgs>>,
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("initialize_partition", &self.initialize_partition.is_some())
            .field("process_event", &self.process_event.is_some())
            .field("partition_stopped", &self.partition_stopped.is_some())
            .field("process_error", &self.process_error.is_some())
            .finish()
    }
}

impl HandlerSet {
    /// Freezes the slots for a run, failing if a required handler is unset.
    ///
    /// # Errors
    ///
    /// `MissingHandler` naming the first unset required slot.
    pub(crate) fn freeze(&self) -> Result<Arc<ActiveHandlers>, ProcessorError> {
        let process_event = self
            .process_event
            .clone()
            .ok_or(ProcessorError::MissingHandler {
                handler: "process_event",
            })?;
        let process_error = self
            .process_error
            .clone()
            .ok_or(ProcessorError::MissingHandler {
                handler: "process_error",
            })?;
        Ok(Arc::new(ActiveHandlers {
            initialize_partition: self.initialize_partition.clone(),
            process_event,
            partition_stopped: self.partition_stopped.clone(),
            process_error,
        }))
    }
}

/// Immutable handler snapshot used for the duration of one run.
///
/// Every invocation is guarded: a returned error or a panic inside the
/// handler is converted into an `anyhow::Error` instead of unwinding into
/// the pump or the renewal loop.
pub(crate) struct ActiveHandlers {
    initialize_partition: Option<Handler<InitializePartitionArgs>>,
    process_event: Handler<ProcessEventArgs>,
    partition_stopped: Option<Handler<PartitionStoppedArgs>>,
    process_error: Handler<ProcessErrorArgs>,
}

impl ActiveHandlers {
    pub(crate) async fn initialize_partition(&self, args: InitializePartitionArgs) -> anyhow::Result<()> {
        match &self.initialize_partition {
            Some(h) => invoke(h, args).await,
            None => Ok(()),
        }
    }

    pub(crate) async fn process_event(&self, args: ProcessEventArgs) -> anyhow::Result<()> {
        invoke(&self.process_event, args).await
    }

    pub(crate) async fn partition_stopped(&self, args: PartitionStoppedArgs) -> anyhow::Result<()> {
        match &self.partition_stopped {
            Some(h) => invoke(h, args).await,
            None => Ok(()),
        }
    }

    /// Reports an error to the caller's error handler. Failures of the error
    /// handler itself are only logged.
    pub(crate) async fn process_error(
        &self,
        partition_id: Option<&str>,
        operation: &str,
        error: anyhow::Error,
    ) {
        let args = ProcessErrorArgs {
            partition_id: partition_id.map(ToString::to_string),
            operation: operation.to_string(),
            error: Arc::new(error),
        };
        if let Err(e) = invoke(&self.process_error, args).await {
            tracing::warn!(
                partition_id = partition_id.unwrap_or("-"),
                operation,
                error = %e,
                "process_error handler failed"
            );
        }
    }
}

async fn invoke<A>(handler: &Handler<A>, args: A) -> anyhow::Result<()> {
    let fut = std::panic::catch_unwind(AssertUnwindSafe(|| handler(args)))
        .map_err(|panic| anyhow::anyhow!("handler panicked: {}", panic_message(&*panic)))?;
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
