//! The event processor: lifecycle, handler registration and construction.
//!
//! An [`EventProcessor`] cooperates with every other processor sharing its
//! ownership store and consumer group. There is no leader: each instance
//! runs its own renewal loop, and the leases recorded in the store decide
//! which instance reads which partition.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};

use eventflow_core::{ClockSource, OwnershipStore, StreamScope, SystemClock};

use crate::config::EventProcessorOptions;
use crate::connection::{Connector, Credential, StreamConnection};
use crate::cycle::OwnershipCycle;
use crate::error::ProcessorError;
use crate::handlers::{
    handler, HandlerSet, InitializePartitionArgs, PartitionStoppedArgs, ProcessErrorArgs,
    ProcessEventArgs,
};
use crate::pump::PumpContext;
use crate::worker::BackgroundWorker;

/// Slack on top of the shutdown timeout for the renewal loop to finish its
/// own bookkeeping before it is aborted.
const STOP_MARGIN: Duration = Duration::from_millis(500);

/// Whether the renewal loop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessorState {
    #[default]
    NotRunning,
    Running,
}

/// Handler slots and run state, guarded together so a setter can never
/// interleave with `start()`.
#[derive(Default)]
struct Lifecycle {
    state: ProcessorState,
    handlers: HandlerSet,
}

struct ActiveRun {
    worker: BackgroundWorker<OwnershipCycle>,
    token: CancellationToken,
}

/// Consumes every partition of a stream on behalf of a consumer group,
/// sharing the work with other processors through an ownership store.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use eventflow_processor::{EventProcessor, EventProcessorOptions};
/// # use eventflow_processor::memory::{InMemoryEventStream, InMemoryOwnershipStore};
/// # async fn demo() -> anyhow::Result<()> {
/// let stream = InMemoryEventStream::new("ns", "orders", 4);
/// let processor = EventProcessor::with_connection(
///     "billing",
///     Arc::new(InMemoryOwnershipStore::new()),
///     stream.connection(),
///     EventProcessorOptions::default(),
/// )?;
/// processor.set_process_event_handler(|args| async move {
///     args.update_checkpoint().await?;
///     Ok(())
/// })?;
/// processor.set_process_error_handler(|args| async move {
///     eprintln!("{}: {}", args.operation, args.error);
///     Ok(())
/// })?;
/// processor.start().await?;
/// processor.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct EventProcessor {
    identifier: String,
    scope: Arc<StreamScope>,
    store: Arc<dyn OwnershipStore>,
    connection: Arc<dyn StreamConnection>,
    owns_connection: bool,
    options: EventProcessorOptions,
    clock: Arc<dyn ClockSource>,
    lifecycle: RwLock<Lifecycle>,
    /// Serializes `start()` and `stop()`.
    run: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor")
            .field("identifier", &self.identifier)
            .field("scope", &self.scope)
            .field("owns_connection", &self.owns_connection)
            .field("state", &self.lifecycle.read().state)
            .finish_non_exhaustive()
    }
}

fn require_non_empty(name: &'static str, value: &str) -> Result<(), ProcessorError> {
    if value.trim().is_empty() {
        Err(ProcessorError::invalid_argument(name, "must not be empty"))
    } else {
        Ok(())
    }
}

impl EventProcessor {
    /// Creates a processor that connects through `connection_string`.
    ///
    /// `stream_name` is required unless the connection string names the
    /// stream itself. The connection is owned by the processor and closed
    /// by [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty consumer group or connection
    /// string, a connection string the connector rejects, or invalid options.
    pub fn from_connection_string(
        consumer_group: &str,
        store: Arc<dyn OwnershipStore>,
        connection_string: &str,
        stream_name: Option<&str>,
        options: EventProcessorOptions,
        connector: &dyn Connector,
    ) -> Result<Self, ProcessorError> {
        require_non_empty("consumer_group", consumer_group)?;
        require_non_empty("connection_string", connection_string)?;
        options.validate()?;
        let connection = connector
            .from_connection_string(connection_string, stream_name, &options.connection)
            .map_err(|error| ProcessorError::invalid_argument("connection_string", format!("{error:#}")))?;
        Ok(Self::build(consumer_group, store, connection, true, options))
    }

    /// Creates a processor for `stream_name` in `fully_qualified_namespace`,
    /// authorizing with `credential`. The connection is not owned.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for empty names, a missing credential or
    /// invalid options, and `Connection` if the connector fails.
    pub fn from_namespace(
        consumer_group: &str,
        store: Arc<dyn OwnershipStore>,
        fully_qualified_namespace: &str,
        stream_name: &str,
        credential: Option<Arc<dyn Credential>>,
        options: EventProcessorOptions,
        connector: &dyn Connector,
    ) -> Result<Self, ProcessorError> {
        require_non_empty("consumer_group", consumer_group)?;
        require_non_empty("fully_qualified_namespace", fully_qualified_namespace)?;
        require_non_empty("stream_name", stream_name)?;
        let credential =
            credential.ok_or_else(|| ProcessorError::invalid_argument("credential", "must be provided"))?;
        options.validate()?;
        let connection = connector
            .from_namespace(fully_qualified_namespace, stream_name, credential, &options.connection)
            .map_err(ProcessorError::Connection)?;
        Ok(Self::build(consumer_group, store, connection, false, options))
    }

    /// Creates a processor over a caller-supplied connection, which the
    /// processor never closes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an empty consumer group or invalid options.
    pub fn with_connection(
        consumer_group: &str,
        store: Arc<dyn OwnershipStore>,
        connection: Arc<dyn StreamConnection>,
        options: EventProcessorOptions,
    ) -> Result<Self, ProcessorError> {
        require_non_empty("consumer_group", consumer_group)?;
        options.validate()?;
        Ok(Self::build(consumer_group, store, connection, false, options))
    }

    fn build(
        consumer_group: &str,
        store: Arc<dyn OwnershipStore>,
        connection: Arc<dyn StreamConnection>,
        owns_connection: bool,
        options: EventProcessorOptions,
    ) -> Self {
        let scope = StreamScope::new(
            connection.fully_qualified_namespace(),
            connection.stream_name(),
            consumer_group,
        );
        Self {
            identifier: uuid::Uuid::new_v4().to_string(),
            scope: Arc::new(scope),
            store,
            connection,
            owns_connection,
            options,
            clock: Arc::new(SystemClock),
            lifecycle: RwLock::new(Lifecycle::default()),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Replaces the clock used to judge lease expiry. It must agree with
    /// the clock stamping the ownership store.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Unique identity recorded as owner in the ownership store.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    #[must_use]
    pub fn fully_qualified_namespace(&self) -> &str {
        self.connection.fully_qualified_namespace()
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        self.connection.stream_name()
    }

    #[must_use]
    pub fn consumer_group(&self) -> &str {
        &self.scope.consumer_group
    }

    #[must_use]
    pub fn state(&self) -> ProcessorState {
        self.lifecycle.read().state
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == ProcessorState::Running
    }

    fn update_handlers(&self, set: impl FnOnce(&mut HandlerSet)) -> Result<(), ProcessorError> {
        let mut lifecycle = self.lifecycle.write();
        if lifecycle.state == ProcessorState::Running {
            return Err(ProcessorError::InvalidState(
                "handlers cannot be changed while the processor is running",
            ));
        }
        set(&mut lifecycle.handlers);
        Ok(())
    }

    /// Sets the optional handler invoked before a partition starts reading.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the processor is running.
    pub fn set_initialize_partition_handler<F, Fut>(&self, f: F) -> Result<(), ProcessorError>
    where
        F: Fn(InitializePartitionArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.update_handlers(|h| h.initialize_partition = Some(handler(f)))
    }

    /// Sets the required handler invoked for every received event.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the processor is running.
    pub fn set_process_event_handler<F, Fut>(&self, f: F) -> Result<(), ProcessorError>
    where
        F: Fn(ProcessEventArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.update_handlers(|h| h.process_event = Some(handler(f)))
    }

    /// Sets the optional handler invoked when a partition stops.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the processor is running.
    pub fn set_partition_stopped_handler<F, Fut>(&self, f: F) -> Result<(), ProcessorError>
    where
        F: Fn(PartitionStoppedArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.update_handlers(|h| h.partition_stopped = Some(handler(f)))
    }

    /// Sets the required handler for failures outside the event handler's
    /// own return path.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while the processor is running.
    pub fn set_process_error_handler<F, Fut>(&self, f: F) -> Result<(), ProcessorError>
    where
        F: Fn(ProcessErrorArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.update_handlers(|h| h.process_error = Some(handler(f)))
    }

    /// Starts the renewal loop and returns once it is scheduled.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if already running and `MissingHandler` if
    /// the event or error handler is unset.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let mut run = self.run.lock().await;
        let handlers = {
            let mut lifecycle = self.lifecycle.write();
            if lifecycle.state == ProcessorState::Running {
                return Err(ProcessorError::InvalidState("the processor is already running"));
            }
            let handlers = lifecycle.handlers.freeze()?;
            lifecycle.state = ProcessorState::Running;
            handlers
        };

        let token = CancellationToken::new();
        let span = info_span!(
            "event_processor",
            processor_id = %self.identifier,
            consumer_group = %self.scope.consumer_group,
        );
        let worker = span.in_scope(|| {
            BackgroundWorker::start(
                |exits| {
                    let ctx = Arc::new(PumpContext {
                        store: Arc::clone(&self.store),
                        connection: Arc::clone(&self.connection),
                        handlers,
                        scope: Arc::clone(&self.scope),
                        owner_id: Arc::from(self.identifier.as_str()),
                        options: self.options.clone(),
                        retry: self.options.retry.policy(),
                        exits: Some(exits),
                    });
                    OwnershipCycle::new(ctx, Arc::clone(&self.clock), token.clone())
                },
                self.options.load_balancing_interval,
            )
        });
        info!(
            processor_id = %self.identifier,
            consumer_group = %self.scope.consumer_group,
            stream = %self.scope.stream_name,
            "event processor started"
        );
        *run = Some(ActiveRun { worker, token });
        Ok(())
    }

    /// Stops every pump, releases the processor's leases and waits for the
    /// renewal loop to exit, for no longer than the shutdown timeout plus a
    /// small margin. Succeeds without effect when not running.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for store-backed
    /// shutdown failures.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        let mut run = self.run.lock().await;
        let Some(mut active) = run.take() else {
            return Ok(());
        };
        active.token.cancel();
        let limit = self.options.shutdown_timeout.saturating_add(STOP_MARGIN);
        if !active.worker.stop(limit).await {
            warn!(processor_id = %self.identifier, "renewal loop abandoned during stop");
        }
        self.lifecycle.write().state = ProcessorState::NotRunning;
        info!(processor_id = %self.identifier, "event processor stopped");
        Ok(())
    }

    /// Stops the processor and closes the connection if this processor
    /// created it.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if closing an owned connection fails.
    pub async fn close(&self) -> Result<(), ProcessorError> {
        self.stop().await?;
        if self.owns_connection && !self.connection.is_closed() {
            self.connection.close().await.map_err(ProcessorError::Connection)?;
        }
        Ok(())
    }
}
