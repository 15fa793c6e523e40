//! Per-partition pump: reads one partition and drives the event handler.
//!
//! State machine: Starting -> Running -> Stopping -> Stopped, or Faulted
//! from Starting/Running on an unrecoverable error. Each pump runs on its
//! own task and exits when its stop signal fires, after any in-flight
//! handler invocation completes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use eventflow_core::{Checkpoint, EventPosition, OwnershipStore, ReceivedEvent, StreamScope};

use crate::checkpoint::{Checkpointer, StopSignal};
use crate::config::EventProcessorOptions;
use crate::connection::{PartitionReceiver, ReceiverOptions, StreamConnection};
use crate::error::ReceiveError;
use crate::handlers::{
    ActiveHandlers, InitializePartitionArgs, PartitionContext, PartitionStoppedArgs,
    ProcessEventArgs, StopReason,
};
use crate::retry::RetryPolicy;

/// Receive wait used when no maximum wait time is configured. Empty waits
/// are not surfaced to the handler in that mode.
const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(60);

/// Lifecycle of a partition pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Reading the checkpoint, initializing, opening the receiver.
    Starting,
    /// Receiving and dispatching events.
    Running,
    /// Stop requested; finishing the in-flight handler and closing.
    Stopping,
    /// Exited normally.
    Stopped,
    /// Exited on an unrecoverable error.
    Faulted,
}

impl PumpState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

/// Sent to the renewal loop when a pump task ends on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PumpExited {
    pub partition_id: String,
    pub reason: StopReason,
}

/// Collaborators shared by every pump of one processor run.
pub(crate) struct PumpContext {
    pub store: Arc<dyn OwnershipStore>,
    pub connection: Arc<dyn StreamConnection>,
    pub handlers: Arc<ActiveHandlers>,
    pub scope: Arc<StreamScope>,
    pub owner_id: Arc<str>,
    pub options: EventProcessorOptions,
    pub retry: Arc<dyn RetryPolicy>,
    pub exits: Option<mpsc::Sender<PumpExited>>,
}

struct PumpShared {
    ctx: Arc<PumpContext>,
    partition: PartitionContext,
    state: ArcSwap<PumpState>,
    stop: StopSignal,
    checkpointer: Checkpointer,
    stop_reported: AtomicBool,
}

/// Outcome of one receiver session.
enum Session {
    /// Stop signal observed or ownership lost.
    Finished,
    /// Transient failure; reopen after the delay already waited.
    Reopen,
}

/// Handle to a running pump task.
pub(crate) struct PartitionPump {
    shared: Arc<PumpShared>,
    handle: JoinHandle<()>,
}

impl PartitionPump {
    /// Spawns a pump for `partition_id`. Cancelling `parent` stops it with
    /// reason `Shutdown`.
    pub(crate) fn start(ctx: Arc<PumpContext>, partition_id: &str, parent: &CancellationToken) -> Self {
        let stop = StopSignal::new(parent.child_token());
        let partition = PartitionContext::new(Arc::clone(&ctx.scope), partition_id.to_string());
        let checkpointer = Checkpointer::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.scope),
            Arc::clone(&ctx.owner_id),
            partition_id.to_string(),
            stop.clone(),
        );
        let shared = Arc::new(PumpShared {
            ctx,
            partition,
            state: ArcSwap::from_pointee(PumpState::Starting),
            stop,
            checkpointer,
            stop_reported: AtomicBool::new(false),
        });
        let task = Arc::clone(&shared);
        let handle = tokio::spawn(async move { task.run().await }.in_current_span());
        metrics::gauge!("eventflow_active_pumps").increment(1.0);
        Self { shared, handle }
    }

    pub(crate) fn partition_id(&self) -> &str {
        self.shared.partition.partition_id()
    }

    pub(crate) fn state(&self) -> PumpState {
        **self.shared.state.load()
    }

    /// Last checkpoint the event handler wrote through this pump.
    pub(crate) fn last_checkpoint(&self) -> Option<Checkpoint> {
        self.shared.checkpointer.last_written()
    }

    /// Returns `true` once the pump task has exited.
    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signals the pump to stop without waiting.
    pub(crate) fn request_stop(&self, reason: StopReason) {
        self.shared.stop.request(reason);
    }

    /// Signals the pump and waits up to `grace` for it to exit. A pump still
    /// running after `grace` is aborted and its stop is reported here.
    pub(crate) async fn stop(self, reason: StopReason, grace: Duration) -> PumpState {
        self.request_stop(reason);
        self.join(grace).await
    }

    /// Waits up to `grace` for an already signalled pump to exit.
    pub(crate) async fn join(mut self, grace: Duration) -> PumpState {
        if tokio::time::timeout(grace, &mut self.handle).await.is_err() {
            warn!(
                partition_id = self.partition_id(),
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "partition pump did not stop in time, abandoning it"
            );
            self.handle.abort();
            self.shared.state.store(Arc::new(PumpState::Stopped));
            self.shared.report_stopped(self.shared.stop.reason()).await;
        }
        self.state()
    }
}

impl Drop for PartitionPump {
    fn drop(&mut self) {
        metrics::gauge!("eventflow_active_pumps").decrement(1.0);
    }
}

impl PumpShared {
    fn set_state(&self, state: PumpState) {
        self.state.store(Arc::new(state));
    }

    fn partition_id(&self) -> &str {
        self.partition.partition_id()
    }

    async fn run(self: Arc<Self>) {
        info!(partition_id = self.partition_id(), "partition pump starting");
        let (reason, state) = match self.pump().await {
            Ok(()) => (self.stop.reason(), PumpState::Stopped),
            Err(error) => {
                self.stop.request(StopReason::Fatal);
                warn!(partition_id = self.partition_id(), error = %error, "partition pump faulted");
                self.ctx
                    .handlers
                    .process_error(Some(self.partition_id()), "receive events", error)
                    .await;
                (StopReason::Fatal, PumpState::Faulted)
            }
        };

        self.report_stopped(reason).await;
        self.set_state(state);
        info!(partition_id = self.partition_id(), reason = %reason, "partition pump stopped");

        if let Some(exits) = &self.ctx.exits {
            let _ = exits.try_send(PumpExited {
                partition_id: self.partition_id().to_string(),
                reason,
            });
        }
    }

    /// Invokes the stop handler once per pump.
    async fn report_stopped(&self, reason: StopReason) {
        if self.stop_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        let args = PartitionStoppedArgs {
            partition: self.partition.clone(),
            reason,
        };
        if let Err(error) = self.ctx.handlers.partition_stopped(args).await {
            self.ctx
                .handlers
                .process_error(Some(self.partition_id()), "partition stopped", error)
                .await;
        }
    }

    async fn pump(&self) -> anyhow::Result<()> {
        let ctx = &self.ctx;
        let partition_id = self.partition_id();

        let Some(checkpoint) = self.read_checkpoint().await? else {
            self.set_state(PumpState::Stopping);
            return Ok(());
        };

        let init = InitializePartitionArgs::new(
            self.partition.clone(),
            ctx.options.default_starting_position,
        );
        if let Err(error) = ctx.handlers.initialize_partition(init.clone()).await {
            ctx.handlers
                .process_error(Some(partition_id), "initialize partition", error)
                .await;
        }

        let mut position = match &checkpoint {
            Some(cp) => cp.starting_position(),
            None => init.default_starting_position(),
        };
        debug!(partition_id, ?position, "resolved starting position");

        let mut failures = 0u32;
        loop {
            let Some(mut receiver) = self.open(position, &mut failures).await? else {
                break;
            };
            self.set_state(PumpState::Running);
            let session = self.receive(receiver.as_mut(), &mut position, &mut failures).await;
            if let Err(error) = receiver.close().await {
                warn!(partition_id, error = %error, "closing receiver failed");
            }
            match session? {
                Session::Finished => break,
                Session::Reopen => {}
            }
        }

        self.set_state(PumpState::Stopping);
        Ok(())
    }

    /// Reads the stored checkpoint, retrying store failures under the retry
    /// policy. `None` means the pump was asked to stop first.
    async fn read_checkpoint(&self) -> anyhow::Result<Option<Option<Checkpoint>>> {
        let ctx = &self.ctx;
        let mut failures = 0u32;
        loop {
            if self.stop.is_requested() {
                return Ok(None);
            }
            let result = tokio::select! {
                biased;
                () = self.stop.token().cancelled() => return Ok(None),
                result = ctx.store.get_checkpoint(&ctx.scope, self.partition_id()) => result,
            };
            let error = match result {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(error) => ReceiveError::Transient(error),
            };
            failures += 1;
            let Some(delay) = ctx.retry.retry_delay(&error, failures) else {
                return Err(anyhow::Error::new(error)
                    .context(format!("reading checkpoint failed {failures} time(s)")));
            };
            warn!(
                partition_id = self.partition_id(),
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "reading checkpoint failed, retrying"
            );
            ctx.handlers
                .process_error(
                    Some(self.partition_id()),
                    "read checkpoint",
                    anyhow::Error::new(error),
                )
                .await;
            tokio::select! {
                biased;
                () = self.stop.token().cancelled() => return Ok(None),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Opens a receiver at `position`, retrying transient failures. `None`
    /// means the pump was asked to stop first.
    async fn open(
        &self,
        position: EventPosition,
        failures: &mut u32,
    ) -> anyhow::Result<Option<Box<dyn PartitionReceiver>>> {
        let ctx = &self.ctx;
        let options = ReceiverOptions {
            owner_id: ctx.owner_id.to_string(),
            prefetch_count: ctx.options.prefetch_count,
            track_last_enqueued_event_properties: ctx.options.track_last_enqueued_event_properties,
        };
        loop {
            if self.stop.is_requested() {
                return Ok(None);
            }
            let attempt = tokio::time::timeout(
                ctx.retry.try_timeout(*failures),
                ctx.connection.open_receiver(
                    &ctx.scope.consumer_group,
                    self.partition_id(),
                    position,
                    &options,
                ),
            );
            let result = tokio::select! {
                biased;
                () = self.stop.token().cancelled() => return Ok(None),
                result = attempt => result,
            };
            let error = match result {
                Ok(Ok(receiver)) => return Ok(Some(receiver)),
                Ok(Err(error)) => error,
                Err(_) => ReceiveError::Transient(anyhow::anyhow!("opening receiver timed out")),
            };
            if !self.backoff(error, failures).await? {
                return Ok(None);
            }
        }
    }

    /// Receives and dispatches until stopped or a receive fails.
    async fn receive(
        &self,
        receiver: &mut dyn PartitionReceiver,
        position: &mut EventPosition,
        failures: &mut u32,
    ) -> anyhow::Result<Session> {
        let ctx = &self.ctx;
        let max_wait = ctx.options.maximum_wait_time.unwrap_or(DEFAULT_RECEIVE_WAIT);
        let report_empty = ctx.options.maximum_wait_time.is_some();
        let try_timeout = ctx.retry.try_timeout(*failures);

        loop {
            let received = tokio::select! {
                biased;
                () = self.stop.token().cancelled() => return Ok(Session::Finished),
                received = tokio::time::timeout(
                    max_wait.saturating_add(try_timeout),
                    receiver.receive_batch(ctx.options.max_batch_size, max_wait),
                ) => received,
            };
            let received = received.unwrap_or_else(|_| {
                Err(ReceiveError::Transient(anyhow::anyhow!("receive timed out")))
            });

            let events = match received {
                Ok(events) => events,
                Err(error) => {
                    return Ok(if self.backoff(error, failures).await? {
                        Session::Reopen
                    } else {
                        Session::Finished
                    });
                }
            };
            *failures = 0;

            if ctx.options.track_last_enqueued_event_properties {
                self.partition
                    .record_last_enqueued(receiver.last_enqueued_event_properties());
            }

            if events.is_empty() {
                if report_empty {
                    self.dispatch(None).await;
                }
            } else {
                for event in events {
                    *position = EventPosition::after_offset(event.offset);
                    self.dispatch(Some(event)).await;
                    if self.stop.is_requested() {
                        return Ok(Session::Finished);
                    }
                }
            }
            if self.stop.is_requested() {
                return Ok(Session::Finished);
            }
        }
    }

    /// Handles a failed receiver call. Returns `Ok(true)` to retry after the
    /// policy delay, `Ok(false)` if the pump should wind down, and `Err` when
    /// the failure is unrecoverable.
    async fn backoff(&self, error: ReceiveError, failures: &mut u32) -> anyhow::Result<bool> {
        if let ReceiveError::OwnershipLost { .. } = error {
            info!(partition_id = self.partition_id(), "receiver displaced by another reader");
            self.stop.request(StopReason::OwnershipLost);
            self.ctx
                .handlers
                .process_error(
                    Some(self.partition_id()),
                    "receive events",
                    anyhow::Error::new(error),
                )
                .await;
            return Ok(false);
        }
        *failures += 1;
        let Some(delay) = self.ctx.retry.retry_delay(&error, *failures) else {
            return Err(anyhow::Error::new(error)
                .context(format!("giving up after {} failed attempt(s)", *failures)));
        };
        warn!(
            partition_id = self.partition_id(),
            attempt = *failures,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "receive failed, retrying"
        );
        metrics::counter!("eventflow_receive_retries_total").increment(1);
        tokio::select! {
            biased;
            () = self.stop.token().cancelled() => Ok(false),
            () = tokio::time::sleep(delay) => Ok(true),
        }
    }

    async fn dispatch(&self, event: Option<ReceivedEvent>) {
        let ctx = &self.ctx;
        if event.is_some() {
            metrics::counter!("eventflow_events_dispatched_total").increment(1);
        }
        let args = ProcessEventArgs::new(self.partition.clone(), event, self.checkpointer.clone());
        if let Err(error) = ctx.handlers.process_event(args).await {
            metrics::counter!("eventflow_handler_errors_total").increment(1);
            ctx.handlers
                .process_error(Some(self.partition_id()), "process event", error)
                .await;
        }
    }
}
