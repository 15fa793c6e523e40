//! Checkpoint writes issued from inside the event handler.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use eventflow_core::{Checkpoint, CheckpointOutcome, OwnershipStore, ReceivedEvent, StreamScope};

use crate::error::ProcessorError;
use crate::handlers::StopReason;

/// One-shot stop request shared by a pump and everything acting on its
/// behalf. The first recorded reason wins.
#[derive(Clone)]
pub(crate) struct StopSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<StopReason>>>,
}

impl StopSignal {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Records `reason` unless one is already set, then cancels the token.
    pub(crate) fn request(&self, reason: StopReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason recorded by `request`, or `Shutdown` when the token was
    /// cancelled from a parent.
    pub(crate) fn reason(&self) -> StopReason {
        self.reason.lock().unwrap_or(StopReason::Shutdown)
    }
}

/// Writes checkpoints for one owned partition.
///
/// A conflicting write means the lease moved to another processor: the
/// owning pump is told to stop with `OwnershipLost`.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn OwnershipStore>,
    scope: Arc<StreamScope>,
    owner_id: Arc<str>,
    partition_id: String,
    last_written: Arc<Mutex<Option<Checkpoint>>>,
    stop: StopSignal,
}

impl fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checkpointer")
            .field("scope", &self.scope)
            .field("owner_id", &self.owner_id)
            .field("partition_id", &self.partition_id)
            .finish_non_exhaustive()
    }
}

impl Checkpointer {
    pub(crate) fn new(
        store: Arc<dyn OwnershipStore>,
        scope: Arc<StreamScope>,
        owner_id: Arc<str>,
        partition_id: String,
        stop: StopSignal,
    ) -> Self {
        Self {
            store,
            scope,
            owner_id,
            partition_id,
            last_written: Arc::new(Mutex::new(None)),
            stop,
        }
    }

    /// Stores `event` as the partition's checkpoint.
    ///
    /// # Errors
    ///
    /// `OwnershipLost` when the store reports this processor no longer owns
    /// the partition; `Store` when the write itself failed.
    pub async fn checkpoint(&self, event: &ReceivedEvent) -> Result<(), ProcessorError> {
        let checkpoint = event.to_checkpoint();
        let outcome = self
            .store
            .update_checkpoint(&self.scope, &self.owner_id, checkpoint.clone())
            .await
            .map_err(ProcessorError::Store)?;
        match outcome {
            CheckpointOutcome::Updated => {
                metrics::counter!("eventflow_checkpoints_written_total").increment(1);
                *self.last_written.lock() = Some(checkpoint);
                Ok(())
            }
            CheckpointOutcome::Conflict => {
                tracing::warn!(
                    partition_id = %self.partition_id,
                    owner_id = %self.owner_id,
                    "checkpoint rejected, partition owned elsewhere"
                );
                self.stop.request(StopReason::OwnershipLost);
                Err(ProcessorError::OwnershipLost {
                    partition_id: self.partition_id.clone(),
                })
            }
        }
    }

    /// Last checkpoint this processor wrote for the partition.
    #[must_use]
    pub fn last_written(&self) -> Option<Checkpoint> {
        self.last_written.lock().clone()
    }
}
