use async_trait::async_trait;

use crate::types::{
    Checkpoint, CheckpointOutcome, ClaimOutcome, PartitionOwnership, ProcessorPresence, StreamScope,
};

/// Durable, cross-process table of partition leases, checkpoints and
/// processor heartbeats.
///
/// The only shared mutable resource between sibling processors. Every write
/// is conditional: claims compare the observed `last_modified_ms` stamp, and
/// checkpoint writes require the writer to still be the recorded owner.
/// Losing either race is reported as a `Conflict` outcome, never as an error.
///
/// Implementations: in-memory (tests, simulation); any key-value service
/// with compare-and-swap semantics in production.
#[async_trait]
pub trait OwnershipStore: Send + Sync {
    /// Lists every ownership record in `scope`. Empty before the first claim.
    async fn list_ownership(&self, scope: &StreamScope) -> anyhow::Result<Vec<PartitionOwnership>>;

    /// Conditionally writes `requested`.
    ///
    /// Succeeds only if the stored record's stamp equals
    /// `requested.last_modified_ms` (`None` = no record may exist). On success
    /// the store assigns a fresh, strictly greater stamp and returns the
    /// stored record. Existing checkpoint data is preserved.
    async fn claim_ownership(&self, requested: PartitionOwnership) -> anyhow::Result<ClaimOutcome>;

    /// Stores `checkpoint` for its partition if `owner_id` still holds the record.
    ///
    /// Does not renew the lease.
    async fn update_checkpoint(
        &self,
        scope: &StreamScope,
        owner_id: &str,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<CheckpointOutcome>;

    /// Reads the last stored checkpoint for a partition.
    async fn get_checkpoint(
        &self,
        scope: &StreamScope,
        partition_id: &str,
    ) -> anyhow::Result<Option<Checkpoint>>;

    /// Records a heartbeat for `owner_id` in `scope`, stamped with the store's clock.
    async fn announce_presence(&self, scope: &StreamScope, owner_id: &str) -> anyhow::Result<()>;

    /// Lists every heartbeat in `scope`, live or not.
    async fn list_presence(&self, scope: &StreamScope) -> anyhow::Result<Vec<ProcessorPresence>>;

    /// Removes `owner_id`'s heartbeat. Removing a missing heartbeat succeeds.
    async fn withdraw_presence(&self, scope: &StreamScope, owner_id: &str) -> anyhow::Result<()>;
}
