//! In-memory [`OwnershipStore`] backed by [`DashMap`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use eventflow_core::{
    compare_partition_ids, Checkpoint, CheckpointOutcome, ClaimOutcome, ClockSource,
    OwnershipStore, PartitionOwnership, ProcessorPresence, StreamScope, SystemClock,
};

type RecordKey = (StreamScope, String);

/// Ownership table held in process memory.
///
/// Stamps are wall-clock milliseconds from the configured [`ClockSource`],
/// bumped by one when the clock has not moved, so every successful claim
/// gets a strictly greater stamp than any before it.
pub struct InMemoryOwnershipStore {
    records: DashMap<RecordKey, PartitionOwnership>,
    /// Heartbeats keyed by scope and owner id.
    presence: DashMap<RecordKey, u64>,
    clock: Arc<dyn ClockSource>,
    last_stamp: AtomicU64,
    available: AtomicBool,
    failing_writes: AtomicUsize,
}

impl InMemoryOwnershipStore {
    /// Creates an empty store stamping with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Creates an empty store stamping with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            records: DashMap::new(),
            presence: DashMap::new(),
            clock,
            last_stamp: AtomicU64::new(0),
            available: AtomicBool::new(true),
            failing_writes: AtomicUsize::new(0),
        }
    }

    /// Makes every operation fail until re-enabled.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Makes the next `count` claim or checkpoint writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Copy of every record in `scope`, ordered by partition id.
    #[must_use]
    pub fn snapshot(&self, scope: &StreamScope) -> Vec<PartitionOwnership> {
        let mut records: Vec<PartitionOwnership> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == *scope)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| compare_partition_ids(&a.partition_id, &b.partition_id));
        records
    }

    fn next_stamp(&self) -> u64 {
        let now = self.clock.now();
        let previous = self
            .last_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        now.max(previous + 1)
    }

    fn check_available(&self) -> anyhow::Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow::anyhow!("ownership store unavailable"))
        }
    }

    fn check_write(&self) -> anyhow::Result<()> {
        self.check_available()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(anyhow::anyhow!("injected ownership store write failure"))
        } else {
            Ok(())
        }
    }
}

impl Default for InMemoryOwnershipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OwnershipStore for InMemoryOwnershipStore {
    async fn list_ownership(&self, scope: &StreamScope) -> anyhow::Result<Vec<PartitionOwnership>> {
        self.check_available()?;
        Ok(self.snapshot(scope))
    }

    async fn claim_ownership(&self, requested: PartitionOwnership) -> anyhow::Result<ClaimOutcome> {
        self.check_write()?;
        let key = (requested.scope(), requested.partition_id.clone());
        match self.records.entry(key) {
            Entry::Occupied(mut entry) => {
                if entry.get().last_modified_ms != requested.last_modified_ms {
                    return Ok(ClaimOutcome::Conflict);
                }
                let stored = PartitionOwnership {
                    last_modified_ms: Some(self.next_stamp()),
                    checkpoint: entry.get().checkpoint.clone(),
                    ..requested
                };
                entry.insert(stored.clone());
                Ok(ClaimOutcome::Claimed(stored))
            }
            Entry::Vacant(entry) => {
                if requested.last_modified_ms.is_some() {
                    return Ok(ClaimOutcome::Conflict);
                }
                let stored = PartitionOwnership {
                    last_modified_ms: Some(self.next_stamp()),
                    ..requested
                };
                entry.insert(stored.clone());
                Ok(ClaimOutcome::Claimed(stored))
            }
        }
    }

    async fn update_checkpoint(
        &self,
        scope: &StreamScope,
        owner_id: &str,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<CheckpointOutcome> {
        self.check_write()?;
        let key = (scope.clone(), checkpoint.partition_id.clone());
        let Some(mut record) = self.records.get_mut(&key) else {
            return Ok(CheckpointOutcome::Conflict);
        };
        if record.owner_id.as_deref() != Some(owner_id) {
            return Ok(CheckpointOutcome::Conflict);
        }
        record.checkpoint = Some(checkpoint);
        Ok(CheckpointOutcome::Updated)
    }

    async fn get_checkpoint(
        &self,
        scope: &StreamScope,
        partition_id: &str,
    ) -> anyhow::Result<Option<Checkpoint>> {
        self.check_available()?;
        let key = (scope.clone(), partition_id.to_string());
        Ok(self
            .records
            .get(&key)
            .and_then(|record| record.checkpoint.clone()))
    }

    async fn announce_presence(&self, scope: &StreamScope, owner_id: &str) -> anyhow::Result<()> {
        self.check_available()?;
        self.presence
            .insert((scope.clone(), owner_id.to_string()), self.clock.now());
        Ok(())
    }

    async fn list_presence(&self, scope: &StreamScope) -> anyhow::Result<Vec<ProcessorPresence>> {
        self.check_available()?;
        let mut presence: Vec<ProcessorPresence> = self
            .presence
            .iter()
            .filter(|entry| entry.key().0 == *scope)
            .map(|entry| ProcessorPresence {
                owner_id: entry.key().1.clone(),
                last_seen_ms: *entry.value(),
            })
            .collect();
        presence.sort_by(|a, b| a.owner_id.cmp(&b.owner_id));
        Ok(presence)
    }

    async fn withdraw_presence(&self, scope: &StreamScope, owner_id: &str) -> anyhow::Result<()> {
        self.check_available()?;
        self.presence.remove(&(scope.clone(), owner_id.to_string()));
        Ok(())
    }
}
