use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies the ownership namespace a processor works in: one consumer
/// group of one stream in one namespace.
///
/// All ownership and checkpoint records are scoped by this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamScope {
    /// Fully qualified namespace hosting the stream (e.g. `ns.example.net`).
    pub fully_qualified_namespace: String,
    /// Name of the stream within the namespace.
    pub stream_name: String,
    /// Consumer group whose cursor and ownership this scope addresses.
    pub consumer_group: String,
}

impl StreamScope {
    pub fn new(
        fully_qualified_namespace: impl Into<String>,
        stream_name: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> Self {
        Self {
            fully_qualified_namespace: fully_qualified_namespace.into(),
            stream_name: stream_name.into(),
            consumer_group: consumer_group.into(),
        }
    }
}

impl fmt::Display for StreamScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.fully_qualified_namespace, self.stream_name, self.consumer_group
        )
    }
}

/// Where a partition receiver begins reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventPosition {
    /// The first event still retained by the partition.
    #[default]
    Earliest,
    /// Only events enqueued after the receiver opens.
    Latest,
    /// An absolute offset within the partition.
    Offset { offset: i64, inclusive: bool },
    /// An absolute sequence number within the partition.
    SequenceNumber { sequence_number: i64, inclusive: bool },
    /// The first event enqueued at or after the given instant (ms since epoch).
    EnqueuedTime { millis: u64 },
}

impl EventPosition {
    /// Position immediately after the event at `offset`.
    #[must_use]
    pub fn after_offset(offset: i64) -> Self {
        Self::Offset {
            offset,
            inclusive: false,
        }
    }

    /// Position at (and including) the event at `offset`.
    #[must_use]
    pub fn from_offset(offset: i64) -> Self {
        Self::Offset {
            offset,
            inclusive: true,
        }
    }

    /// Position immediately after the event with `sequence_number`.
    #[must_use]
    pub fn after_sequence_number(sequence_number: i64) -> Self {
        Self::SequenceNumber {
            sequence_number,
            inclusive: false,
        }
    }
}

/// A durably recorded read position for one partition.
///
/// Written only by the pump currently holding the partition's lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub partition_id: String,
    /// Offset of the last event the owner finished processing.
    pub offset: i64,
    /// Sequence number of the last event the owner finished processing.
    pub sequence_number: i64,
    /// Enqueue time of that event, ms since epoch.
    pub enqueued_time_ms: u64,
}

impl Checkpoint {
    /// Position a newly started receiver resumes from: just past the checkpointed event.
    #[must_use]
    pub fn starting_position(&self) -> EventPosition {
        EventPosition::after_offset(self.offset)
    }
}

/// One row of the shared ownership table.
///
/// `owner_id == None` marks a partition that was explicitly relinquished.
/// `last_modified_ms` doubles as the optimistic-concurrency stamp: a claim
/// carries the stamp it observed and succeeds only if the stored record
/// still has it (`None` meaning "no record exists yet").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionOwnership {
    pub fully_qualified_namespace: String,
    pub stream_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub owner_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_modified_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub checkpoint: Option<Checkpoint>,
}

impl PartitionOwnership {
    /// Builds an unstamped request record for `partition_id` in `scope`.
    pub fn new(scope: &StreamScope, partition_id: impl Into<String>) -> Self {
        Self {
            fully_qualified_namespace: scope.fully_qualified_namespace.clone(),
            stream_name: scope.stream_name.clone(),
            consumer_group: scope.consumer_group.clone(),
            partition_id: partition_id.into(),
            owner_id: None,
            last_modified_ms: None,
            checkpoint: None,
        }
    }

    /// Returns the scope this record belongs to.
    #[must_use]
    pub fn scope(&self) -> StreamScope {
        StreamScope::new(
            self.fully_qualified_namespace.clone(),
            self.stream_name.clone(),
            self.consumer_group.clone(),
        )
    }

    /// Returns `true` if the record is in `scope`.
    #[must_use]
    pub fn is_in(&self, scope: &StreamScope) -> bool {
        self.fully_qualified_namespace == scope.fully_qualified_namespace
            && self.stream_name == scope.stream_name
            && self.consumer_group == scope.consumer_group
    }

    /// Returns `true` if the lease has lapsed or nobody holds it.
    ///
    /// A lease is live while `now_ms - last_modified_ms < lease_duration_ms`.
    #[must_use]
    pub fn is_expired(&self, now_ms: u64, lease_duration_ms: u64) -> bool {
        match (&self.owner_id, self.last_modified_ms) {
            (Some(owner), Some(stamp)) if !owner.is_empty() => {
                now_ms.saturating_sub(stamp) >= lease_duration_ms
            }
            _ => true,
        }
    }

    /// Returns the current owner if the lease is live.
    #[must_use]
    pub fn active_owner(&self, now_ms: u64, lease_duration_ms: u64) -> Option<&str> {
        if self.is_expired(now_ms, lease_duration_ms) {
            None
        } else {
            self.owner_id.as_deref()
        }
    }

    /// Returns `true` if `owner` holds a live lease on this record.
    #[must_use]
    pub fn is_owned_by(&self, owner: &str, now_ms: u64, lease_duration_ms: u64) -> bool {
        self.active_owner(now_ms, lease_duration_ms) == Some(owner)
    }

    /// Derives a claim request for `owner` from this observed record.
    ///
    /// The observed `last_modified_ms` is kept as the concurrency guard.
    #[must_use]
    pub fn claimed_by(&self, owner: &str) -> Self {
        Self {
            owner_id: Some(owner.to_string()),
            ..self.clone()
        }
    }

    /// Derives a release request from this observed record.
    #[must_use]
    pub fn relinquished(&self) -> Self {
        Self {
            owner_id: None,
            ..self.clone()
        }
    }
}

/// Heartbeat of a processor taking part in balancing a scope.
///
/// Lets siblings count a processor that holds no partition yet, so it
/// receives a fair share instead of waiting for leases to lapse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorPresence {
    pub owner_id: String,
    /// Store-assigned time of the latest heartbeat.
    pub last_seen_ms: u64,
}

impl ProcessorPresence {
    /// Live on the same terms as a lease: `now_ms - last_seen_ms < lease_duration_ms`.
    #[must_use]
    pub fn is_live(&self, now_ms: u64, lease_duration_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) < lease_duration_ms
    }
}

/// Result of a conditional ownership write.
///
/// `Conflict` is an expected outcome: another writer changed the record
/// since it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The write succeeded; carries the stored record with its new stamp.
    Claimed(PartitionOwnership),
    /// The observed stamp no longer matches the stored record.
    Conflict,
}

impl ClaimOutcome {
    /// Returns the stored record when the claim succeeded.
    #[must_use]
    pub fn claimed(self) -> Option<PartitionOwnership> {
        match self {
            Self::Claimed(record) => Some(record),
            Self::Conflict => None,
        }
    }
}

/// Result of a conditional checkpoint write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// The checkpoint was stored.
    Updated,
    /// The writer no longer holds the partition's lease.
    Conflict,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> StreamScope {
        StreamScope::new("ns.example.net", "orders", "cg")
    }

    fn owned(owner: &str, stamp: u64) -> PartitionOwnership {
        PartitionOwnership {
            owner_id: Some(owner.to_string()),
            last_modified_ms: Some(stamp),
            ..PartitionOwnership::new(&scope(), "0")
        }
    }

    #[test]
    fn unowned_record_is_expired() {
        let record = PartitionOwnership::new(&scope(), "0");
        assert!(record.is_expired(0, 30_000));
        assert!(record.active_owner(0, 30_000).is_none());
    }

    #[test]
    fn lease_expires_at_duration_boundary() {
        let record = owned("p1", 1_000);
        assert!(!record.is_expired(30_999, 30_000));
        assert!(record.is_expired(31_000, 30_000));
    }

    #[test]
    fn empty_owner_counts_as_unowned() {
        let record = owned("", 1_000);
        assert!(record.is_expired(1_000, 30_000));
    }

    #[test]
    fn claim_keeps_observed_stamp() {
        let record = owned("p1", 5_000);
        let request = record.claimed_by("p2");
        assert_eq!(request.owner_id.as_deref(), Some("p2"));
        assert_eq!(request.last_modified_ms, Some(5_000));

        let release = record.relinquished();
        assert!(release.owner_id.is_none());
        assert_eq!(release.last_modified_ms, Some(5_000));
    }

    #[test]
    fn checkpoint_resumes_after_offset() {
        let checkpoint = Checkpoint {
            partition_id: "0".to_string(),
            offset: 42,
            sequence_number: 7,
            enqueued_time_ms: 0,
        };
        assert_eq!(
            checkpoint.starting_position(),
            EventPosition::Offset {
                offset: 42,
                inclusive: false
            }
        );
    }

    #[test]
    fn ownership_json_skips_empty_fields() {
        let record = PartitionOwnership::new(&scope(), "3");
        let json = serde_json::to_value(&record).expect("serialize");
        assert_eq!(json["partitionId"], "3");
        assert!(json.get("ownerId").is_none());
        assert!(json.get("checkpoint").is_none());
    }

    #[test]
    fn presence_lapses_like_a_lease() {
        let presence = ProcessorPresence {
            owner_id: "p1".to_string(),
            last_seen_ms: 1_000,
        };
        assert!(presence.is_live(30_999, 30_000));
        assert!(!presence.is_live(31_000, 30_000));
        assert!(presence.is_live(0, 30_000));
    }

    #[test]
    fn scope_membership() {
        let record = owned("p1", 0);
        assert!(record.is_in(&scope()));
        assert!(!record.is_in(&StreamScope::new("ns.example.net", "orders", "other")));
        assert_eq!(record.scope(), scope());
        assert_eq!(scope().to_string(), "ns.example.net/orders/cg");
    }
}
