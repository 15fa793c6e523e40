//! Event payload and delivery metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Checkpoint;

/// Application payload of one event: opaque body bytes plus user properties.
///
/// Properties use `BTreeMap` for deterministic serialization order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl EventData {
    /// Creates an event with the given body and no properties.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Adds a user property, returning the event for chaining.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An event as read from a partition, stamped with its position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedEvent {
    pub partition_id: String,
    pub offset: i64,
    pub sequence_number: i64,
    pub enqueued_time_ms: u64,
    pub data: EventData,
}

impl ReceivedEvent {
    /// Checkpoint that marks this event as fully processed.
    #[must_use]
    pub fn to_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            partition_id: self.partition_id.clone(),
            offset: self.offset,
            sequence_number: self.sequence_number,
            enqueued_time_ms: self.enqueued_time_ms,
        }
    }
}

/// Snapshot of the newest event in a partition, reported by receivers that
/// track last-enqueued metadata. Lets handlers measure how far behind they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastEnqueuedEventProperties {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offset: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub enqueued_time_ms: Option<u64>,
    /// When the receiver last refreshed this snapshot, ms since epoch.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retrieved_at_ms: Option<u64>,
}

impl LastEnqueuedEventProperties {
    /// Number of events between `event` and the newest known event, if known.
    #[must_use]
    pub fn lag_behind(&self, event: &ReceivedEvent) -> Option<i64> {
        self.sequence_number
            .map(|last| last.saturating_sub(event.sequence_number).max(0))
    }
}
