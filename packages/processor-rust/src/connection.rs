//! Stream transport contracts.
//!
//! The processor never speaks a wire protocol itself. It discovers
//! partitions and opens per-partition receivers through a
//! [`StreamConnection`], which a [`Connector`] builds from either a
//! connection string or a namespace plus credential.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventflow_core::{EventPosition, LastEnqueuedEventProperties, ReceivedEvent};

use crate::config::ConnectionOptions;
use crate::error::ReceiveError;

/// Opaque credential used to authorize a namespace connection.
pub trait Credential: Send + Sync + Debug {}

/// Settings a pump passes when opening a receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverOptions {
    /// Identity of the processor opening the receiver, for diagnostics.
    pub owner_id: String,
    pub prefetch_count: usize,
    pub track_last_enqueued_event_properties: bool,
}

/// An open connection to one stream.
#[async_trait]
pub trait StreamConnection: Send + Sync {
    /// Namespace hosting the stream.
    fn fully_qualified_namespace(&self) -> &str;

    /// Name of the stream.
    fn stream_name(&self) -> &str;

    /// Queries the current partition id list.
    async fn partition_ids(&self) -> anyhow::Result<Vec<String>>;

    /// Opens a receiver for one partition of `consumer_group` starting at `position`.
    async fn open_receiver(
        &self,
        consumer_group: &str,
        partition_id: &str,
        position: EventPosition,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn PartitionReceiver>, ReceiveError>;

    /// Closes the connection and every receiver opened from it.
    async fn close(&self) -> anyhow::Result<()>;

    /// Returns `true` once `close()` has completed.
    fn is_closed(&self) -> bool;
}

/// Pull-based reader for a single partition.
///
/// Each `receive_batch` call resolves with up to `max_count` events, or with
/// an empty batch once `max_wait` elapses without data. Events arrive in
/// partition order. Dropping an in-flight `receive_batch` future must not
/// lose events that were not yet returned.
#[async_trait]
pub trait PartitionReceiver: Send {
    async fn receive_batch(
        &mut self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedEvent>, ReceiveError>;

    /// Newest-event metadata, when the receiver was opened with tracking enabled.
    fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties>;

    /// Releases the receiver's link.
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Builds stream connections. Connection-string parsing and credential
/// exchange live behind this seam.
pub trait Connector: Send + Sync {
    /// Connects using a connection string. `stream_name` is required when
    /// the string does not name the stream itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection string is malformed.
    fn from_connection_string(
        &self,
        connection_string: &str,
        stream_name: Option<&str>,
        options: &ConnectionOptions,
    ) -> anyhow::Result<Arc<dyn StreamConnection>>;

    /// Connects to `stream_name` in `fully_qualified_namespace` using `credential`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be addressed.
    fn from_namespace(
        &self,
        fully_qualified_namespace: &str,
        stream_name: &str,
        credential: Arc<dyn Credential>,
        options: &ConnectionOptions,
    ) -> anyhow::Result<Arc<dyn StreamConnection>>;
}
