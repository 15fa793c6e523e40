//! In-memory stream: append-only partition logs plus the connection,
//! receiver and connector contracts over them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use eventflow_core::{
    compare_partition_ids, ClockSource, EventData, EventPosition, LastEnqueuedEventProperties,
    ReceivedEvent, SystemClock,
};

use crate::config::ConnectionOptions;
use crate::connection::{
    Connector, Credential, PartitionReceiver, ReceiverOptions, StreamConnection,
};
use crate::error::ReceiveError;

/// Failure a test can queue for a partition's next receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveFault {
    Transient,
    OwnershipLost,
    Fatal,
}

impl ReceiveFault {
    fn into_error(self, partition_id: &str) -> ReceiveError {
        match self {
            Self::Transient => ReceiveError::Transient(anyhow::anyhow!("injected transient fault")),
            Self::OwnershipLost => ReceiveError::OwnershipLost {
                partition_id: partition_id.to_string(),
            },
            Self::Fatal => ReceiveError::Fatal(anyhow::anyhow!("injected fatal fault")),
        }
    }
}

#[derive(Default)]
struct PartitionLog {
    events: RwLock<Vec<ReceivedEvent>>,
    appended: Notify,
    faults: Mutex<VecDeque<ReceiveFault>>,
}

struct StreamShared {
    namespace: String,
    stream_name: String,
    clock: Arc<dyn ClockSource>,
    partitions: RwLock<BTreeMap<String, Arc<PartitionLog>>>,
    fail_partition_queries: AtomicBool,
    receivers_opened: AtomicUsize,
    receivers_closed: AtomicUsize,
    connections_closed: AtomicUsize,
}

impl StreamShared {
    fn partition(&self, partition_id: &str) -> Option<Arc<PartitionLog>> {
        self.partitions.read().get(partition_id).cloned()
    }
}

/// A stream whose partitions live in process memory.
///
/// Cloning yields another handle to the same stream.
#[derive(Clone)]
pub struct InMemoryEventStream {
    shared: Arc<StreamShared>,
}

impl InMemoryEventStream {
    /// Creates a stream with partitions `"0"` through `partition_count - 1`.
    #[must_use]
    pub fn new(namespace: &str, stream_name: &str, partition_count: usize) -> Self {
        Self::with_clock(namespace, stream_name, partition_count, Arc::new(SystemClock))
    }

    /// Like [`InMemoryEventStream::new`], stamping enqueue times with `clock`.
    #[must_use]
    pub fn with_clock(
        namespace: &str,
        stream_name: &str,
        partition_count: usize,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        let partitions = (0..partition_count)
            .map(|i| (i.to_string(), Arc::new(PartitionLog::default())))
            .collect();
        Self {
            shared: Arc::new(StreamShared {
                namespace: namespace.to_string(),
                stream_name: stream_name.to_string(),
                clock,
                partitions: RwLock::new(partitions),
                fail_partition_queries: AtomicBool::new(false),
                receivers_opened: AtomicUsize::new(0),
                receivers_closed: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
            }),
        }
    }

    #[must_use]
    pub fn fully_qualified_namespace(&self) -> &str {
        &self.shared.namespace
    }

    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.shared.stream_name
    }

    /// Opens a new connection to this stream.
    #[must_use]
    pub fn connection(&self) -> Arc<dyn StreamConnection> {
        Arc::new(InMemoryConnection {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }

    /// Adds an empty partition. No-op if it already exists.
    pub fn add_partition(&self, partition_id: &str) {
        self.shared
            .partitions
            .write()
            .entry(partition_id.to_string())
            .or_default();
    }

    /// Deletes a partition and its events.
    pub fn remove_partition(&self, partition_id: &str) {
        self.shared.partitions.write().remove(partition_id);
    }

    /// Appends an event and wakes waiting receivers. Returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the partition does not exist.
    pub fn publish(&self, partition_id: &str, data: EventData) -> anyhow::Result<i64> {
        let log = self
            .shared
            .partition(partition_id)
            .ok_or_else(|| anyhow::anyhow!("partition {partition_id} does not exist"))?;
        let offset = {
            let mut events = log.events.write();
            let offset = i64::try_from(events.len())?;
            events.push(ReceivedEvent {
                partition_id: partition_id.to_string(),
                offset,
                sequence_number: offset,
                enqueued_time_ms: self.shared.clock.now(),
                data,
            });
            offset
        };
        log.appended.notify_waiters();
        Ok(offset)
    }

    /// Queues `fault` to be raised by the partition's next receive call.
    pub fn inject_fault(&self, partition_id: &str, fault: ReceiveFault) {
        if let Some(log) = self.shared.partition(partition_id) {
            log.faults.lock().push_back(fault);
            log.appended.notify_waiters();
        }
    }

    /// Makes partition discovery fail while `fail` is set.
    pub fn fail_partition_queries(&self, fail: bool) {
        self.shared.fail_partition_queries.store(fail, Ordering::SeqCst);
    }

    /// Number of events in a partition.
    #[must_use]
    pub fn event_count(&self, partition_id: &str) -> usize {
        self.shared
            .partition(partition_id)
            .map_or(0, |log| log.events.read().len())
    }

    #[must_use]
    pub fn receivers_opened(&self) -> usize {
        self.shared.receivers_opened.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn receivers_closed(&self) -> usize {
        self.shared.receivers_closed.load(Ordering::SeqCst)
    }

    /// Number of connections to this stream that were closed.
    #[must_use]
    pub fn connections_closed(&self) -> usize {
        self.shared.connections_closed.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct InMemoryConnection {
    shared: Arc<StreamShared>,
    closed: AtomicBool,
}

#[async_trait]
impl StreamConnection for InMemoryConnection {
    fn fully_qualified_namespace(&self) -> &str {
        &self.shared.namespace
    }

    fn stream_name(&self) -> &str {
        &self.shared.stream_name
    }

    async fn partition_ids(&self) -> anyhow::Result<Vec<String>> {
        if self.is_closed() {
            anyhow::bail!("connection is closed");
        }
        if self.shared.fail_partition_queries.load(Ordering::SeqCst) {
            anyhow::bail!("partition query failed");
        }
        let mut ids: Vec<String> = self.shared.partitions.read().keys().cloned().collect();
        ids.sort_by(|a, b| compare_partition_ids(a, b));
        Ok(ids)
    }

    async fn open_receiver(
        &self,
        _consumer_group: &str,
        partition_id: &str,
        position: EventPosition,
        options: &ReceiverOptions,
    ) -> Result<Box<dyn PartitionReceiver>, ReceiveError> {
        if self.is_closed() {
            return Err(ReceiveError::Fatal(anyhow::anyhow!("connection is closed")));
        }
        let log = self.shared.partition(partition_id).ok_or_else(|| {
            ReceiveError::Fatal(anyhow::anyhow!("partition {partition_id} does not exist"))
        })?;
        let next = start_index(&log.events.read(), position);
        self.shared.receivers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryReceiver {
            shared: Arc::clone(&self.shared),
            partition_id: partition_id.to_string(),
            log,
            next,
            track_last_enqueued: options.track_last_enqueued_event_properties,
            closed: false,
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shared.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Index of the first event a receiver opened at `position` returns.
fn start_index(events: &[ReceivedEvent], position: EventPosition) -> usize {
    let from = |value: i64, inclusive: bool| {
        let first = if inclusive { value } else { value.saturating_add(1) };
        usize::try_from(first.max(0)).unwrap_or(usize::MAX).min(events.len())
    };
    match position {
        EventPosition::Earliest => 0,
        EventPosition::Latest => events.len(),
        EventPosition::Offset { offset, inclusive } => from(offset, inclusive),
        EventPosition::SequenceNumber {
            sequence_number,
            inclusive,
        } => from(sequence_number, inclusive),
        EventPosition::EnqueuedTime { millis } => events
            .iter()
            .position(|e| e.enqueued_time_ms >= millis)
            .unwrap_or(events.len()),
    }
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

struct InMemoryReceiver {
    shared: Arc<StreamShared>,
    partition_id: String,
    log: Arc<PartitionLog>,
    next: usize,
    track_last_enqueued: bool,
    closed: bool,
}

#[async_trait]
impl PartitionReceiver for InMemoryReceiver {
    async fn receive_batch(
        &mut self,
        max_count: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedEvent>, ReceiveError> {
        if self.closed {
            return Err(ReceiveError::Fatal(anyhow::anyhow!("receiver is closed")));
        }
        let deadline = tokio::time::Instant::now().checked_add(max_wait);
        loop {
            let appended = self.log.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(fault) = self.log.faults.lock().pop_front() {
                return Err(fault.into_error(&self.partition_id));
            }
            {
                let events = self.log.events.read();
                if self.next < events.len() {
                    let end = events.len().min(self.next + max_count.max(1));
                    let batch = events[self.next..end].to_vec();
                    self.next = end;
                    return Ok(batch);
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => appended.await,
            }
        }
    }

    fn last_enqueued_event_properties(&self) -> Option<LastEnqueuedEventProperties> {
        if !self.track_last_enqueued {
            return None;
        }
        let events = self.log.events.read();
        let last = events.last();
        Some(LastEnqueuedEventProperties {
            sequence_number: last.map(|e| e.sequence_number),
            offset: last.map(|e| e.offset),
            enqueued_time_ms: last.map(|e| e.enqueued_time_ms),
            retrieved_at_ms: Some(self.shared.clock.now()),
        })
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if !self.closed {
            self.closed = true;
            self.shared.receivers_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Resolves connection strings and namespaces to registered in-memory streams.
///
/// Connection strings use the `Key=Value;` form with an
/// `Endpoint=sb://<namespace>/` entry and an optional `EntityPath=<stream>`.
#[derive(Default)]
pub struct InMemoryConnector {
    streams: RwLock<HashMap<(String, String), InMemoryEventStream>>,
}

impl InMemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `stream` reachable through this connector.
    pub fn register(&self, stream: &InMemoryEventStream) {
        self.streams.write().insert(
            (
                stream.fully_qualified_namespace().to_string(),
                stream.stream_name().to_string(),
            ),
            stream.clone(),
        );
    }

    fn connect(&self, namespace: &str, stream_name: &str) -> anyhow::Result<Arc<dyn StreamConnection>> {
        self.streams
            .read()
            .get(&(namespace.to_string(), stream_name.to_string()))
            .map(InMemoryEventStream::connection)
            .ok_or_else(|| anyhow::anyhow!("stream {namespace}/{stream_name} not found"))
    }
}

/// Namespace and optional entity path parsed from a connection string.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ConnectionStringParts {
    pub namespace: String,
    pub entity_path: Option<String>,
}

pub(crate) fn parse_connection_string(connection_string: &str) -> anyhow::Result<ConnectionStringParts> {
    let mut namespace = None;
    let mut entity_path = None;
    for pair in connection_string.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("malformed connection string segment `{pair}`"))?;
        match key.trim().to_ascii_lowercase().as_str() {
            "endpoint" => {
                let host = value
                    .trim()
                    .split_once("://")
                    .map_or(value.trim(), |(_, rest)| rest)
                    .trim_end_matches('/');
                namespace = Some(host.to_string());
            }
            "entitypath" => entity_path = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let namespace = namespace
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| anyhow::anyhow!("connection string has no endpoint"))?;
    Ok(ConnectionStringParts {
        namespace,
        entity_path: entity_path.filter(|p| !p.is_empty()),
    })
}

impl Connector for InMemoryConnector {
    fn from_connection_string(
        &self,
        connection_string: &str,
        stream_name: Option<&str>,
        _options: &ConnectionOptions,
    ) -> anyhow::Result<Arc<dyn StreamConnection>> {
        let parts = parse_connection_string(connection_string)?;
        let stream_name = match (parts.entity_path.as_deref(), stream_name) {
            (Some(path), Some(name)) if path != name => {
                anyhow::bail!("connection string names stream `{path}` but `{name}` was requested")
            }
            (Some(path), _) => path,
            (None, Some(name)) if !name.is_empty() => name,
            (None, _) => anyhow::bail!("a stream name is required"),
        };
        self.connect(&parts.namespace, stream_name)
    }

    fn from_namespace(
        &self,
        fully_qualified_namespace: &str,
        stream_name: &str,
        _credential: Arc<dyn Credential>,
        _options: &ConnectionOptions,
    ) -> anyhow::Result<Arc<dyn StreamConnection>> {
        self.connect(fully_qualified_namespace, stream_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> ReceiverOptions {
        ReceiverOptions {
            owner_id: "test".to_string(),
            prefetch_count: 10,
            track_last_enqueued_event_properties: true,
        }
    }

    fn publish_n(stream: &InMemoryEventStream, pid: &str, n: usize) {
        for i in 0..n {
            stream
                .publish(pid, EventData::new(format!("event-{i}").into_bytes()))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn receives_in_order_in_bounded_batches() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        publish_n(&stream, "0", 5);
        let conn = stream.connection();
        let mut rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &options())
            .await
            .unwrap();

        let first = rx.receive_batch(3, Duration::from_millis(10)).await.unwrap();
        let second = rx.receive_batch(3, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<i64> = first.iter().chain(&second).map(|e| e.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(first.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_wait_returns_empty_batch() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        let conn = stream.connection();
        let mut rx = conn
            .open_receiver("cg", "0", EventPosition::Latest, &options())
            .await
            .unwrap();
        let batch = rx.receive_batch(10, Duration::from_secs(5)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn publish_wakes_waiting_receiver() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        let conn = stream.connection();
        let mut rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &options())
            .await
            .unwrap();
        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            publisher.publish("0", EventData::new(b"late".to_vec())).unwrap();
        });
        let batch = rx.receive_batch(10, Duration::from_secs(30)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data.body, b"late");
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_wait_blocks_until_publish() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        let conn = stream.connection();
        let mut rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &options())
            .await
            .unwrap();
        let publisher = stream.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(86_400)).await;
            publisher.publish("0", EventData::new(b"tomorrow".to_vec())).unwrap();
        });
        let batch = rx.receive_batch(10, Duration::MAX).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].data.body, b"tomorrow");
    }

    #[test]
    fn start_positions() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        publish_n(&stream, "0", 4);
        let log = stream.shared.partition("0").unwrap();
        let events = log.events.read();
        assert_eq!(start_index(&events, EventPosition::Earliest), 0);
        assert_eq!(start_index(&events, EventPosition::Latest), 4);
        assert_eq!(start_index(&events, EventPosition::after_offset(1)), 2);
        assert_eq!(start_index(&events, EventPosition::from_offset(1)), 1);
        assert_eq!(start_index(&events, EventPosition::after_offset(99)), 4);
        assert_eq!(start_index(&events, EventPosition::after_sequence_number(-5)), 0);
        assert_eq!(
            start_index(&events, EventPosition::EnqueuedTime { millis: u64::MAX }),
            4
        );
    }

    #[tokio::test]
    async fn injected_fault_surfaces_once() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        publish_n(&stream, "0", 1);
        stream.inject_fault("0", ReceiveFault::Transient);
        let conn = stream.connection();
        let mut rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &options())
            .await
            .unwrap();
        let err = rx.receive_batch(10, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(rx.receive_batch(10, Duration::from_millis(10)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn last_enqueued_properties_reflect_newest_event() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        publish_n(&stream, "0", 3);
        let conn = stream.connection();
        let rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &options())
            .await
            .unwrap();
        let props = rx.last_enqueued_event_properties().unwrap();
        assert_eq!(props.sequence_number, Some(2));

        let untracked = ReceiverOptions {
            track_last_enqueued_event_properties: false,
            ..options()
        };
        let rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &untracked)
            .await
            .unwrap();
        assert!(rx.last_enqueued_event_properties().is_none());
    }

    #[tokio::test]
    async fn closing_counts_and_blocks_reads() {
        let stream = InMemoryEventStream::new("ns", "s", 1);
        let conn = stream.connection();
        let mut rx = conn
            .open_receiver("cg", "0", EventPosition::Earliest, &options())
            .await
            .unwrap();
        rx.close().await.unwrap();
        rx.close().await.unwrap();
        assert_eq!(stream.receivers_closed(), 1);
        assert!(rx.receive_batch(1, Duration::from_millis(1)).await.is_err());

        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(stream.connections_closed(), 1);
        assert!(conn.partition_ids().await.is_err());
    }

    #[test]
    fn connection_string_parsing() {
        let parts =
            parse_connection_string("Endpoint=sb://ns.example.net/;SharedAccessKeyName=k;EntityPath=orders")
                .unwrap();
        assert_eq!(parts.namespace, "ns.example.net");
        assert_eq!(parts.entity_path.as_deref(), Some("orders"));

        let parts = parse_connection_string("Endpoint=sb://ns.example.net/;SharedAccessKey=x").unwrap();
        assert!(parts.entity_path.is_none());

        assert!(parse_connection_string("SharedAccessKey=x").is_err());
        assert!(parse_connection_string("garbage").is_err());
    }

    #[test]
    fn connector_resolves_registered_streams() {
        let stream = InMemoryEventStream::new("ns.example.net", "orders", 2);
        let connector = InMemoryConnector::new();
        connector.register(&stream);
        let opts = ConnectionOptions::default();

        let conn = connector
            .from_connection_string("Endpoint=sb://ns.example.net/;EntityPath=orders", None, &opts)
            .unwrap();
        assert_eq!(conn.stream_name(), "orders");
        assert!(connector
            .from_connection_string("Endpoint=sb://ns.example.net/", Some("orders"), &opts)
            .is_ok());
        assert!(connector
            .from_connection_string("Endpoint=sb://ns.example.net/", None, &opts)
            .is_err());
        assert!(connector
            .from_connection_string(
                "Endpoint=sb://ns.example.net/;EntityPath=orders",
                Some("payments"),
                &opts
            )
            .is_err());
    }
}
