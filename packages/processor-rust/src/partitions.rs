//! Cached partition discovery.

use std::time::Duration;

use tokio::time::Instant;

use eventflow_core::sort_partition_ids;

use crate::connection::StreamConnection;

/// Result of a refresh attempt.
#[derive(Debug)]
pub(crate) enum Discovery<'a> {
    /// The list is fresh enough or was just refreshed.
    Current(&'a [String]),
    /// The refresh failed; the previous list is returned alongside the error.
    Stale(&'a [String], anyhow::Error),
    /// The refresh failed and nothing was ever discovered.
    Unavailable(anyhow::Error),
}

/// Last known partition id list, re-queried once older than `refresh_interval`.
#[derive(Debug)]
pub(crate) struct PartitionCache {
    refresh_interval: Duration,
    partition_ids: Option<Vec<String>>,
    refreshed_at: Option<Instant>,
}

impl PartitionCache {
    pub(crate) fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            partition_ids: None,
            refreshed_at: None,
        }
    }

    fn is_due(&self) -> bool {
        match (self.refreshed_at, &self.partition_ids) {
            (Some(at), Some(_)) => at.elapsed() >= self.refresh_interval,
            _ => true,
        }
    }

    /// Returns the partition list, querying `connection` when due.
    pub(crate) async fn discover(&mut self, connection: &dyn StreamConnection) -> Discovery<'_> {
        if self.is_due() {
            match connection.partition_ids().await {
                Ok(mut ids) => {
                    sort_partition_ids(&mut ids);
                    if self.partition_ids.as_ref() != Some(&ids) {
                        tracing::info!(count = ids.len(), "discovered partitions");
                    }
                    self.partition_ids = Some(ids);
                    self.refreshed_at = Some(Instant::now());
                }
                Err(e) => {
                    return match &self.partition_ids {
                        Some(ids) => Discovery::Stale(ids, e),
                        None => Discovery::Unavailable(e),
                    };
                }
            }
        }
        match &self.partition_ids {
            Some(ids) => Discovery::Current(ids),
            None => Discovery::Unavailable(anyhow::anyhow!("partition list never discovered")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventStream;

    fn ids(discovery: &Discovery<'_>) -> Vec<String> {
        match discovery {
            Discovery::Current(ids) | Discovery::Stale(ids, _) => ids.to_vec(),
            Discovery::Unavailable(_) => Vec::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reuses_list_until_interval_elapses() {
        let stream = InMemoryEventStream::new("ns", "stream", 2);
        let connection = stream.connection();
        let mut cache = PartitionCache::new(Duration::from_secs(60));

        assert_eq!(ids(&cache.discover(connection.as_ref()).await), vec!["0", "1"]);
        stream.add_partition("2");
        assert_eq!(ids(&cache.discover(connection.as_ref()).await), vec!["0", "1"]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            ids(&cache.discover(connection.as_ref()).await),
            vec!["0", "1", "2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_stale_list() {
        let stream = InMemoryEventStream::new("ns", "stream", 3);
        let connection = stream.connection();
        let mut cache = PartitionCache::new(Duration::from_secs(1));
        let _ = cache.discover(connection.as_ref()).await;

        stream.fail_partition_queries(true);
        tokio::time::advance(Duration::from_secs(2)).await;
        let discovery = cache.discover(connection.as_ref()).await;
        assert!(matches!(discovery, Discovery::Stale(_, _)));
        assert_eq!(ids(&discovery), vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn failure_without_history_is_unavailable() {
        let stream = InMemoryEventStream::new("ns", "stream", 1);
        stream.fail_partition_queries(true);
        let connection = stream.connection();
        let mut cache = PartitionCache::new(Duration::from_secs(1));
        assert!(matches!(
            cache.discover(connection.as_ref()).await,
            Discovery::Unavailable(_)
        ));

        stream.fail_partition_queries(false);
        assert_eq!(ids(&cache.discover(connection.as_ref()).await), vec!["0"]);
    }
}
