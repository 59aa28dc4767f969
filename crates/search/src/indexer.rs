//! Batch indexer.
//!
//! Pops a batch of pending events for one domain, re-reads the referenced
//! entities and writes their documents with a single bulk request. Items the
//! index rejects are logged and dropped; retryable items are resent with
//! backoff and, if they keep failing, handed back to the pending queue.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockfeed_common::config::IndexerConfig;
use blockfeed_common::{AppResult, get_metrics, metrics};
use blockfeed_queue::{ExponentialBackoff, ScheduledTask, TaskError};
use tracing::{debug, error, info, warn};

use crate::documents::document_id;
use crate::index::{BulkOp, ItemOutcome, SearchIndex};
use crate::pending::{Domain, EventKind, PendingEvent, PendingEventQueue};
use crate::source::EntitySource;

/// Upper bound on batches drained per scheduled cycle.
const MAX_BATCHES_PER_CYCLE: usize = 20;

/// Indexer settings.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    /// Target index name.
    pub index: String,
    pub batch_size: usize,
    /// Bulk attempts per batch, first one included.
    pub max_attempts: u32,
    pub retry: ExponentialBackoff,
    pub interval: Duration,
    pub lock_ttl: Duration,
}

impl IndexerSettings {
    #[must_use]
    pub fn from_config(config: &IndexerConfig, index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            batch_size: config.batch_size.max(1),
            max_attempts: config.max_attempts.max(1),
            retry: ExponentialBackoff::new(
                Duration::from_millis(config.retry_base_ms),
                Duration::from_secs(30),
            ),
            interval: Duration::from_millis(config.interval_ms),
            lock_ttl: Duration::from_millis(config.lock_ttl_ms),
        }
    }
}

/// Counts for one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Events popped from the pending queue.
    pub events: usize,
    /// Items the index accepted.
    pub written: usize,
    /// Items dropped as invalid.
    pub rejected: usize,
    /// Items handed back to the pending queue.
    pub requeued: usize,
}

#[derive(Debug, Clone)]
struct Planned {
    key: String,
    kind: EventKind,
    op: BulkOp,
}

/// Drains one domain's pending events into the search index.
pub struct BatchIndexer {
    name: String,
    pending: PendingEventQueue,
    source: Arc<dyn EntitySource>,
    index: Arc<dyn SearchIndex>,
    settings: IndexerSettings,
}

impl BatchIndexer {
    #[must_use]
    pub fn new(
        pending: PendingEventQueue,
        source: Arc<dyn EntitySource>,
        index: Arc<dyn SearchIndex>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            name: format!("indexer:{}", pending.domain()),
            pending,
            source,
            index,
            settings,
        }
    }

    #[must_use]
    pub const fn domain(&self) -> Domain {
        self.pending.domain()
    }

    /// Drain one batch.
    pub async fn drain_batch(&self) -> AppResult<DrainReport> {
        let batch_size = self.settings.batch_size;
        let mut events = self.pending.get(EventKind::Refresh, batch_size).await?;
        let room = batch_size.saturating_sub(events.len());
        events.extend(self.pending.get(EventKind::Remove, room).await?);

        if events.is_empty() {
            return Ok(DrainReport::default());
        }

        let planned = match self.plan(&events).await {
            Ok(planned) => planned,
            Err(e) => {
                // The events are already popped; hand them back before failing.
                self.requeue_events(&events).await;
                return Err(e);
            }
        };

        let mut report = self.submit(planned).await;
        report.events = events.len();
        Ok(report)
    }

    /// Turn events into bulk items from a fresh read of each key.
    async fn plan(&self, events: &[PendingEvent]) -> AppResult<Vec<Planned>> {
        let mut refresh = BTreeSet::new();
        let mut remove = BTreeSet::new();
        for event in events {
            match event.kind {
                EventKind::Refresh => refresh.insert(event.key.clone()),
                EventKind::Remove => remove.insert(event.key.clone()),
            };
        }
        // A refresh re-reads the row, which already tells whether it is gone.
        remove.retain(|key| !refresh.contains(key));

        let keys: Vec<String> = refresh.into_iter().collect();
        let mut documents = if keys.is_empty() {
            Default::default()
        } else {
            self.source.load(&keys).await?
        };

        let domain = self.domain();
        let index = &self.settings.index;
        let mut planned = Vec::with_capacity(keys.len() + remove.len());

        for key in keys {
            let id = document_id(domain, &key);
            let op = match documents.remove(&key) {
                Some(document) => BulkOp::Index {
                    index: index.clone(),
                    id,
                    document,
                },
                None => BulkOp::Delete {
                    index: index.clone(),
                    id,
                },
            };
            planned.push(Planned {
                key,
                kind: EventKind::Refresh,
                op,
            });
        }

        for key in remove {
            planned.push(Planned {
                op: BulkOp::Delete {
                    index: index.clone(),
                    id: document_id(domain, &key),
                },
                key,
                kind: EventKind::Remove,
            });
        }

        Ok(planned)
    }

    async fn submit(&self, mut planned: Vec<Planned>) -> DrainReport {
        let mut report = DrainReport::default();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let ops: Vec<BulkOp> = planned.iter().map(|p| p.op.clone()).collect();

            let retry = match self.index.bulk(&ops).await {
                Ok(outcomes) => {
                    let mut retry = Vec::new();
                    for (item, outcome) in planned.into_iter().zip(outcomes) {
                        match outcome {
                            ItemOutcome::Succeeded => report.written += 1,
                            ItemOutcome::Rejected(reason) => {
                                error!(
                                    domain = %self.domain(),
                                    key = %item.key,
                                    reason = %reason,
                                    "Search index rejected document; dropped"
                                );
                                report.rejected += 1;
                            }
                            ItemOutcome::Retryable(reason) => {
                                debug!(domain = %self.domain(), key = %item.key, reason = %reason, "Retryable bulk item");
                                retry.push(item);
                            }
                        }
                    }
                    retry
                }
                Err(e) => {
                    warn!(domain = %self.domain(), attempt, items = planned.len(), error = %e, "Bulk request failed");
                    planned
                }
            };

            if retry.is_empty() {
                break;
            }

            if attempt >= self.settings.max_attempts {
                report.requeued = retry.len();
                let events: Vec<PendingEvent> = retry
                    .into_iter()
                    .map(|item| PendingEvent::new(item.kind, item.key))
                    .collect();
                warn!(
                    domain = %self.domain(),
                    attempts = attempt,
                    items = events.len(),
                    "Bulk items still failing; returned to pending queue"
                );
                self.requeue_events(&events).await;
                break;
            }

            metrics::incr(&get_metrics().index_batches_retried);
            tokio::time::sleep(self.settings.retry.delay_for_attempt(attempt - 1)).await;
            planned = retry;
        }

        metrics::add(&get_metrics().index_docs_written, report.written as u64);
        metrics::add(&get_metrics().index_items_rejected, report.rejected as u64);
        report
    }

    async fn requeue_events(&self, events: &[PendingEvent]) {
        if let Err(e) = self.pending.add(events).await {
            error!(
                domain = %self.domain(),
                count = events.len(),
                error = %e,
                "Could not return events to pending queue; index stale until next backfill"
            );
        }
    }
}

#[async_trait]
impl ScheduledTask for BatchIndexer {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    fn lock_ttl(&self) -> Duration {
        self.settings.lock_ttl
    }

    async fn run(&self) -> Result<u64, TaskError> {
        let mut total = DrainReport::default();

        for _ in 0..MAX_BATCHES_PER_CYCLE {
            let report = self.drain_batch().await?;
            total.events += report.events;
            total.written += report.written;
            total.rejected += report.rejected;
            total.requeued += report.requeued;

            if report.events < self.settings.batch_size || report.requeued > 0 {
                break;
            }
        }

        if total.events > 0 {
            info!(
                domain = %self.domain(),
                events = total.events,
                written = total.written,
                rejected = total.rejected,
                requeued = total.requeued,
                "Indexer cycle"
            );
        }
        Ok(total.events as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryIndex;
    use crate::source::MemorySource;
    use blockfeed_queue::MemoryCache;
    use serde_json::json;

    struct Fixture {
        pending: PendingEventQueue,
        source: Arc<MemorySource>,
        index: Arc<MemoryIndex>,
        indexer: BatchIndexer,
    }

    fn fixture(batch_size: usize) -> Fixture {
        let pending = PendingEventQueue::new(Arc::new(MemoryCache::new()), Domain::Tokens);
        let source = Arc::new(MemorySource::new(Domain::Tokens));
        let index = Arc::new(MemoryIndex::new());
        let settings = IndexerSettings {
            index: "tokens".to_string(),
            batch_size,
            max_attempts: 3,
            retry: ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100)),
            interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(30),
        };
        let indexer = BatchIndexer::new(pending.clone(), source.clone(), index.clone(), settings);
        Fixture {
            pending,
            source,
            index,
            indexer,
        }
    }

    #[tokio::test]
    async fn test_duplicate_keys_read_once() {
        let f = fixture(10);
        f.source.put("0xa", json!({ "symbol": "A" })).await;
        f.pending
            .add(&[PendingEvent::refresh("0xa"), PendingEvent::refresh("0xa")])
            .await
            .unwrap();

        let report = f.indexer.drain_batch().await.unwrap();
        assert_eq!(report.events, 2);
        assert_eq!(report.written, 1);
        assert_eq!(f.source.loads().await, vec![vec!["0xa".to_string()]]);
        assert_eq!(
            f.index.document("tokens", "token:0xa").await,
            Some(json!({ "symbol": "A" }))
        );
    }

    #[tokio::test]
    async fn test_vanished_entity_deleted() {
        let f = fixture(10);
        f.source.put("0xa", json!({ "v": 1 })).await;
        f.pending.add(&[PendingEvent::refresh("0xa")]).await.unwrap();
        f.indexer.drain_batch().await.unwrap();

        f.source.delete("0xa").await;
        f.pending.add(&[PendingEvent::refresh("0xa")]).await.unwrap();
        f.indexer.drain_batch().await.unwrap();

        assert!(f.index.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_events_delete_without_reading() {
        let f = fixture(10);
        f.source.put("0xa", json!({ "v": 1 })).await;
        f.pending.add(&[PendingEvent::refresh("0xa")]).await.unwrap();
        f.indexer.drain_batch().await.unwrap();

        f.pending.add(&[PendingEvent::remove("0xa")]).await.unwrap();
        let report = f.indexer.drain_batch().await.unwrap();

        assert_eq!(report.written, 1);
        assert!(f.index.is_empty().await);
        assert_eq!(f.source.loads().await.len(), 1);
    }

    #[tokio::test]
    async fn test_batch_size_bounds_pop() {
        let f = fixture(2);
        for key in ["0xa", "0xb", "0xc"] {
            f.source.put(key, json!({})).await;
            f.pending.add(&[PendingEvent::refresh(key)]).await.unwrap();
        }

        assert_eq!(f.indexer.drain_batch().await.unwrap().events, 2);
        assert_eq!(f.pending.count(EventKind::Refresh).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failures_requeued() {
        let f = fixture(10);
        f.source.put("0xa", json!({})).await;
        f.index.fail_transiently("token:0xa", 10).await;
        f.pending.add(&[PendingEvent::refresh("0xa")]).await.unwrap();

        let report = f.indexer.drain_batch().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(f.index.requests().await.len(), 3);

        let back = f.pending.get(EventKind::Refresh, 10).await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].key, "0xa");
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_run_drains_until_empty() {
        let f = fixture(2);
        for key in ["0xa", "0xb", "0xc", "0xd", "0xe"] {
            f.source.put(key, json!({})).await;
            f.pending.add(&[PendingEvent::refresh(key)]).await.unwrap();
        }

        assert_eq!(f.indexer.run().await.unwrap(), 5);
        assert_eq!(f.index.len().await, 5);
        assert_eq!(f.pending.depth().await.unwrap(), 0);
    }
}
