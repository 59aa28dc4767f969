//! Full token backfill.
//!
//! Walks every token contract in key order one page per job and marks each
//! stale. The job chains itself through the cursor, and the queue runs a
//! single active consumer so two walks never interleave.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockfeed_common::config::IndexerConfig;
use blockfeed_queue::{JobHandler, JobOutcome, JobResult, QueueDescriptor};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::pending::{PendingEvent, PendingEventQueue};
use crate::source::KeyScan;

pub const BACKFILL_QUEUE: &str = "token-backfill";

/// One backfill page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBackfill {
    /// Last contract of the previous page.
    #[serde(default)]
    pub cursor: Option<String>,
    pub page_size: u64,
}

impl TokenBackfill {
    #[must_use]
    pub const fn start(page_size: u64) -> Self {
        Self {
            cursor: None,
            page_size,
        }
    }
}

pub struct TokenBackfillJob {
    keys: Arc<dyn KeyScan>,
    pending: PendingEventQueue,
    page_size: u64,
    interval: Option<Duration>,
}

impl TokenBackfillJob {
    #[must_use]
    pub fn new(keys: Arc<dyn KeyScan>, pending: PendingEventQueue, page_size: u64) -> Self {
        Self {
            keys,
            pending,
            page_size: page_size.max(1),
            interval: None,
        }
    }

    /// Page size and schedule from the indexer config.
    #[must_use]
    pub fn from_config(keys: Arc<dyn KeyScan>, pending: PendingEventQueue, config: &IndexerConfig) -> Self {
        let job = Self::new(keys, pending, config.backfill_page_size);
        match config.backfill_interval_secs {
            0 => job,
            secs => job.every(Duration::from_secs(secs)),
        }
    }

    /// Start a walk on every tick of `interval`.
    #[must_use]
    pub const fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

#[async_trait]
impl JobHandler for TokenBackfillJob {
    type Payload = TokenBackfill;

    fn descriptor(&self) -> QueueDescriptor {
        let descriptor = QueueDescriptor::new(BACKFILL_QUEUE)
            .concurrency(1)
            .single_active_consumer();
        match self.interval {
            Some(interval) => descriptor.every(interval),
            None => descriptor,
        }
    }

    async fn process(&self, payload: TokenBackfill) -> JobResult<TokenBackfill> {
        let page_size = payload.page_size.max(1);
        let keys = self
            .keys
            .keys_after(payload.cursor.as_deref(), page_size)
            .await?;

        let events: Vec<PendingEvent> = keys.iter().map(PendingEvent::refresh).collect();
        self.pending.add(&events).await?;

        match keys.last() {
            Some(last) if keys.len() as u64 == page_size => Ok(JobOutcome::continue_with(
                TokenBackfill {
                    cursor: Some(last.clone()),
                    page_size,
                },
                Duration::ZERO,
            )),
            _ => {
                info!(last_page = keys.len(), "Token backfill complete");
                Ok(JobOutcome::Done)
            }
        }
    }

    fn scheduled_payload(&self) -> Option<TokenBackfill> {
        Some(TokenBackfill::start(self.page_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{Domain, EventKind};
    use crate::source::MemorySource;
    use blockfeed_queue::MemoryCache;
    use serde_json::json;

    #[tokio::test]
    async fn test_walks_pages_until_short_page() {
        let source = Arc::new(MemorySource::new(Domain::Tokens));
        for key in ["0xa", "0xb", "0xc"] {
            source.put(key, json!({})).await;
        }
        let pending = PendingEventQueue::new(Arc::new(MemoryCache::new()), Domain::Tokens);
        let job = TokenBackfillJob::new(source, pending.clone(), 2);

        let first = job.process(TokenBackfill::start(2)).await.unwrap();
        let JobOutcome::Continue { payload, .. } = first else {
            panic!("expected continuation");
        };
        assert_eq!(payload.cursor.as_deref(), Some("0xb"));

        assert!(job.process(payload).await.unwrap().is_done());
        assert_eq!(pending.count(EventKind::Refresh).await.unwrap(), 3);
    }

    #[test]
    fn test_descriptor_is_exclusive() {
        let source = Arc::new(MemorySource::new(Domain::Tokens));
        let pending = PendingEventQueue::new(Arc::new(MemoryCache::new()), Domain::Tokens);
        let config = IndexerConfig {
            backfill_interval_secs: 86_400,
            ..IndexerConfig::default()
        };
        let job = TokenBackfillJob::from_config(source, pending, &config);

        let descriptor = job.descriptor();
        assert!(descriptor.single_active_consumer);
        assert_eq!(descriptor.effective_concurrency(), 1);
        assert_eq!(descriptor.interval, Some(Duration::from_secs(86_400)));
        assert_eq!(job.scheduled_payload(), Some(TokenBackfill::start(500)));
    }
}
