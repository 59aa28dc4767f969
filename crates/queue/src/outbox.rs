//! Transactional outbox.
//!
//! Messages the broker refused are stored here and republished by
//! [`OutboxRecovery`], a scheduled task guarded by a distributed lock so
//! only one process drains the outbox at a time. A record is deleted only
//! after its message was handed to the broker.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blockfeed_common::config::OutboxConfig;
use blockfeed_common::{AppError, AppResult, IdGenerator, get_metrics, metrics};
use blockfeed_db::entities::outbox_message;
use blockfeed_db::repositories::OutboxRepository;
use chrono::{DateTime, Utc};
use sea_orm::Set;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::BrokerError;
use crate::job::JobMessage;
use crate::registry::HandlerRegistry;
use crate::scheduler::{ScheduledTask, TaskError};

/// Lock key serializing recovery cycles.
pub const RECOVERY_LOCK_KEY: &str = "outbox:recovery";

/// A message waiting to be republished.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: String,
    pub queue: String,
    pub message: JobMessage,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl OutboxEntry {
    /// Record a refused publish.
    #[must_use]
    pub fn capture(message: JobMessage, error: &BrokerError) -> Self {
        Self {
            id: IdGenerator::new().generate(),
            queue: message.queue.clone(),
            message,
            last_error: Some(error.to_string()),
            failed_at: Utc::now(),
        }
    }
}

/// Durable outbox storage.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, entry: OutboxEntry) -> AppResult<()>;

    /// Oldest records first.
    async fn oldest(&self, limit: u64) -> AppResult<Vec<OutboxEntry>>;

    async fn delete(&self, ids: &[String]) -> AppResult<u64>;

    async fn count(&self) -> AppResult<u64>;
}

#[async_trait]
impl OutboxStore for OutboxRepository {
    async fn insert(&self, entry: OutboxEntry) -> AppResult<()> {
        let model = outbox_message::ActiveModel {
            id: Set(entry.id),
            queue: Set(entry.queue),
            message: Set(serde_json::to_value(&entry.message)?),
            last_error: Set(entry.last_error),
            failed_at: Set(entry.failed_at.into()),
        };
        Self::insert(self, model).await
    }

    async fn oldest(&self, limit: u64) -> AppResult<Vec<OutboxEntry>> {
        let rows = self.find_oldest(limit).await?;
        let mut entries = Vec::with_capacity(rows.len());
        let mut corrupt = Vec::new();

        for row in rows {
            match serde_json::from_value::<JobMessage>(row.message) {
                Ok(message) => entries.push(OutboxEntry {
                    id: row.id,
                    queue: row.queue,
                    message,
                    last_error: row.last_error,
                    failed_at: row.failed_at.with_timezone(&Utc),
                }),
                Err(e) => {
                    error!(id = %row.id, queue = %row.queue, error = %e, "Dropping undecodable outbox record");
                    corrupt.push(row.id);
                }
            }
        }

        if !corrupt.is_empty() {
            self.delete_by_ids(&corrupt).await?;
        }
        Ok(entries)
    }

    async fn delete(&self, ids: &[String]) -> AppResult<u64> {
        self.delete_by_ids(ids).await
    }

    async fn count(&self) -> AppResult<u64> {
        Self::count(self).await
    }
}

/// In-process outbox.
#[derive(Default)]
pub struct MemoryOutbox {
    entries: Mutex<Vec<OutboxEntry>>,
    unavailable: AtomicBool,
}

impl MemoryOutbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(AppError::Database("memory outbox offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
    async fn insert(&self, entry: OutboxEntry) -> AppResult<()> {
        self.check()?;
        self.entries.lock().await.push(entry);
        Ok(())
    }

    async fn oldest(&self, limit: u64) -> AppResult<Vec<OutboxEntry>> {
        self.check()?;
        let mut entries = self.entries.lock().await.clone();
        entries.sort_by(|a, b| a.failed_at.cmp(&b.failed_at).then_with(|| a.id.cmp(&b.id)));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn delete(&self, ids: &[String]) -> AppResult<u64> {
        self.check()?;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|e| !ids.contains(&e.id));
        Ok((before - entries.len()) as u64)
    }

    async fn count(&self) -> AppResult<u64> {
        self.check()?;
        Ok(self.entries.lock().await.len() as u64)
    }
}

/// Recovery cycle settings.
#[derive(Debug, Clone)]
pub struct OutboxRecoveryConfig {
    pub interval: Duration,
    pub batch_size: u64,
    pub lock_ttl: Duration,
}

impl Default for OutboxRecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            batch_size: 100,
            lock_ttl: Duration::from_secs(30),
        }
    }
}

impl From<&OutboxConfig> for OutboxRecoveryConfig {
    fn from(config: &OutboxConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            batch_size: config.batch_size,
            lock_ttl: Duration::from_millis(config.lock_ttl_ms),
        }
    }
}

/// Republishes outbox records to their queues.
pub struct OutboxRecovery {
    registry: Arc<HandlerRegistry>,
    config: OutboxRecoveryConfig,
}

impl OutboxRecovery {
    #[must_use]
    pub const fn new(registry: Arc<HandlerRegistry>, config: OutboxRecoveryConfig) -> Self {
        Self { registry, config }
    }

    /// One recovery pass. Returns the number of records republished.
    ///
    /// Callers must hold [`RECOVERY_LOCK_KEY`]; the scheduler does.
    pub async fn recover(&self) -> AppResult<u64> {
        let publisher = self.registry.publisher();
        let store = publisher.outbox();
        let records = store.oldest(self.config.batch_size).await?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut by_queue: BTreeMap<String, Vec<OutboxEntry>> = BTreeMap::new();
        for record in records {
            by_queue.entry(record.queue.clone()).or_default().push(record);
        }

        let mut delivered = Vec::new();
        for (queue, entries) in by_queue {
            if !self.registry.contains(&queue) {
                warn!(queue = %queue, count = entries.len(), "No handler registered; outbox records kept");
                continue;
            }

            let messages = entries.iter().map(|e| e.message.clone()).collect();
            let failed = publisher.broker().publish_batch(messages).await;
            let failed_ids: HashSet<String> = failed.iter().map(|f| f.message.id.clone()).collect();

            if let Some(first) = failed.first() {
                warn!(
                    queue = %queue,
                    failed = failed.len(),
                    error = %first.error,
                    "Outbox republish incomplete; remaining records retried next cycle"
                );
            }

            delivered.extend(
                entries
                    .into_iter()
                    .filter(|e| !failed_ids.contains(&e.message.id))
                    .map(|e| e.id),
            );
        }

        if delivered.is_empty() {
            return Ok(0);
        }

        let deleted = store.delete(&delivered).await?;
        metrics::add(&get_metrics().outbox_republished, deleted);
        debug!(deleted, "Outbox records republished");
        Ok(deleted)
    }
}

#[async_trait]
impl ScheduledTask for OutboxRecovery {
    fn name(&self) -> &str {
        "outbox-recovery"
    }

    fn interval(&self) -> Duration {
        self.config.interval
    }

    fn lock_keys(&self) -> Vec<String> {
        vec![RECOVERY_LOCK_KEY.to_string()]
    }

    fn lock_ttl(&self) -> Duration {
        self.config.lock_ttl
    }

    async fn run(&self) -> Result<u64, TaskError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            let remaining = self.registry.publisher().outbox().count().await.unwrap_or(0);
            info!(recovered, remaining, "Outbox recovery cycle");
        }
        Ok(recovered)
    }
}
