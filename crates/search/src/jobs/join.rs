//! Activity to transaction join.
//!
//! An activity can land before the transaction it references. The join job
//! looks the transaction up; while it is missing the job re-enqueues itself
//! with a growing delay, and after [`MAX_JOIN_ATTEMPTS`] it gives up. A
//! missing join is a data-quality gap, not a failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockfeed_common::{AppResult, get_metrics, metrics};
use blockfeed_db::entities::transaction;
use blockfeed_db::repositories::{ActivityRepository, TransactionRepository};
use blockfeed_queue::{JobHandler, JobOptions, JobOutcome, JobResult, QueueDescriptor};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::pending::{PendingEvent, PendingEventQueue};

pub const JOIN_QUEUE: &str = "activity-tx-join";

/// Lookups before the join is abandoned.
pub const MAX_JOIN_ATTEMPTS: u32 = 5;

/// Delay added per failed lookup.
pub const JOIN_RETRY_STEP: Duration = Duration::from_secs(10);

/// Join request. `attempt` counts lookups already made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinActivityTransaction {
    pub activity_id: String,
    pub tx_hash: String,
    #[serde(default)]
    pub attempt: u32,
}

impl JoinActivityTransaction {
    #[must_use]
    pub fn new(activity_id: impl Into<String>, tx_hash: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            tx_hash: tx_hash.into(),
            attempt: 0,
        }
    }

    /// Options of the first enqueue. Redelivered change events collapse into it.
    #[must_use]
    pub fn job_options(&self) -> JobOptions {
        JobOptions::with_job_id(format!("join:{}", self.activity_id))
    }
}

/// Where a join stands after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Transaction not there yet; another attempt is scheduled.
    PendingJoin,
    Joined,
    /// Attempts exhausted.
    Abandoned,
}

impl JoinState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::PendingJoin)
    }
}

/// Storage the join reads and writes.
#[async_trait]
pub trait JoinStore: Send + Sync {
    async fn find_transaction(&self, hash: &str) -> AppResult<Option<transaction::Model>>;

    /// Copy block data from `tx` into the activity. Returns whether a row changed.
    async fn attach(&self, activity_id: &str, tx: &transaction::Model) -> AppResult<bool>;
}

/// [`JoinStore`] over the repositories.
#[derive(Clone)]
pub struct RepositoryJoinStore {
    transactions: TransactionRepository,
    activities: ActivityRepository,
}

impl RepositoryJoinStore {
    #[must_use]
    pub const fn new(transactions: TransactionRepository, activities: ActivityRepository) -> Self {
        Self {
            transactions,
            activities,
        }
    }
}

#[async_trait]
impl JoinStore for RepositoryJoinStore {
    async fn find_transaction(&self, hash: &str) -> AppResult<Option<transaction::Model>> {
        self.transactions.find_by_hash(hash).await
    }

    async fn attach(&self, activity_id: &str, tx: &transaction::Model) -> AppResult<bool> {
        self.activities.attach_transaction(activity_id, tx).await
    }
}

/// In-process [`JoinStore`].
#[derive(Default)]
pub struct MemoryJoinStore {
    transactions: Mutex<HashMap<String, transaction::Model>>,
    joined: Mutex<HashMap<String, String>>,
    lookups: Mutex<u32>,
}

impl MemoryJoinStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_transaction(&self, tx: transaction::Model) {
        self.transactions.lock().await.insert(tx.hash.clone(), tx);
    }

    /// Transaction hash joined into `activity_id`, if any.
    pub async fn joined(&self, activity_id: &str) -> Option<String> {
        self.joined.lock().await.get(activity_id).cloned()
    }

    pub async fn lookups(&self) -> u32 {
        *self.lookups.lock().await
    }
}

#[async_trait]
impl JoinStore for MemoryJoinStore {
    async fn find_transaction(&self, hash: &str) -> AppResult<Option<transaction::Model>> {
        *self.lookups.lock().await += 1;
        Ok(self.transactions.lock().await.get(hash).cloned())
    }

    async fn attach(&self, activity_id: &str, tx: &transaction::Model) -> AppResult<bool> {
        let mut joined = self.joined.lock().await;
        if joined.contains_key(activity_id) {
            return Ok(false);
        }
        joined.insert(activity_id.to_string(), tx.hash.clone());
        Ok(true)
    }
}

/// Joins transactions into activities.
pub struct JoinActivityTransactionJob {
    store: Arc<dyn JoinStore>,
    refresh: PendingEventQueue,
    step: Duration,
}

impl JoinActivityTransactionJob {
    /// `refresh` receives the activity key once joined.
    #[must_use]
    pub fn new(store: Arc<dyn JoinStore>, refresh: PendingEventQueue) -> Self {
        Self {
            store,
            refresh,
            step: JOIN_RETRY_STEP,
        }
    }

    #[must_use]
    pub const fn with_step(mut self, step: Duration) -> Self {
        self.step = step;
        self
    }

    #[must_use]
    pub fn queue_descriptor() -> QueueDescriptor {
        QueueDescriptor::new(JOIN_QUEUE).concurrency(4)
    }

    /// Delay before lookup number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt)
    }

    /// Make one lookup.
    pub async fn attempt(&self, join: &JoinActivityTransaction) -> AppResult<JoinState> {
        let Some(tx) = self.store.find_transaction(&join.tx_hash).await? else {
            let attempts = join.attempt.saturating_add(1);
            if attempts >= MAX_JOIN_ATTEMPTS {
                metrics::incr(&get_metrics().joins_abandoned);
                warn!(
                    activity_id = %join.activity_id,
                    tx_hash = %join.tx_hash,
                    attempts,
                    "Transaction never arrived; join abandoned"
                );
                return Ok(JoinState::Abandoned);
            }

            debug!(
                activity_id = %join.activity_id,
                tx_hash = %join.tx_hash,
                attempt = attempts,
                "Transaction not found yet"
            );
            return Ok(JoinState::PendingJoin);
        };

        let updated = self.store.attach(&join.activity_id, &tx).await?;
        self.refresh
            .add(&[PendingEvent::refresh(join.activity_id.clone())])
            .await?;

        if updated {
            metrics::incr(&get_metrics().joins_completed);
            info!(
                activity_id = %join.activity_id,
                tx_hash = %join.tx_hash,
                block_number = tx.block_number,
                "Activity joined"
            );
        }
        Ok(JoinState::Joined)
    }
}

#[async_trait]
impl JobHandler for JoinActivityTransactionJob {
    type Payload = JoinActivityTransaction;

    fn descriptor(&self) -> QueueDescriptor {
        Self::queue_descriptor()
    }

    async fn process(&self, payload: JoinActivityTransaction) -> JobResult<JoinActivityTransaction> {
        match self.attempt(&payload).await? {
            JoinState::Joined | JoinState::Abandoned => Ok(JobOutcome::Done),
            JoinState::PendingJoin => {
                let next = JoinActivityTransaction {
                    attempt: payload.attempt.saturating_add(1),
                    ..payload
                };
                let delay = self.delay_for(next.attempt);
                // Unique identity: the live "join:{id}" message must not swallow the retry.
                Ok(JobOutcome::continue_unique(next, delay))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::{Domain, EventKind};
    use blockfeed_queue::MemoryCache;
    use chrono::Utc;

    fn tx(hash: &str) -> transaction::Model {
        let now = Utc::now().into();
        transaction::Model {
            hash: hash.to_string(),
            chain_id: 1,
            block_number: 42,
            block_timestamp: now,
            from_address: "0xsender".to_string(),
            to_address: None,
            value: "0".to_string(),
            created_at: now,
        }
    }

    fn job() -> (Arc<MemoryJoinStore>, PendingEventQueue, JoinActivityTransactionJob) {
        let store = Arc::new(MemoryJoinStore::new());
        let pending = PendingEventQueue::new(Arc::new(MemoryCache::new()), Domain::Activities);
        let job = JoinActivityTransactionJob::new(store.clone(), pending.clone());
        (store, pending, job)
    }

    #[tokio::test]
    async fn test_found_joins_and_refreshes() {
        let (store, pending, job) = job();
        store.insert_transaction(tx("0xt")).await;

        let outcome = job
            .process(JoinActivityTransaction::new("a1", "0xt"))
            .await
            .unwrap();

        assert!(outcome.is_done());
        assert_eq!(store.joined("a1").await.as_deref(), Some("0xt"));
        let events = pending.get(EventKind::Refresh, 10).await.unwrap();
        assert_eq!(events[0].key, "a1");
    }

    #[tokio::test]
    async fn test_missing_continues_with_growing_delay() {
        let (_, _, job) = job();
        let mut payload = JoinActivityTransaction::new("a1", "0xmissing");
        payload.attempt = 2;

        match job.process(payload).await.unwrap() {
            JobOutcome::Continue {
                payload,
                delay,
                unique,
            } => {
                assert_eq!(payload.attempt, 3);
                assert_eq!(delay, Duration::from_secs(30));
                assert!(unique);
            }
            JobOutcome::Done => panic!("expected continuation"),
        }
    }

    #[tokio::test]
    async fn test_last_attempt_abandons() {
        let (store, _, job) = job();
        let mut payload = JoinActivityTransaction::new("a1", "0xmissing");
        payload.attempt = MAX_JOIN_ATTEMPTS - 1;

        assert_eq!(job.attempt(&payload).await.unwrap(), JoinState::Abandoned);
        assert!(job.process(payload).await.unwrap().is_done());
        assert!(store.joined("a1").await.is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_attempt_abandons() {
        let (store, _, job) = job();
        let mut payload = JoinActivityTransaction::new("a1", "0xmissing");
        payload.attempt = u32::MAX;

        assert_eq!(job.attempt(&payload).await.unwrap(), JoinState::Abandoned);
        assert!(job.process(payload).await.unwrap().is_done());
        assert!(store.joined("a1").await.is_none());
    }
}
