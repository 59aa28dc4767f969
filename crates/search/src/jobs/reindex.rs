//! Reindex jobs.
//!
//! These only record the key as stale. The batch indexer does the actual
//! read and write on its own cadence.

use async_trait::async_trait;
use blockfeed_queue::{JobHandler, JobOptions, JobOutcome, JobResult, QueueDescriptor};
use serde::{Deserialize, Serialize};

use crate::pending::{EventKind, PendingEvent, PendingEventQueue};

/// Queue of [`ReindexTokenJob`].
pub const REINDEX_TOKEN_QUEUE: &str = "token-reindex";
/// Queue of [`ReindexActivityJob`].
pub const REINDEX_ACTIVITY_QUEUE: &str = "activity-reindex";

/// Token whose document is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexToken {
    pub contract: String,
    /// Drop the document instead of rewriting it.
    #[serde(default)]
    pub remove: bool,
}

impl ReindexToken {
    #[must_use]
    pub fn refresh(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            remove: false,
        }
    }

    #[must_use]
    pub fn remove(contract: impl Into<String>) -> Self {
        Self {
            contract: contract.into(),
            remove: true,
        }
    }

    /// Collapses bursts for the same contract into one live job.
    #[must_use]
    pub fn job_options(&self) -> JobOptions {
        if self.remove {
            JobOptions::with_job_id(format!("token-remove:{}", self.contract))
        } else {
            JobOptions::with_job_id(format!("token:{}", self.contract))
        }
    }
}

/// Activity whose document is stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexActivity {
    pub activity_id: String,
    #[serde(default)]
    pub remove: bool,
}

impl ReindexActivity {
    #[must_use]
    pub fn refresh(activity_id: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            remove: false,
        }
    }

    #[must_use]
    pub fn remove(activity_id: impl Into<String>) -> Self {
        Self {
            activity_id: activity_id.into(),
            remove: true,
        }
    }

    #[must_use]
    pub fn job_options(&self) -> JobOptions {
        if self.remove {
            JobOptions::with_job_id(format!("activity-remove:{}", self.activity_id))
        } else {
            JobOptions::with_job_id(format!("activity:{}", self.activity_id))
        }
    }
}

const fn kind(remove: bool) -> EventKind {
    if remove {
        EventKind::Remove
    } else {
        EventKind::Refresh
    }
}

/// Marks a token stale.
pub struct ReindexTokenJob {
    pending: PendingEventQueue,
}

impl ReindexTokenJob {
    #[must_use]
    pub const fn new(pending: PendingEventQueue) -> Self {
        Self { pending }
    }

    #[must_use]
    pub fn queue_descriptor() -> QueueDescriptor {
        QueueDescriptor::new(REINDEX_TOKEN_QUEUE).concurrency(8)
    }
}

#[async_trait]
impl JobHandler for ReindexTokenJob {
    type Payload = ReindexToken;

    fn descriptor(&self) -> QueueDescriptor {
        Self::queue_descriptor()
    }

    async fn process(&self, payload: ReindexToken) -> JobResult<ReindexToken> {
        let event = PendingEvent::new(kind(payload.remove), payload.contract);
        self.pending.add(&[event]).await?;
        Ok(JobOutcome::Done)
    }
}

/// Marks an activity stale.
pub struct ReindexActivityJob {
    pending: PendingEventQueue,
}

impl ReindexActivityJob {
    #[must_use]
    pub const fn new(pending: PendingEventQueue) -> Self {
        Self { pending }
    }

    #[must_use]
    pub fn queue_descriptor() -> QueueDescriptor {
        QueueDescriptor::new(REINDEX_ACTIVITY_QUEUE).concurrency(8)
    }
}

#[async_trait]
impl JobHandler for ReindexActivityJob {
    type Payload = ReindexActivity;

    fn descriptor(&self) -> QueueDescriptor {
        Self::queue_descriptor()
    }

    async fn process(&self, payload: ReindexActivity) -> JobResult<ReindexActivity> {
        let event = PendingEvent::new(kind(payload.remove), payload.activity_id);
        self.pending.add(&[event]).await?;
        Ok(JobOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::Domain;
    use blockfeed_queue::MemoryCache;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reindex_token_records_event() {
        let pending = PendingEventQueue::new(Arc::new(MemoryCache::new()), Domain::Tokens);
        let job = ReindexTokenJob::new(pending.clone());

        job.process(ReindexToken::refresh("0xa")).await.unwrap();
        job.process(ReindexToken::remove("0xb")).await.unwrap();

        let refresh = pending.get(EventKind::Refresh, 10).await.unwrap();
        let remove = pending.get(EventKind::Remove, 10).await.unwrap();
        assert_eq!(refresh[0].key, "0xa");
        assert_eq!(remove[0].key, "0xb");
    }

    #[test]
    fn test_job_ids() {
        assert_eq!(
            ReindexToken::refresh("0xa").job_options().job_id.as_deref(),
            Some("token:0xa")
        );
        assert_eq!(
            ReindexActivity::remove("7").job_options().job_id.as_deref(),
            Some("activity-remove:7")
        );
    }

    #[test]
    fn test_payload_defaults_to_refresh() {
        let payload: ReindexToken = serde_json::from_str(r#"{"contract":"0xa"}"#).unwrap();
        assert!(!payload.remove);
    }
}
