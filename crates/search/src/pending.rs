//! Pending-event queues.
//!
//! One list per (domain, kind) in the cache store. Producers append the key
//! of an entity whose index entry went stale; the batch indexer pops keys in
//! FIFO order. A popped event is gone: there is no handshake between the pop
//! and the index write, and a lost event is repaired by the next backfill.

use std::fmt;
use std::sync::Arc;

use blockfeed_common::AppResult;
use blockfeed_queue::CacheStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Search domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Tokens,
    Activities,
}

impl Domain {
    pub const ALL: [Self; 2] = [Self::Tokens, Self::Activities];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tokens => "tokens",
            Self::Activities => "activities",
        }
    }

    /// Prefix of document ids in this domain.
    #[must_use]
    pub const fn document_prefix(self) -> &'static str {
        match self {
            Self::Tokens => "token",
            Self::Activities => "activity",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the indexer should do with a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Re-read the entity and write its document.
    Refresh,
    /// Drop the document.
    Remove,
}

impl EventKind {
    pub const ALL: [Self; 2] = [Self::Refresh, Self::Remove];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Refresh => "refresh",
            Self::Remove => "remove",
        }
    }
}

/// A stale entity key. Carries no entity data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEvent {
    pub kind: EventKind,
    pub key: String,
    pub enqueued_at: DateTime<Utc>,
}

impl PendingEvent {
    #[must_use]
    pub fn new(kind: EventKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            enqueued_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn refresh(key: impl Into<String>) -> Self {
        Self::new(EventKind::Refresh, key)
    }

    #[must_use]
    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(EventKind::Remove, key)
    }
}

/// Pending events of one domain.
#[derive(Clone)]
pub struct PendingEventQueue {
    store: Arc<dyn CacheStore>,
    domain: Domain,
}

impl PendingEventQueue {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, domain: Domain) -> Self {
        Self { store, domain }
    }

    #[must_use]
    pub const fn domain(&self) -> Domain {
        self.domain
    }

    fn key(&self, kind: EventKind) -> String {
        format!("pending:{}:{}", self.domain, kind.as_str())
    }

    /// Append events to the lists of their kinds. Returns the number appended.
    pub async fn add(&self, events: &[PendingEvent]) -> AppResult<u64> {
        let mut appended = 0;
        for kind in EventKind::ALL {
            let values = events
                .iter()
                .filter(|e| e.kind == kind)
                .map(serde_json::to_string)
                .collect::<Result<Vec<_>, _>>()?;

            if values.is_empty() {
                continue;
            }
            appended += values.len() as u64;
            self.store.rpush(&self.key(kind), values).await?;
        }
        Ok(appended)
    }

    /// Pop up to `count` of the oldest events of `kind`.
    pub async fn get(&self, kind: EventKind, count: usize) -> AppResult<Vec<PendingEvent>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let raw = self.store.lpop(&self.key(kind), count).await?;
        Ok(raw
            .into_iter()
            .filter_map(|value| match serde_json::from_str(&value) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(domain = %self.domain, value = %value, error = %e, "Dropping undecodable pending event");
                    None
                }
            })
            .collect())
    }

    /// Number of queued events of `kind`.
    pub async fn count(&self, kind: EventKind) -> AppResult<u64> {
        Ok(self.store.llen(&self.key(kind)).await?)
    }

    /// Number of queued events of every kind.
    pub async fn depth(&self) -> AppResult<u64> {
        let mut total = 0;
        for kind in EventKind::ALL {
            total += self.count(kind).await?;
        }
        Ok(total)
    }
}
