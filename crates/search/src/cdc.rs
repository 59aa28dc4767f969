//! Change-data-capture dispatch.
//!
//! Row changes arrive as before/after JSON images. Each watched table has a
//! [`ChangeHandler`]; the dispatcher diffs updates and only wakes the handler
//! when a field it declared significant changed.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use blockfeed_common::config::FeatureGates;
use blockfeed_common::{AppResult, get_metrics, metrics};
use blockfeed_queue::{EnqueueOutcome, JobQueue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::jobs::join::JoinActivityTransaction;
use crate::jobs::reindex::{ReindexActivity, ReindexToken};

/// Row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// One captured row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table: String,
    pub op: ChangeOp,
    #[serde(default)]
    pub before: Option<Value>,
    #[serde(default)]
    pub after: Option<Value>,
}

/// Fields whose values differ between `before` and `after`.
///
/// A field missing on one side counts as null. Without a usable before
/// image every field of `after` counts as changed.
#[must_use]
pub fn changed_fields(before: Option<&Value>, after: &Value) -> BTreeSet<String> {
    let Some(after) = after.as_object() else {
        return BTreeSet::new();
    };
    let Some(before) = before.and_then(Value::as_object) else {
        return after.keys().cloned().collect();
    };

    after
        .keys()
        .chain(before.keys())
        .filter(|key| {
            before.get(*key).unwrap_or(&Value::Null) != after.get(*key).unwrap_or(&Value::Null)
        })
        .cloned()
        .collect()
}

/// Reacts to changes of one table. Returns the number of jobs emitted.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    fn table(&self) -> &str;

    /// Fields whose change warrants work.
    fn significant_fields(&self) -> &[&'static str];

    async fn handle_insert(&self, after: &Value) -> AppResult<usize>;

    async fn handle_update(&self, after: &Value, changed: &BTreeSet<String>) -> AppResult<usize>;

    /// Deletions are followed up by the owning entity's own removal path.
    async fn handle_delete(&self, _before: Option<&Value>) -> AppResult<usize> {
        Ok(0)
    }
}

/// Routes change records to their table's handler.
#[derive(Default)]
pub struct CdcDispatcher {
    handlers: HashMap<String, Arc<dyn ChangeHandler>>,
}

impl CdcDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn ChangeHandler>) -> Self {
        self.handlers.insert(handler.table().to_string(), handler);
        self
    }

    /// Dispatch one record. Returns the number of jobs emitted.
    pub async fn dispatch(&self, record: &ChangeRecord) -> AppResult<usize> {
        metrics::incr(&get_metrics().cdc_changes_received);

        let Some(handler) = self.handlers.get(&record.table) else {
            debug!(table = %record.table, "No change handler for table");
            return Ok(0);
        };

        let emitted = match (record.op, record.after.as_ref()) {
            (ChangeOp::Insert, Some(after)) => handler.handle_insert(after).await?,
            (ChangeOp::Update, Some(after)) => {
                let changed = changed_fields(record.before.as_ref(), after);
                let significant = handler
                    .significant_fields()
                    .iter()
                    .any(|field| changed.contains(*field));

                if significant {
                    handler.handle_update(after, &changed).await?
                } else {
                    trace!(table = %record.table, ?changed, "Update touched no significant field");
                    0
                }
            }
            (ChangeOp::Delete, _) => handler.handle_delete(record.before.as_ref()).await?,
            (op, None) => {
                debug!(table = %record.table, ?op, "Change record without after image");
                0
            }
        };

        metrics::add(&get_metrics().cdc_jobs_emitted, emitted as u64);
        Ok(emitted)
    }
}

/// Jobs actually stored by one enqueue; collapsed and deferred ones are not counted.
fn enqueued(outcome: EnqueueOutcome) -> usize {
    usize::from(outcome == EnqueueOutcome::Queued)
}

fn text_field<'a>(row: &'a Value, field: &str) -> Option<&'a str> {
    row.get(field).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Token table changes.
pub struct TokenChangeHandler {
    reindex: JobQueue<ReindexToken>,
    on_insert: bool,
}

impl TokenChangeHandler {
    pub const SIGNIFICANT_FIELDS: &'static [&'static str] =
        &["name", "symbol", "decimals", "total_supply"];

    #[must_use]
    pub const fn new(reindex: JobQueue<ReindexToken>, gates: &FeatureGates) -> Self {
        Self {
            reindex,
            on_insert: gates.index_tokens_on_insert,
        }
    }

    async fn emit(&self, row: &Value) -> AppResult<usize> {
        let Some(contract) = text_field(row, "contract") else {
            warn!(row = %row, "Token change without contract");
            return Ok(0);
        };

        let payload = ReindexToken::refresh(contract);
        let outcome = self
            .reindex
            .add_to_queue_with(&payload, payload.job_options())
            .await?;
        Ok(enqueued(outcome))
    }
}

#[async_trait]
impl ChangeHandler for TokenChangeHandler {
    fn table(&self) -> &str {
        "token"
    }

    fn significant_fields(&self) -> &[&'static str] {
        Self::SIGNIFICANT_FIELDS
    }

    async fn handle_insert(&self, after: &Value) -> AppResult<usize> {
        if !self.on_insert {
            return Ok(0);
        }
        self.emit(after).await
    }

    async fn handle_update(&self, after: &Value, _changed: &BTreeSet<String>) -> AppResult<usize> {
        self.emit(after).await
    }
}

/// Activity table changes.
pub struct ActivityChangeHandler {
    join: JobQueue<JoinActivityTransaction>,
    reindex: JobQueue<ReindexActivity>,
    on_insert: bool,
}

impl ActivityChangeHandler {
    pub const SIGNIFICANT_FIELDS: &'static [&'static str] =
        &["block_number", "block_timestamp", "from_address", "amount"];

    #[must_use]
    pub const fn new(
        join: JobQueue<JoinActivityTransaction>,
        reindex: JobQueue<ReindexActivity>,
        gates: &FeatureGates,
    ) -> Self {
        Self {
            join,
            reindex,
            on_insert: gates.join_activities_on_insert,
        }
    }

    async fn reindex(&self, activity_id: &str) -> AppResult<usize> {
        let payload = ReindexActivity::refresh(activity_id);
        let outcome = self
            .reindex
            .add_to_queue_with(&payload, payload.job_options())
            .await?;
        Ok(enqueued(outcome))
    }
}

#[async_trait]
impl ChangeHandler for ActivityChangeHandler {
    fn table(&self) -> &str {
        "activity"
    }

    fn significant_fields(&self) -> &[&'static str] {
        Self::SIGNIFICANT_FIELDS
    }

    async fn handle_insert(&self, after: &Value) -> AppResult<usize> {
        if !self.on_insert {
            return Ok(0);
        }
        let Some(activity_id) = text_field(after, "id") else {
            warn!(row = %after, "Activity change without id");
            return Ok(0);
        };

        // Rows written with block data already present need no join.
        if !after.get("block_number").is_none_or(Value::is_null) {
            return self.reindex(activity_id).await;
        }

        let Some(tx_hash) = text_field(after, "tx_hash") else {
            warn!(activity_id, "Activity inserted without tx_hash; cannot join");
            return self.reindex(activity_id).await;
        };

        let payload = JoinActivityTransaction::new(activity_id, tx_hash);
        let outcome = self
            .join
            .add_to_queue_with(&payload, payload.job_options())
            .await?;
        Ok(enqueued(outcome))
    }

    async fn handle_update(&self, after: &Value, _changed: &BTreeSet<String>) -> AppResult<usize> {
        match text_field(after, "id") {
            Some(activity_id) => self.reindex(activity_id).await,
            None => Ok(0),
        }
    }
}
