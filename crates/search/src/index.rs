//! Search index writes.
//!
//! A bulk request answers per item. Items fail independently and are
//! classified as retryable (the node was busy or unreachable) or rejected
//! (the document itself is bad). Only a failed request as a whole surfaces
//! as an [`IndexError`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use blockfeed_common::AppError;
use blockfeed_common::config::SearchConfig;
use opensearch::auth::Credentials;
use opensearch::http::request::JsonBody;
use opensearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use opensearch::http::Url;
use opensearch::{BulkParts, OpenSearch};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pending::Domain;

/// Item error types caused by node state rather than the document.
const TRANSIENT_ERROR_TYPES: &[&str] = &[
    "node_disconnected_exception",
    "node_not_connected_exception",
    "connect_transport_exception",
    "rejected_execution_exception",
    "es_rejected_execution_exception",
    "opensearch_rejected_execution_exception",
    "unavailable_shards_exception",
    "no_shard_available_action_exception",
    "task_cancelled_exception",
];

/// Failure of a whole bulk request.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("search transport error: {0}")]
    Transport(String),

    #[error("search serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("search configuration error: {0}")]
    Config(String),
}

impl From<opensearch::Error> for IndexError {
    fn from(e: opensearch::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<IndexError> for AppError {
    fn from(e: IndexError) -> Self {
        Self::Search(e.to_string())
    }
}

/// Index name of `domain` under `prefix`.
#[must_use]
pub fn index_name(prefix: &str, domain: Domain) -> String {
    if prefix.is_empty() {
        domain.as_str().to_string()
    } else {
        format!("{prefix}-{domain}")
    }
}

/// One item of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    Index {
        index: String,
        id: String,
        document: Value,
    },
    Delete {
        index: String,
        id: String,
    },
}

impl BulkOp {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Index { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    #[must_use]
    pub fn index(&self) -> &str {
        match self {
            Self::Index { index, .. } | Self::Delete { index, .. } => index,
        }
    }

    /// NDJSON lines of this item.
    #[must_use]
    pub fn to_lines(&self) -> Vec<Value> {
        match self {
            Self::Index {
                index,
                id,
                document,
            } => vec![
                json!({ "index": { "_index": index, "_id": id } }),
                document.clone(),
            ],
            Self::Delete { index, id } => {
                vec![json!({ "delete": { "_index": index, "_id": id } })]
            }
        }
    }
}

/// Result of one bulk item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Succeeded,
    /// Worth sending again.
    Retryable(String),
    /// Never going to succeed as is.
    Rejected(String),
}

impl ItemOutcome {
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// Classify a bulk item by HTTP status and error type.
///
/// A delete of a missing document answers 404 without an error object and
/// counts as success.
#[must_use]
pub fn classify(status: u16, error_type: Option<&str>, reason: Option<&str>) -> ItemOutcome {
    let describe = || {
        format!(
            "{} ({status}): {}",
            error_type.unwrap_or("error"),
            reason.unwrap_or("no reason given")
        )
    };

    if status < 300 || (status == 404 && error_type.is_none()) {
        return ItemOutcome::Succeeded;
    }

    let transient_status = matches!(status, 429 | 502 | 503 | 504);
    let transient_type = error_type.is_some_and(|t| TRANSIENT_ERROR_TYPES.contains(&t));
    let aborted = reason.is_some_and(|r| r.contains("aborted"));

    if transient_status || transient_type || aborted {
        ItemOutcome::Retryable(describe())
    } else {
        ItemOutcome::Rejected(describe())
    }
}

/// Bulk-capable search index.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Submit `ops` as one request. Returns one outcome per op, in order.
    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<ItemOutcome>, IndexError>;
}

/// `OpenSearch` cluster.
#[derive(Clone)]
pub struct OpenSearchIndex {
    client: OpenSearch,
}

impl OpenSearchIndex {
    pub fn new(config: &SearchConfig) -> Result<Self, IndexError> {
        let url = Url::parse(&config.url)
            .map_err(|e| IndexError::Config(format!("invalid search url: {e}")))?;

        let mut builder = TransportBuilder::new(SingleNodeConnectionPool::new(url))
            .timeout(config.timeout())
            .disable_proxy();

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            builder = builder.auth(Credentials::Basic(user.clone(), pass.clone()));
        }

        let transport = builder
            .build()
            .map_err(|e| IndexError::Config(e.to_string()))?;

        info!(url = %config.url, prefix = %config.index_prefix, "OpenSearch client initialized");
        Ok(Self {
            client: OpenSearch::new(transport),
        })
    }

    fn item_outcome(item: &Value) -> ItemOutcome {
        // Each item is keyed by its action: {"index": {...}} or {"delete": {...}}.
        let Some(result) = item.as_object().and_then(|o| o.values().next()) else {
            return ItemOutcome::Retryable("malformed bulk item".to_string());
        };

        let status = result["status"]
            .as_u64()
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500);
        classify(
            status,
            result["error"]["type"].as_str(),
            result["error"]["reason"].as_str(),
        )
    }
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<ItemOutcome>, IndexError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }

        let body: Vec<JsonBody<Value>> = ops
            .iter()
            .flat_map(BulkOp::to_lines)
            .map(JsonBody::from)
            .collect();

        let response = self
            .client
            .bulk(BulkParts::None)
            .body(body)
            .send()
            .await?;

        let status = response.status_code();
        if !status.is_success() {
            return Err(IndexError::Transport(format!("bulk request returned {status}")));
        }

        let result: Value = response.json().await?;
        let items = result["items"]
            .as_array()
            .ok_or_else(|| IndexError::Transport("bulk response has no items".to_string()))?;

        if items.len() != ops.len() {
            return Err(IndexError::Transport(format!(
                "bulk response has {} items for {} operations",
                items.len(),
                ops.len()
            )));
        }

        debug!(
            items = items.len(),
            errors = result["errors"].as_bool().unwrap_or(false),
            "Bulk request completed"
        );
        Ok(items.iter().map(Self::item_outcome).collect())
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Transient { remaining: u32 },
    Reject,
}

/// In-process index with fault injection.
#[derive(Default)]
pub struct MemoryIndex {
    documents: Mutex<HashMap<(String, String), Value>>,
    faults: Mutex<HashMap<String, Fault>>,
    failing_requests: AtomicU32,
    requests: Mutex<Vec<Vec<String>>>,
}

impl MemoryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `times` retryable failures for document `id`, then succeed.
    pub async fn fail_transiently(&self, id: impl Into<String>, times: u32) {
        self.faults
            .lock()
            .await
            .insert(id.into(), Fault::Transient { remaining: times });
    }

    /// Reject document `id` on every write.
    pub async fn reject(&self, id: impl Into<String>) {
        self.faults.lock().await.insert(id.into(), Fault::Reject);
    }

    /// Fail the next `times` requests as a whole.
    pub fn fail_requests(&self, times: u32) {
        self.failing_requests.store(times, Ordering::SeqCst);
    }

    pub async fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.documents
            .lock()
            .await
            .get(&(index.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.lock().await.is_empty()
    }

    /// Document ids sent by each request so far.
    pub async fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn bulk(&self, ops: &[BulkOp]) -> Result<Vec<ItemOutcome>, IndexError> {
        self.requests
            .lock()
            .await
            .push(ops.iter().map(|op| op.id().to_string()).collect());

        let failing = self.failing_requests.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_requests.store(failing - 1, Ordering::SeqCst);
            return Err(IndexError::Transport("node disconnected".to_string()));
        }

        let mut faults = self.faults.lock().await;
        let mut documents = self.documents.lock().await;
        let mut outcomes = Vec::with_capacity(ops.len());

        for op in ops {
            match faults.get_mut(op.id()) {
                Some(Fault::Reject) => {
                    outcomes.push(classify(400, Some("mapper_parsing_exception"), Some("failed to parse")));
                    continue;
                }
                Some(Fault::Transient { remaining }) if *remaining > 0 => {
                    *remaining -= 1;
                    outcomes.push(classify(429, Some("es_rejected_execution_exception"), Some("queue full")));
                    continue;
                }
                _ => {}
            }

            let key = (op.index().to_string(), op.id().to_string());
            match op {
                BulkOp::Index { document, .. } => {
                    documents.insert(key, document.clone());
                }
                BulkOp::Delete { .. } => {
                    documents.remove(&key);
                }
            }
            outcomes.push(ItemOutcome::Succeeded);
        }

        Ok(outcomes)
    }
}
