//! Operations endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
};
use blockfeed_common::{AppResult, get_metrics};
use blockfeed_queue::{HandlerRegistry, QueueDepth};
use blockfeed_search::{EventKind, PendingEventQueue};
use serde::Serialize;
use serde_json::{Value, json};

/// Shared state of the ops router.
#[derive(Clone)]
pub struct OpsState {
    pub registry: Arc<HandlerRegistry>,
    pub pending: Vec<PendingEventQueue>,
}

/// Pending events of one domain.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PendingDepth {
    pub refresh: u64,
    pub remove: u64,
}

/// Backlog across the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub queues: BTreeMap<String, QueueDepth>,
    pub pending: BTreeMap<String, PendingDepth>,
    pub outbox: u64,
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/queues", get(queues))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        get_metrics().to_prometheus(),
    )
}

async fn queues(State(state): State<OpsState>) -> AppResult<Json<QueueReport>> {
    Ok(Json(queue_report(&state).await?))
}

/// Collect broker, pending-event and outbox depths.
pub async fn queue_report(state: &OpsState) -> AppResult<QueueReport> {
    let publisher = state.registry.publisher();

    let mut queues = BTreeMap::new();
    for descriptor in state.registry.descriptors() {
        let depth = publisher.broker().depth(&descriptor.name).await?;
        queues.insert(descriptor.name.clone(), depth);
    }

    let mut pending = BTreeMap::new();
    for queue in &state.pending {
        pending.insert(
            queue.domain().to_string(),
            PendingDepth {
                refresh: queue.count(EventKind::Refresh).await?,
                remove: queue.count(EventKind::Remove).await?,
            },
        );
    }

    Ok(QueueReport {
        queues,
        pending,
        outbox: publisher.outbox().count().await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::memory_pipeline;
    use blockfeed_common::Config;
    use blockfeed_queue::JobQueue;
    use blockfeed_search::PendingEvent;
    use blockfeed_search::jobs::{ReindexToken, ReindexTokenJob};

    #[tokio::test]
    async fn test_queue_report_counts_backlog() {
        let config = Config::from_file("../../config/default.toml").unwrap();
        let (_, pipeline) = memory_pipeline(&config);
        let state = OpsState {
            registry: pipeline.registry.clone(),
            pending: pipeline.pending.clone(),
        };

        let reindex = JobQueue::new(
            pipeline.registry.publisher().clone(),
            &ReindexTokenJob::queue_descriptor(),
        );
        let payload = ReindexToken::refresh("0xa");
        reindex
            .add_to_queue_with(&payload, payload.job_options())
            .await
            .unwrap();
        pipeline.pending[1]
            .add(&[PendingEvent::remove("act1")])
            .await
            .unwrap();

        let report = queue_report(&state).await.unwrap();
        assert_eq!(report.queues["token-reindex"].ready, 1);
        assert_eq!(report.queues["cdc-changes"].ready, 0);
        assert_eq!(
            report.pending["activities"],
            PendingDepth {
                refresh: 0,
                remove: 1
            }
        );
        assert_eq!(report.outbox, 0);
    }
}
