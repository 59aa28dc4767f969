//! blockfeed entry point.
//!
//! Runs the change-capture workers, the batch indexers and the outbox
//! recovery in one process, with a small ops HTTP surface next to them.

mod ops;
mod pipeline;

use std::net::SocketAddr;
use std::sync::Arc;

use blockfeed_common::Config;
use blockfeed_db::repositories::OutboxRepository;
use blockfeed_queue::{
    CacheStore, DistributedLock, Publisher, RedisBroker, RedisBrokerConfig, RedisCache, Scheduler,
    WorkerConfig, WorkerPool,
};
use blockfeed_search::OpenSearchIndex;
use fred::prelude::*;
use tokio::{signal, sync::watch};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ops::OpsState;
use crate::pipeline::{Pipeline, Sources};

const DEFAULT_FILTER: &str =
    "blockfeed_server=info,blockfeed_queue=info,blockfeed_search=info,tower_http=debug";

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;
    init_tracing(config.logging.json);

    info!("Starting blockfeed...");

    let db = Arc::new(blockfeed_db::init(&config).await?);
    info!("Running database migrations...");
    blockfeed_db::migrate(&db).await?;
    info!("Migrations completed");

    info!("Connecting to Redis...");
    let redis_config = fred::types::config::Config::from_url(&config.redis.url)?;
    let redis = Client::new(redis_config, None, None, None);
    redis.connect();
    redis.wait_for_connect().await?;
    info!("Connected to Redis");

    let cache: Arc<dyn CacheStore> =
        Arc::new(RedisCache::new(redis.clone(), config.redis.prefix.clone()));
    let broker = Arc::new(RedisBroker::new(
        redis.clone(),
        RedisBrokerConfig {
            prefix: config.redis.prefix.clone(),
            ..RedisBrokerConfig::default()
        },
    ));
    let publisher = Publisher::new(broker, Arc::new(OutboxRepository::new(db.clone())));
    let index = Arc::new(OpenSearchIndex::new(&config.search)?);

    let pipeline = Pipeline::build(
        &config,
        publisher,
        cache.clone(),
        index,
        Sources::from_database(&db),
    )?;
    pipeline.registry.declare_all().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers = WorkerPool::new(
        pipeline.registry.clone(),
        WorkerConfig::from(&config.queue),
    );
    info!(consumer = workers.consumer_id(), "Starting workers");
    let mut handles = workers.spawn(shutdown_rx.clone());

    let mut scheduler = Scheduler::new(DistributedLock::new(cache));
    for task in &pipeline.tasks {
        scheduler.add(task.clone());
    }
    handles.extend(scheduler.spawn(shutdown_rx));

    let app = ops::router(OpsState {
        registry: pipeline.registry.clone(),
        pending: pipeline.pending.clone(),
    })
    .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Ops server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Stopping workers and scheduled tasks...");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    redis.quit().await?;
    info!("Server shutdown complete");
    Ok(())
}
