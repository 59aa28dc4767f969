//! Pipeline wiring.
//!
//! Builds the handler registry and the scheduled tasks from the config and
//! the storage backends. Nothing here starts running; `main` spawns it.

use std::sync::Arc;

use blockfeed_common::{AppResult, Config};
use blockfeed_db::repositories::{ActivityRepository, TokenRepository, TransactionRepository};
use blockfeed_queue::{
    CacheStore, HandlerRegistry, JobQueue, OutboxRecovery, OutboxRecoveryConfig, Publisher,
    QueueTrigger, RegistryBuilder, ScheduledTask,
};
use blockfeed_search::jobs::{
    CdcChangeJob, JoinActivityTransactionJob, JoinStore, ReindexActivityJob, ReindexTokenJob,
    RepositoryJoinStore, TokenBackfillJob,
};
use blockfeed_search::{
    ActivityChangeHandler, ActivitySource, BatchIndexer, CdcDispatcher, Domain, EntitySource,
    IndexerSettings, KeyScan, PendingEventQueue, SearchIndex, TokenChangeHandler, TokenSource,
    index_name,
};
use sea_orm::DatabaseConnection;
use tracing::info;

/// Authoritative reads the pipeline depends on.
pub struct Sources {
    pub tokens: Arc<dyn EntitySource>,
    pub token_keys: Arc<dyn KeyScan>,
    pub activities: Arc<dyn EntitySource>,
    pub joins: Arc<dyn JoinStore>,
}

impl Sources {
    #[must_use]
    pub fn from_database(db: &Arc<DatabaseConnection>) -> Self {
        let tokens = Arc::new(TokenSource::new(TokenRepository::new(db.clone())));
        Self {
            tokens: tokens.clone(),
            token_keys: tokens,
            activities: Arc::new(ActivitySource::new(ActivityRepository::new(db.clone()))),
            joins: Arc::new(RepositoryJoinStore::new(
                TransactionRepository::new(db.clone()),
                ActivityRepository::new(db.clone()),
            )),
        }
    }
}

/// Everything `main` needs to run the pipeline.
pub struct Pipeline {
    pub registry: Arc<HandlerRegistry>,
    pub pending: Vec<PendingEventQueue>,
    pub tasks: Vec<Arc<dyn ScheduledTask>>,
}

impl Pipeline {
    pub fn build(
        config: &Config,
        publisher: Publisher,
        cache: Arc<dyn CacheStore>,
        index: Arc<dyn SearchIndex>,
        sources: Sources,
    ) -> AppResult<Self> {
        let token_pending = PendingEventQueue::new(cache.clone(), Domain::Tokens);
        let activity_pending = PendingEventQueue::new(cache, Domain::Activities);

        let dispatcher = CdcDispatcher::new()
            .with_handler(Arc::new(TokenChangeHandler::new(
                JobQueue::new(publisher.clone(), &ReindexTokenJob::queue_descriptor()),
                &config.features,
            )))
            .with_handler(Arc::new(ActivityChangeHandler::new(
                JobQueue::new(
                    publisher.clone(),
                    &JoinActivityTransactionJob::queue_descriptor(),
                ),
                JobQueue::new(publisher.clone(), &ReindexActivityJob::queue_descriptor()),
                &config.features,
            )));

        let registry = Arc::new(
            RegistryBuilder::new()
                .register(CdcChangeJob::new(Arc::new(dispatcher)))?
                .register(ReindexTokenJob::new(token_pending.clone()))?
                .register(ReindexActivityJob::new(activity_pending.clone()))?
                .register(JoinActivityTransactionJob::new(
                    sources.joins,
                    activity_pending.clone(),
                ))?
                .register(TokenBackfillJob::from_config(
                    sources.token_keys,
                    token_pending.clone(),
                    &config.indexer,
                ))?
                .build(publisher.clone()),
        );

        let mut tasks: Vec<Arc<dyn ScheduledTask>> = vec![
            Arc::new(OutboxRecovery::new(
                registry.clone(),
                OutboxRecoveryConfig::from(&config.outbox),
            )),
            Arc::new(BatchIndexer::new(
                token_pending.clone(),
                sources.tokens,
                index.clone(),
                IndexerSettings::from_config(
                    &config.indexer,
                    index_name(&config.search.index_prefix, Domain::Tokens),
                ),
            )),
            Arc::new(BatchIndexer::new(
                activity_pending.clone(),
                sources.activities,
                index,
                IndexerSettings::from_config(
                    &config.indexer,
                    index_name(&config.search.index_prefix, Domain::Activities),
                ),
            )),
        ];

        for handler in registry.handlers() {
            if let Some(trigger) = QueueTrigger::for_handler(handler.clone(), publisher.clone()) {
                tasks.push(Arc::new(trigger));
            }
        }

        info!(
            queues = registry.len(),
            tasks = tasks.len(),
            "Pipeline assembled"
        );

        Ok(Self {
            registry,
            pending: vec![token_pending, activity_pending],
            tasks,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use blockfeed_queue::{MemoryBroker, MemoryCache, MemoryOutbox};
    use blockfeed_search::jobs::MemoryJoinStore;
    use blockfeed_search::{MemoryIndex, MemorySource};

    pub fn memory_pipeline(config: &Config) -> (Arc<MemoryBroker>, Pipeline) {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(broker.clone(), Arc::new(MemoryOutbox::new()));
        let tokens = Arc::new(MemorySource::new(Domain::Tokens));
        let sources = Sources {
            tokens: tokens.clone(),
            token_keys: tokens,
            activities: Arc::new(MemorySource::new(Domain::Activities)),
            joins: Arc::new(MemoryJoinStore::new()),
        };

        let pipeline = Pipeline::build(
            config,
            publisher,
            Arc::new(MemoryCache::new()),
            Arc::new(MemoryIndex::new()),
            sources,
        )
        .unwrap();
        (broker, pipeline)
    }

    fn config() -> Config {
        Config::from_file("../../config/default.toml").unwrap()
    }

    #[test]
    fn test_all_queues_registered() {
        let (_, pipeline) = memory_pipeline(&config());

        let names: Vec<_> = pipeline
            .registry
            .descriptors()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "activity-reindex",
                "activity-tx-join",
                "cdc-changes",
                "token-backfill",
                "token-reindex",
            ]
        );
    }

    #[test]
    fn test_backfill_trigger_follows_config() {
        let mut config = config();
        let (_, pipeline) = memory_pipeline(&config);
        let names: Vec<_> = pipeline.tasks.iter().map(|t| t.name().to_string()).collect();
        assert_eq!(
            names,
            vec!["outbox-recovery", "indexer:tokens", "indexer:activities"]
        );

        config.indexer.backfill_interval_secs = 3600;
        let (_, pipeline) = memory_pipeline(&config);
        assert!(
            pipeline
                .tasks
                .iter()
                .any(|t| t.name() == "trigger:token-backfill")
        );
    }
}
