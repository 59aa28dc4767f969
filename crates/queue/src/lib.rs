//! Job pipeline for blockfeed.
//!
//! This crate moves work between producers and handlers:
//!
//! - **Handlers**: Typed [`JobHandler`]s registered per queue
//! - **Brokers**: Redis and in-memory [`Broker`]s with job-id deduplication
//! - **Delays**: Scheduled delivery through a sorted set or a timer heap
//! - **Retry**: Per-queue backoff with a dead letter list
//! - **Outbox**: Refused publishes are stored and republished later
//! - **Locks**: Multi-key distributed locks with expiry
//! - **Scheduler**: Lock-guarded periodic tasks
//! - **Workers**: Concurrency-bounded consume loops

pub mod broker;
pub mod cache;
pub mod delayed;
pub mod descriptor;
pub mod handler;
pub mod job;
pub mod lock;
pub mod outbox;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use broker::{
    Broker, BrokerError, FailedPublish, MemoryBroker, PublishStatus, QueueDepth, RedisBroker,
    RedisBrokerConfig,
};
pub use cache::{CacheError, CacheStore, MemoryCache, RedisCache};
pub use delayed::{DelayedQueue, RedisDelayScheduler};
pub use descriptor::QueueDescriptor;
pub use handler::{ErasedHandler, JobError, JobHandler, JobOutcome, JobResult};
pub use job::{BatchItem, JobMessage, JobOptions};
pub use lock::{DistributedLock, Lease};
pub use outbox::{MemoryOutbox, OutboxEntry, OutboxRecovery, OutboxRecoveryConfig, OutboxStore};
pub use producer::{BatchOutcome, EnqueueOutcome, JobQueue, Publisher};
pub use registry::{HandlerRegistry, RegistryBuilder};
pub use retry::{BackoffPolicy, DeadLetterEntry, ExponentialBackoff};
pub use scheduler::{QueueTrigger, ScheduledTask, Scheduler, TaskError, TickOutcome, run_tick};
pub use worker::{WorkerConfig, WorkerPool, run_once};
