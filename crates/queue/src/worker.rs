//! Consumer runtime.
//!
//! One consume loop runs per registered queue. The loop reserves messages
//! while a semaphore permit is free, runs the handler in a spawned task and
//! then acknowledges, retries or dead-letters the message. Broker failures
//! are retried with exponential backoff; the loop never gives up.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use blockfeed_common::config::QueueConfig;
use blockfeed_common::{IdGenerator, get_metrics, metrics};
use futures::FutureExt;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError};
use crate::handler::{Continuation, ErasedHandler, JobError};
use crate::job::{JobMessage, JobOptions};
use crate::producer::Publisher;
use crate::registry::HandlerRegistry;
use crate::retry::{DeadLetterEntry, ExponentialBackoff};

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Delay growth after consecutive broker failures.
    pub reconnect: ExponentialBackoff,
    /// Single-active-consumer lease TTL, renewed on every poll.
    pub consumer_lease: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            reconnect: ExponentialBackoff::default(),
            consumer_lease: Duration::from_secs(15),
        }
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            reconnect: ExponentialBackoff::new(
                Duration::from_millis(config.reconnect_initial_ms),
                Duration::from_millis(config.reconnect_max_ms),
            ),
            consumer_lease: Duration::from_millis(config.consumer_lease_ms),
        }
    }
}

/// Runs a consume loop for every queue in a registry.
pub struct WorkerPool {
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
    consumer_id: String,
}

impl WorkerPool {
    #[must_use]
    pub fn new(registry: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        Self {
            registry,
            config,
            consumer_id: IdGenerator::new().generate_token(),
        }
    }

    /// Identity used for single-active-consumer leases.
    #[must_use]
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Spawn all consume loops.
    #[must_use]
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.registry
            .handlers()
            .map(|handler| {
                tokio::spawn(consume(
                    handler.clone(),
                    self.registry.publisher().clone(),
                    self.config.clone(),
                    self.consumer_id.clone(),
                    shutdown.clone(),
                ))
            })
            .collect()
    }
}

/// Sleep for `delay` unless shutdown fires first. Returns `true` on shutdown.
async fn idle(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn open_channel(handler: &dyn ErasedHandler, publisher: &Publisher) -> Arc<dyn Broker> {
    let shared = publisher.broker().clone();
    if handler.descriptor().shared_channel {
        return shared;
    }

    match shared.dedicated().await {
        Ok(Some(dedicated)) => dedicated,
        Ok(None) => shared,
        Err(e) => {
            warn!(
                queue = %handler.descriptor().name,
                error = %e,
                "Dedicated channel unavailable; consuming on the shared connection"
            );
            shared
        }
    }
}

/// Consume one queue until shutdown.
pub async fn consume(
    handler: Arc<dyn ErasedHandler>,
    publisher: Publisher,
    config: WorkerConfig,
    consumer_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let descriptor = handler.descriptor().clone();
    let queue = descriptor.name.clone();
    let concurrency = descriptor.effective_concurrency();
    let permits = Arc::new(Semaphore::new(concurrency));
    let broker = open_channel(handler.as_ref(), &publisher).await;

    let mut failures: u32 = 0;
    let mut holds_lease = false;

    info!(
        queue = %queue,
        concurrency,
        single_active_consumer = descriptor.single_active_consumer,
        "Consumer started"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        if descriptor.single_active_consumer {
            match broker
                .claim_consumer(&queue, &consumer_id, config.consumer_lease)
                .await
            {
                Ok(true) => {
                    if !holds_lease {
                        info!(queue = %queue, consumer = %consumer_id, "Became active consumer");
                        holds_lease = true;
                    }
                }
                Ok(false) => {
                    if holds_lease {
                        warn!(queue = %queue, "Lost single-consumer lease; standing by");
                        holds_lease = false;
                    }
                    drop(permit);
                    if idle(&mut shutdown, config.poll_interval).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    if backoff(&queue, &e, &config, &mut failures, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            }
        }

        match broker.reserve(&queue).await {
            Ok(Some(message)) => {
                failures = 0;
                let handler = handler.clone();
                let broker = broker.clone();
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    execute(handler.as_ref(), broker.as_ref(), &publisher, message).await;
                    drop(permit);
                });
            }
            Ok(None) => {
                failures = 0;
                drop(permit);
                if idle(&mut shutdown, config.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                if backoff(&queue, &e, &config, &mut failures, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    // Let in-flight executions finish before giving up the lease.
    let _drained = permits.acquire_many(concurrency as u32).await;

    if holds_lease && let Err(e) = broker.release_consumer(&queue, &consumer_id).await {
        warn!(queue = %queue, error = %e, "Failed to release consumer lease; it will expire");
    }

    info!(queue = %queue, "Consumer stopped");
}

async fn backoff(
    queue: &str,
    error: &BrokerError,
    config: &WorkerConfig,
    failures: &mut u32,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let delay = config.reconnect.delay_for_attempt(*failures);
    *failures = failures.saturating_add(1);
    warn!(
        queue = %queue,
        error = %error,
        attempt = *failures,
        delay_ms = delay.as_millis() as u64,
        "Broker unavailable; backing off"
    );
    idle(shutdown, delay).await
}

/// Reserve and execute one message. Returns `false` when the queue was empty.
///
/// Drives a queue without a consume loop, for tools and tests.
pub async fn run_once(
    handler: &dyn ErasedHandler,
    broker: &dyn Broker,
    publisher: &Publisher,
) -> Result<bool, BrokerError> {
    let Some(message) = broker.reserve(&handler.descriptor().name).await? else {
        return Ok(false);
    };
    execute(handler, broker, publisher, message).await;
    Ok(true)
}

/// Run the handler and settle the message with the broker.
async fn execute(
    handler: &dyn ErasedHandler,
    broker: &dyn Broker,
    publisher: &Publisher,
    message: JobMessage,
) {
    let descriptor = handler.descriptor();
    debug!(
        queue = %descriptor.name,
        message_id = %message.id,
        attempt = message.attempts + 1,
        "Processing job"
    );

    // A panicking handler is settled like any other retryable failure.
    let result = AssertUnwindSafe(handler.handle(&message))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(JobError::retryable(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

    match result {
        Ok(continuation) => {
            metrics::incr(&get_metrics().jobs_completed);

            // The continuation is published before the ack: a crash in
            // between redelivers the current message rather than losing
            // the next one.
            if let Some(next) = continuation {
                publisher.publish(continuation_message(&message, next, descriptor.persistent)).await;
            }

            if let Err(e) = broker.ack(&message).await {
                warn!(
                    queue = %descriptor.name,
                    message_id = %message.id,
                    error = %e,
                    "Ack failed; message may be redelivered"
                );
            }
        }
        Err(err) => {
            metrics::incr(&get_metrics().jobs_failed);
            let attempt = message.attempts + 1;

            error!(
                queue = %descriptor.name,
                message_id = %message.id,
                job_id = ?message.job_id,
                attempt,
                payload = %message.payload,
                error = %err,
                "Job failed"
            );

            let retry_delay = if err.is_retryable() {
                descriptor.retry_delay(attempt)
            } else {
                None
            };

            let mut message = message;
            message.attempts = attempt;

            if let Some(delay) = retry_delay {
                metrics::incr(&get_metrics().jobs_retried);
                if let Err(e) = broker.retry(message.clone(), delay).await {
                    // The broker still holds the job id, so the outbox copy
                    // goes out without one, carrying the backoff delay.
                    message.job_id = None;
                    message.delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    publisher.capture(message, &e).await;
                }
            } else {
                metrics::incr(&get_metrics().jobs_dead_lettered);
                error!(
                    queue = %descriptor.name,
                    message_id = %message.id,
                    attempts = attempt,
                    "Job dead-lettered"
                );
                let entry = DeadLetterEntry::new(message, attempt, err.to_string());
                if let Err(e) = broker.dead_letter(entry).await {
                    error!(queue = %descriptor.name, error = %e, "Failed to store dead letter");
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn continuation_message(current: &JobMessage, next: Continuation, persistent: bool) -> JobMessage {
    let mut options = JobOptions::delayed(next.delay);
    if next.unique {
        options = options.unique();
    }
    JobMessage::new(current.queue.clone(), next.payload)
        .with_options(&options)
        .with_persistent(persistent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::descriptor::QueueDescriptor;
    use crate::handler::{JobError, JobHandler, JobOutcome, JobResult};
    use crate::outbox::{MemoryOutbox, OutboxStore};
    use crate::registry::RegistryBuilder;
    use crate::retry::BackoffPolicy;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        fail_times: u32,
        calls: Arc<AtomicU32>,
        fatal: bool,
        backoff: BackoffPolicy,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        type Payload = Value;

        fn descriptor(&self) -> QueueDescriptor {
            QueueDescriptor::new("flaky")
                .max_retries(2)
                .backoff(self.backoff.clone())
        }

        async fn process(&self, _payload: Value) -> JobResult<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_times {
                if self.fatal {
                    return Err(JobError::fatal("bad input"));
                }
                return Err(JobError::retryable("try again"));
            }
            Ok(JobOutcome::Done)
        }
    }

    struct Panicky;

    #[async_trait]
    impl JobHandler for Panicky {
        type Payload = Value;

        fn descriptor(&self) -> QueueDescriptor {
            QueueDescriptor::new("panicky")
                .max_retries(1)
                .backoff(BackoffPolicy::None)
        }

        async fn process(&self, _payload: Value) -> JobResult<Value> {
            panic!("boom");
        }
    }

    fn setup<H: JobHandler>(
        handler: H,
    ) -> (Arc<MemoryBroker>, Arc<MemoryOutbox>, Arc<HandlerRegistry>) {
        let broker = Arc::new(MemoryBroker::new());
        let outbox = Arc::new(MemoryOutbox::new());
        let registry = RegistryBuilder::new()
            .register(handler)
            .unwrap()
            .build(Publisher::new(broker.clone(), outbox.clone()));
        (broker, outbox, Arc::new(registry))
    }

    async fn drain(registry: &HandlerRegistry) -> u32 {
        let handler = registry.get("flaky").unwrap();
        let publisher = registry.publisher();
        let mut runs = 0;
        while run_once(handler.as_ref(), publisher.broker().as_ref(), publisher)
            .await
            .unwrap()
        {
            runs += 1;
        }
        runs
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let (broker, _, registry) = setup(Flaky {
            fail_times: 2,
            calls: calls.clone(),
            fatal: false,
            backoff: BackoffPolicy::None,
        });
        broker.publish(JobMessage::new("flaky", json!({}))).await.unwrap();

        assert_eq!(drain(&registry).await, 3);
        let depth = broker.depth("flaky").await.unwrap();
        assert_eq!(depth.dead, 0);
        assert_eq!(depth.in_flight, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_dead_letters_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let (broker, _, registry) = setup(Flaky {
            fail_times: 1,
            calls: calls.clone(),
            fatal: true,
            backoff: BackoffPolicy::None,
        });
        broker.publish(JobMessage::new("flaky", json!({}))).await.unwrap();

        assert_eq!(drain(&registry).await, 1);
        let dead = broker.dead_letters("flaky", 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 1);
        assert!(dead[0].last_error.contains("bad input"));
    }

    #[tokio::test]
    async fn test_failed_retry_is_captured_without_job_id() {
        let calls = Arc::new(AtomicU32::new(0));
        let (broker, outbox, registry) = setup(Flaky {
            fail_times: 1,
            calls,
            fatal: false,
            backoff: BackoffPolicy::Fixed(Duration::from_secs(30)),
        });
        let message = JobMessage::new("flaky", json!({}))
            .with_options(&JobOptions::with_job_id("flaky:1"));
        broker.publish(message).await.unwrap();

        let reserved = broker.reserve("flaky").await.unwrap().unwrap();
        broker.set_available(false);
        let handler = registry.get("flaky").unwrap();
        execute(handler.as_ref(), broker.as_ref(), registry.publisher(), reserved).await;

        let captured = outbox.oldest(10).await.unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].message.attempts, 1);
        assert!(captured[0].message.job_id.is_none());
        assert_eq!(captured[0].message.delay(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_retried_then_dead_lettered() {
        let (broker, _, registry) = setup(Panicky);
        broker.publish(JobMessage::new("panicky", json!({}))).await.unwrap();

        let handler = registry.get("panicky").unwrap();
        let publisher = registry.publisher();
        let mut runs = 0;
        while run_once(handler.as_ref(), broker.as_ref(), publisher)
            .await
            .unwrap()
        {
            runs += 1;
        }

        assert_eq!(runs, 2);
        let depth = broker.depth("panicky").await.unwrap();
        assert_eq!(depth.in_flight, 0);
        assert_eq!(depth.dead, 1);
        let dead = broker.dead_letters("panicky", 10).await.unwrap();
        assert!(dead[0].last_error.contains("handler panicked: boom"));
    }

    #[tokio::test]
    async fn test_consume_loop_processes_and_stops() {
        let calls = Arc::new(AtomicU32::new(0));
        let (broker, _, registry) = setup(Flaky {
            fail_times: 0,
            calls: calls.clone(),
            fatal: false,
            backoff: BackoffPolicy::None,
        });
        for n in 0..5 {
            broker
                .publish(JobMessage::new("flaky", json!({ "n": n })))
                .await
                .unwrap();
        }

        let config = WorkerConfig {
            poll_interval: Duration::from_millis(5),
            ..WorkerConfig::default()
        };
        let (tx, rx) = watch::channel(false);
        let handles = WorkerPool::new(registry, config).spawn(rx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 5 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(broker.depth("flaky").await.unwrap(), Default::default());
    }
}
