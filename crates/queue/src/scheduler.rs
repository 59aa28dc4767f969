//! Periodic tasks.
//!
//! Every task runs on its own interval loop. Each tick first takes the
//! task's lock keys through [`DistributedLock`]; a tick that finds the lock
//! held elsewhere is skipped, so at most one process runs a given task at a
//! time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, trace};

use crate::handler::ErasedHandler;
use crate::job::{JobMessage, JobOptions};
use crate::lock::DistributedLock;
use crate::producer::{EnqueueOutcome, Publisher};

/// Error returned by a task body.
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// A unit of periodic work.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Keys locked for the duration of a tick.
    fn lock_keys(&self) -> Vec<String> {
        vec![format!("task:{}", self.name())]
    }

    /// Expiry of the tick lock if the holder dies.
    fn lock_ttl(&self) -> Duration {
        (self.interval() * 10).max(Duration::from_secs(30))
    }

    /// Run once. Returns a count of items handled, for logging.
    async fn run(&self) -> Result<u64, TaskError>;
}

/// Outcome of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Ran(u64),
    Failed(String),
    /// Another process holds the lock.
    Skipped,
}

/// Run one tick of `task` under its lock.
pub async fn run_tick(lock: &DistributedLock, task: &dyn ScheduledTask) -> TickOutcome {
    let keys = task.lock_keys();
    match lock.with_lock(&keys, task.lock_ttl(), || task.run()).await {
        Ok(Some(Ok(count))) => TickOutcome::Ran(count),
        Ok(Some(Err(e))) => TickOutcome::Failed(e.to_string()),
        Ok(None) => TickOutcome::Skipped,
        Err(e) => TickOutcome::Failed(format!("lock unavailable: {e}")),
    }
}

/// Owns the interval loops of all scheduled tasks.
pub struct Scheduler {
    lock: DistributedLock,
    tasks: Vec<Arc<dyn ScheduledTask>>,
}

impl Scheduler {
    #[must_use]
    pub const fn new(lock: DistributedLock) -> Self {
        Self {
            lock,
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: Arc<dyn ScheduledTask>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn add(&mut self, task: Arc<dyn ScheduledTask>) {
        self.tasks.push(task);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn one loop per task. Loops exit when `shutdown` flips or its sender drops.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.tasks
            .into_iter()
            .map(|task| {
                let lock = self.lock.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut ticker = interval(task.interval());
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    info!(
                        task = task.name(),
                        interval_ms = u64::try_from(task.interval().as_millis()).unwrap_or(u64::MAX),
                        "Scheduled task started"
                    );

                    loop {
                        tokio::select! {
                            _ = ticker.tick() => {}
                            _ = shutdown.changed() => break,
                        }

                        match run_tick(&lock, task.as_ref()).await {
                            TickOutcome::Ran(count) => {
                                if count > 0 {
                                    debug!(task = task.name(), count, "Scheduled task ran");
                                }
                            }
                            TickOutcome::Failed(error) => {
                                error!(task = task.name(), error = %error, "Scheduled task failed");
                            }
                            TickOutcome::Skipped => {
                                trace!(task = task.name(), "Scheduled task locked elsewhere");
                            }
                        }
                    }

                    info!(task = task.name(), "Scheduled task stopped");
                })
            })
            .collect()
    }
}

/// Publishes a handler's scheduled payload on every tick of its descriptor interval.
///
/// The message carries a fixed job id, so a trigger that fires while the
/// previous one is still queued collapses into it. A tick that finds any
/// message of the queue ready, delayed or in flight publishes nothing:
/// continuations of an earlier run carry no job id of their own.
pub struct QueueTrigger {
    name: String,
    interval: Duration,
    handler: Arc<dyn ErasedHandler>,
    publisher: Publisher,
}

impl QueueTrigger {
    /// `None` when the handler declares no interval.
    #[must_use]
    pub fn for_handler(handler: Arc<dyn ErasedHandler>, publisher: Publisher) -> Option<Self> {
        let interval = handler.descriptor().interval?;
        Some(Self {
            name: format!("trigger:{}", handler.descriptor().name),
            interval,
            handler,
            publisher,
        })
    }
}

#[async_trait]
impl ScheduledTask for QueueTrigger {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<u64, TaskError> {
        let Some(payload) = self.handler.scheduled_payload() else {
            return Ok(0);
        };

        let descriptor = self.handler.descriptor();
        let depth = self.publisher.broker().depth(&descriptor.name).await?;
        if depth.ready + depth.delayed + depth.in_flight > 0 {
            trace!(queue = %descriptor.name, "Previous run still in progress");
            return Ok(0);
        }

        let message = JobMessage::new(descriptor.name.clone(), payload)
            .with_options(&JobOptions::with_job_id(format!("scheduled:{}", descriptor.name)))
            .with_persistent(descriptor.persistent);

        Ok(u64::from(
            self.publisher.publish(message).await == EnqueueOutcome::Queued,
        ))
    }
}
