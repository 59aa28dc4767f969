//! Producers.
//!
//! [`Publisher`] hands messages to the broker. When the broker refuses a
//! message, it is written to the outbox instead and the caller sees
//! [`EnqueueOutcome::Deferred`]. Publish failures never surface as errors.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use blockfeed_common::{AppResult, get_metrics, metrics};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::broker::{Broker, BrokerError, FailedPublish, PublishStatus};
use crate::descriptor::QueueDescriptor;
use crate::job::{BatchItem, JobMessage, JobOptions};
use crate::outbox::{OutboxEntry, OutboxStore};

/// What happened to an enqueued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted by the broker.
    Queued,
    /// Collapsed into a live message with the same job id.
    Duplicate,
    /// The broker was unavailable; the message waits in the outbox.
    Deferred,
}

/// Result of a batch enqueue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Messages accepted by the broker, duplicates included.
    pub accepted: usize,
    /// Messages captured in the outbox.
    pub deferred: usize,
}

/// Broker front with outbox fallback.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    outbox: Arc<dyn OutboxStore>,
}

impl Publisher {
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, outbox: Arc<dyn OutboxStore>) -> Self {
        Self { broker, outbox }
    }

    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    #[must_use]
    pub fn outbox(&self) -> &Arc<dyn OutboxStore> {
        &self.outbox
    }

    /// Publish one message.
    pub async fn publish(&self, message: JobMessage) -> EnqueueOutcome {
        match self.broker.publish(message.clone()).await {
            Ok(PublishStatus::Queued) => {
                metrics::incr(&get_metrics().jobs_enqueued);
                debug!(queue = %message.queue, message_id = %message.id, "Job enqueued");
                EnqueueOutcome::Queued
            }
            Ok(PublishStatus::Duplicate) => {
                debug!(
                    queue = %message.queue,
                    job_id = ?message.job_id,
                    "Job already live; enqueue collapsed"
                );
                EnqueueOutcome::Duplicate
            }
            Err(e) => {
                self.capture(message, &e).await;
                EnqueueOutcome::Deferred
            }
        }
    }

    /// Publish many messages through [`Broker::publish_batch`].
    ///
    /// Each message settles on its own: the ones the broker refuses go to
    /// the outbox and the rest stay published.
    pub async fn publish_batch(&self, messages: Vec<JobMessage>) -> BatchOutcome {
        let total = messages.len();
        let failed = self.broker.publish_batch(messages).await;
        let deferred = failed.len();

        for FailedPublish { message, error } in failed {
            self.capture(message, &error).await;
        }

        let accepted = total - deferred;
        metrics::add(&get_metrics().jobs_enqueued, accepted as u64);
        BatchOutcome { accepted, deferred }
    }

    /// Write a message the broker refused to the outbox.
    pub(crate) async fn capture(&self, message: JobMessage, error: &BrokerError) {
        let queue = message.queue.clone();
        let payload = message.payload.to_string();

        match self.outbox.insert(OutboxEntry::capture(message, error)).await {
            Ok(()) => {
                metrics::incr(&get_metrics().outbox_captured);
                warn!(queue = %queue, error = %error, "Publish failed; message captured in outbox");
            }
            Err(e) => {
                error!(
                    queue = %queue,
                    payload = %payload,
                    publish_error = %error,
                    error = %e,
                    "Publish failed and outbox capture failed; message lost"
                );
            }
        }
    }
}

/// Typed producer for one queue.
pub struct JobQueue<P> {
    publisher: Publisher,
    queue: String,
    persistent: bool,
    _payload: PhantomData<fn(P)>,
}

impl<P> Clone for JobQueue<P> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            queue: self.queue.clone(),
            persistent: self.persistent,
            _payload: PhantomData,
        }
    }
}

impl<P: Serialize> JobQueue<P> {
    #[must_use]
    pub fn new(publisher: Publisher, descriptor: &QueueDescriptor) -> Self {
        Self {
            publisher,
            queue: descriptor.name.clone(),
            persistent: descriptor.persistent,
            _payload: PhantomData,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.queue
    }

    fn message(&self, payload: &P, options: &JobOptions) -> AppResult<JobMessage> {
        let payload = serde_json::to_value(payload)?;
        Ok(JobMessage::new(self.queue.clone(), payload)
            .with_options(options)
            .with_persistent(self.persistent))
    }

    /// Enqueue a payload, optionally delayed.
    ///
    /// Only a payload that cannot be serialized is an error.
    pub async fn add_to_queue(
        &self,
        payload: &P,
        delay: Option<Duration>,
    ) -> AppResult<EnqueueOutcome> {
        let options = delay.map_or_else(JobOptions::default, JobOptions::delayed);
        self.add_to_queue_with(payload, options).await
    }

    /// Enqueue a payload with explicit options.
    pub async fn add_to_queue_with(
        &self,
        payload: &P,
        options: JobOptions,
    ) -> AppResult<EnqueueOutcome> {
        let message = self.message(payload, &options)?;
        Ok(self.publisher.publish(message).await)
    }

    /// Enqueue many payloads. Duplicates count as accepted.
    pub async fn add_to_queue_batch(&self, items: Vec<BatchItem<P>>) -> AppResult<BatchOutcome> {
        let messages = items
            .iter()
            .map(|item| self.message(&item.payload, &item.options))
            .collect::<AppResult<Vec<_>>>()?;

        if messages.is_empty() {
            return Ok(BatchOutcome::default());
        }
        Ok(self.publisher.publish_batch(messages).await)
    }
}
