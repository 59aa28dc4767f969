//! Message broker abstraction.
//!
//! The broker stores ready, delayed and in-flight messages per queue and
//! enforces job-id deduplication. Two implementations exist:
//!
//! - [`RedisBroker`]: production broker on Redis lists and sorted sets
//! - [`MemoryBroker`]: in-process broker for tests and single-node runs

mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blockfeed_common::AppError;
use serde::Serialize;
use thiserror::Error;

use crate::descriptor::QueueDescriptor;
use crate::job::JobMessage;
use crate::retry::DeadLetterEntry;

pub use memory::MemoryBroker;
pub use redis::{RedisBroker, RedisBrokerConfig};

/// Broker errors.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker cannot be reached.
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    /// A command failed on an established connection.
    #[error("broker command failed: {0}")]
    Command(String),
    /// A stored message could not be encoded or decoded.
    #[error("broker serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        Self::Queue(err.to_string())
    }
}

/// Accepted publish result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// Stored for delivery.
    Queued,
    /// A live message with the same job id exists; nothing was stored.
    Duplicate,
}

/// A message a batch publish could not store.
#[derive(Debug, Clone)]
pub struct FailedPublish {
    pub message: JobMessage,
    pub error: BrokerError,
}

/// Message counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
    pub dead: u64,
}

/// Message broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declare a queue before it is used. Idempotent.
    async fn declare(&self, _descriptor: &QueueDescriptor) -> Result<(), BrokerError> {
        Ok(())
    }

    /// Store a message for delivery on `message.queue`.
    async fn publish(&self, message: JobMessage) -> Result<PublishStatus, BrokerError>;

    /// Store many messages. Returns the ones that could not be stored.
    ///
    /// The default makes one [`Broker::publish`] call per message.
    async fn publish_batch(&self, messages: Vec<JobMessage>) -> Vec<FailedPublish> {
        let mut failed = Vec::new();
        for message in messages {
            if let Err(error) = self.publish(message.clone()).await {
                failed.push(FailedPublish { message, error });
            }
        }
        failed
    }

    /// Take the next deliverable message, moving it in flight.
    async fn reserve(&self, queue: &str) -> Result<Option<JobMessage>, BrokerError>;

    /// Acknowledge a processed message and release its job id.
    async fn ack(&self, message: &JobMessage) -> Result<(), BrokerError>;

    /// Put an in-flight message back for redelivery after `delay`.
    ///
    /// The job id stays reserved while the message waits.
    async fn retry(&self, message: JobMessage, delay: Duration) -> Result<(), BrokerError>;

    /// Move an in-flight message to the dead letter list and release its job id.
    async fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), BrokerError>;

    /// Claim or renew the single-consumer lease of a queue.
    async fn claim_consumer(
        &self,
        queue: &str,
        consumer: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError>;

    /// Give up the single-consumer lease if `consumer` holds it.
    async fn release_consumer(&self, queue: &str, consumer: &str) -> Result<(), BrokerError>;

    /// Message counts of a queue.
    async fn depth(&self, queue: &str) -> Result<QueueDepth, BrokerError>;

    /// Most recent dead letters of a queue.
    async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError>;

    /// Open a broker handle on its own connection. `None` when the broker
    /// has no such notion and the shared handle should be used.
    async fn dedicated(&self) -> Result<Option<Arc<dyn Broker>>, BrokerError> {
        Ok(None)
    }
}
