//! In-process broker.
//!
//! Everything lives in one process, so the persistence flag has no effect
//! and a dedicated channel is the shared one.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Broker, BrokerError, PublishStatus, QueueDepth};
use crate::delayed::DelayedQueue;
use crate::job::JobMessage;
use crate::retry::DeadLetterEntry;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<JobMessage>,
    delayed: DelayedQueue,
    in_flight: HashMap<String, JobMessage>,
    /// Live job id to the message id holding it.
    job_ids: HashMap<String, String>,
    dead: Vec<DeadLetterEntry>,
    consumer: Option<(String, Instant)>,
}

impl QueueState {
    fn promote_due(&mut self) {
        for message in self.delayed.pop_due(Instant::now()) {
            self.ready.push_back(message);
        }
    }

    /// Free the message's job id unless a newer message holds it.
    fn release_job_id(&mut self, message: &JobMessage) {
        if let Some(job_id) = &message.job_id
            && self.job_ids.get(job_id) == Some(&message.id)
        {
            self.job_ids.remove(job_id);
        }
    }

    fn enqueue(&mut self, message: JobMessage, delay: Duration) {
        if delay.is_zero() {
            self.ready.push_back(message);
        } else {
            self.delayed.schedule(message, delay);
        }
    }
}

/// Broker backed by process memory.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
    unavailable: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), BrokerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(BrokerError::Unavailable("memory broker offline".to_string()))
        } else {
            Ok(())
        }
    }

    /// Payloads waiting on a queue, ready first, without consuming them.
    pub async fn ready_payloads(&self, queue: &str) -> Vec<serde_json::Value> {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.promote_due();
        state.ready.iter().map(|m| m.payload.clone()).collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: JobMessage) -> Result<PublishStatus, BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(message.queue.clone()).or_default();

        if let Some(job_id) = &message.job_id {
            match state.job_ids.entry(job_id.clone()) {
                Entry::Occupied(_) => return Ok(PublishStatus::Duplicate),
                Entry::Vacant(slot) => {
                    slot.insert(message.id.clone());
                }
            }
        }

        let delay = message.delay();
        state.enqueue(message, delay);
        Ok(PublishStatus::Queued)
    }

    async fn reserve(&self, queue: &str) -> Result<Option<JobMessage>, BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.promote_due();

        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };
        state.in_flight.insert(message.id.clone(), message.clone());
        Ok(Some(message))
    }

    async fn ack(&self, message: &JobMessage) -> Result<(), BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(&message.queue) {
            state.in_flight.remove(&message.id);
            state.release_job_id(message);
        }
        Ok(())
    }

    async fn retry(&self, message: JobMessage, delay: Duration) -> Result<(), BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(message.queue.clone()).or_default();
        state.in_flight.remove(&message.id);
        state.enqueue(message, delay);
        Ok(())
    }

    async fn dead_letter(&self, entry: DeadLetterEntry) -> Result<(), BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(entry.message.queue.clone()).or_default();
        state.in_flight.remove(&entry.message.id);
        state.release_job_id(&entry.message);
        state.dead.push(entry);
        Ok(())
    }

    async fn claim_consumer(
        &self,
        queue: &str,
        consumer: &str,
        ttl: Duration,
    ) -> Result<bool, BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        let now = Instant::now();

        let claimable = match &state.consumer {
            None => true,
            Some((holder, expires)) => holder == consumer || *expires <= now,
        };
        if claimable {
            state.consumer = Some((consumer.to_string(), now + ttl));
        }
        Ok(claimable)
    }

    async fn release_consumer(&self, queue: &str, consumer: &str) -> Result<(), BrokerError> {
        self.check()?;

        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue)
            && state
                .consumer
                .as_ref()
                .is_some_and(|(holder, _)| holder == consumer)
        {
            state.consumer = None;
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<QueueDepth, BrokerError> {
        self.check()?;

        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or_else(QueueDepth::default, |state| QueueDepth {
            ready: state.ready.len() as u64,
            delayed: state.delayed.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead: state.dead.len() as u64,
        }))
    }

    async fn dead_letters(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        self.check()?;

        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or_else(Vec::new, |state| {
            state.dead.iter().rev().take(limit).cloned().collect()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use serde_json::json;

    fn message(job_id: Option<&str>) -> JobMessage {
        let options = job_id.map_or_else(JobOptions::default, JobOptions::with_job_id);
        JobMessage::new("q", json!({})).with_options(&options)
    }

    #[tokio::test]
    async fn test_job_id_dedup_until_ack() {
        let broker = MemoryBroker::new();

        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Queued
        );
        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Duplicate
        );

        let reserved = broker.reserve("q").await.unwrap().unwrap();
        // Still live while in flight.
        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Duplicate
        );

        broker.ack(&reserved).await.unwrap();
        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_messages_without_job_id_never_collapse() {
        let broker = MemoryBroker::new();
        broker.publish(message(None)).await.unwrap();
        broker.publish(message(None)).await.unwrap();

        assert_eq!(broker.depth("q").await.unwrap().ready, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_keeps_job_id_and_delays() {
        let broker = MemoryBroker::new();
        broker.publish(message(Some("a"))).await.unwrap();

        let reserved = broker.reserve("q").await.unwrap().unwrap();
        broker
            .retry(reserved, Duration::from_secs(10))
            .await
            .unwrap();

        assert!(broker.reserve("q").await.unwrap().is_none());
        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Duplicate
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(broker.reserve("q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dead_letter_releases_job_id() {
        let broker = MemoryBroker::new();
        broker.publish(message(Some("a"))).await.unwrap();

        let reserved = broker.reserve("q").await.unwrap().unwrap();
        broker
            .dead_letter(DeadLetterEntry::new(reserved, 1, "boom".into()))
            .await
            .unwrap();

        let depth = broker.depth("q").await.unwrap();
        assert_eq!(depth.dead, 1);
        assert_eq!(depth.in_flight, 0);
        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Queued
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_consumer_lease() {
        let broker = MemoryBroker::new();
        let ttl = Duration::from_secs(5);

        assert!(broker.claim_consumer("q", "a", ttl).await.unwrap());
        assert!(!broker.claim_consumer("q", "b", ttl).await.unwrap());
        assert!(broker.claim_consumer("q", "a", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(broker.claim_consumer("q", "b", ttl).await.unwrap());

        broker.release_consumer("q", "a").await.unwrap();
        assert!(!broker.claim_consumer("q", "a", ttl).await.unwrap());
        broker.release_consumer("q", "b").await.unwrap();
        assert!(broker.claim_consumer("q", "a", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        assert!(matches!(
            broker.publish(message(None)).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(broker.reserve("q").await.is_err());

        let failed = broker.publish_batch(vec![message(None), message(None)]).await;
        assert_eq!(failed.len(), 2);

        broker.set_available(true);
        assert!(broker.publish_batch(vec![message(None)]).await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_ack_keeps_newer_job_id() {
        let broker = MemoryBroker::new();
        broker.publish(message(Some("a"))).await.unwrap();
        let first = broker.reserve("q").await.unwrap().unwrap();
        broker.ack(&first).await.unwrap();

        broker.publish(message(Some("a"))).await.unwrap();
        // A second ack of the old delivery must not free the live id.
        broker.ack(&first).await.unwrap();

        assert_eq!(
            broker.publish(message(Some("a"))).await.unwrap(),
            PublishStatus::Duplicate
        );
        assert_eq!(broker.depth("q").await.unwrap().ready, 1);
    }
}
