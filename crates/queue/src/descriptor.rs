//! Static queue configuration declared by each handler.

use std::time::Duration;

use crate::retry::BackoffPolicy;

/// Queue settings a handler declares once, at registration.
#[derive(Debug, Clone)]
pub struct QueueDescriptor {
    /// Queue name. Unique per registry.
    pub name: String,
    /// Maximum in-flight messages per consumer.
    pub concurrency: usize,
    /// Redeliveries allowed after the first failure.
    pub max_retries: u32,
    /// Delay policy between redeliveries.
    pub backoff: BackoffPolicy,
    /// Only one consumer across the deployment receives messages.
    pub single_active_consumer: bool,
    /// Payloads are stored apart from the ready list and fetched on delivery.
    pub lazy: bool,
    /// Unacknowledged messages survive a consumer crash.
    pub persistent: bool,
    /// Consume over the shared broker connection instead of a dedicated one.
    pub shared_channel: bool,
    /// Fixed trigger interval for handlers with a scheduled payload.
    pub interval: Option<Duration>,
}

impl QueueDescriptor {
    /// Descriptor with defaults: concurrency 1, three retries, exponential backoff.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: 1,
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            single_active_consumer: false,
            lazy: false,
            persistent: true,
            shared_channel: true,
            interval: None,
        }
    }

    #[must_use]
    pub const fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub const fn single_active_consumer(mut self) -> Self {
        self.single_active_consumer = true;
        self
    }

    #[must_use]
    pub const fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    #[must_use]
    pub const fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    #[must_use]
    pub const fn dedicated_channel(mut self) -> Self {
        self.shared_channel = false;
        self
    }

    #[must_use]
    pub const fn every(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// In-flight limit actually applied by the consumer loop.
    ///
    /// Single-active-consumer queues are strictly sequential.
    #[must_use]
    pub fn effective_concurrency(&self) -> usize {
        if self.single_active_consumer {
            1
        } else {
            self.concurrency.max(1)
        }
    }

    /// Redelivery delay after failure number `attempt`, or `None` once the
    /// retry budget is spent.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        (attempt <= self.max_retries).then(|| self.backoff.delay_for_attempt(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_active_consumer_forces_sequential() {
        let descriptor = QueueDescriptor::new("token-backfill")
            .concurrency(8)
            .single_active_consumer();
        assert_eq!(descriptor.effective_concurrency(), 1);

        let descriptor = QueueDescriptor::new("cdc-changes").concurrency(0);
        assert_eq!(descriptor.effective_concurrency(), 1);
    }

    #[test]
    fn test_retry_budget() {
        let descriptor = QueueDescriptor::new("q")
            .max_retries(2)
            .backoff(BackoffPolicy::Fixed(Duration::from_secs(3)));

        assert_eq!(descriptor.retry_delay(1), Some(Duration::from_secs(3)));
        assert_eq!(descriptor.retry_delay(2), Some(Duration::from_secs(3)));
        assert_eq!(descriptor.retry_delay(3), None);
    }

    #[test]
    fn test_zero_retries_dead_letters_first_failure() {
        let descriptor = QueueDescriptor::new("q").max_retries(0);
        assert_eq!(descriptor.retry_delay(1), None);
    }
}
