//! Job messages and enqueue options.

use std::time::Duration;

use blockfeed_common::IdGenerator;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload in flight between a producer and a consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Broker-level message id.
    pub id: String,
    /// Target queue name.
    pub queue: String,
    /// Deduplication identity. At most one message per identity is live in a queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Handler payload.
    pub payload: Value,
    /// Delay before first delivery.
    #[serde(default)]
    pub delay_ms: u64,
    /// Whether the message must survive a consumer restart.
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    /// Failed deliveries so far.
    #[serde(default)]
    pub attempts: u32,
    /// When the producer created the message.
    pub enqueued_at: DateTime<Utc>,
}

const fn default_persistent() -> bool {
    true
}

impl JobMessage {
    /// Create a message for immediate delivery.
    #[must_use]
    pub fn new(queue: impl Into<String>, payload: Value) -> Self {
        Self {
            id: IdGenerator::new().generate(),
            queue: queue.into(),
            job_id: None,
            payload,
            delay_ms: 0,
            persistent: true,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// Apply enqueue options.
    #[must_use]
    pub fn with_options(mut self, options: &JobOptions) -> Self {
        self.job_id = options.resolved_job_id();
        self.delay_ms = u64::try_from(options.delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the persistence flag.
    #[must_use]
    pub const fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Delay before first delivery.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Per-call enqueue options.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Explicit deduplication identity.
    pub job_id: Option<String>,
    /// Delivery delay.
    pub delay: Duration,
    /// Give the message a fresh identity so it never collides with a live one.
    pub unique: bool,
}

impl JobOptions {
    /// Options for a delayed delivery.
    #[must_use]
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Options carrying a deduplication identity.
    #[must_use]
    pub fn with_job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    /// Set the delivery delay.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Force a fresh identity.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The identity the message will carry. `unique` wins over an explicit job id.
    fn resolved_job_id(&self) -> Option<String> {
        if self.unique {
            Some(format!("unique:{}", IdGenerator::new().generate()))
        } else {
            self.job_id.clone()
        }
    }
}

/// One entry of a batch enqueue.
#[derive(Debug, Clone)]
pub struct BatchItem<P> {
    /// Handler payload.
    pub payload: P,
    /// Enqueue options.
    pub options: JobOptions,
}

impl<P> BatchItem<P> {
    /// Batch entry with default options.
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            options: JobOptions::default(),
        }
    }

    /// Batch entry with explicit options.
    pub const fn with_options(payload: P, options: JobOptions) -> Self {
        Self { payload, options }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_applied() {
        let message = JobMessage::new("token-reindex", json!({ "contract": "0xa" })).with_options(
            &JobOptions::with_job_id("token:0xa").delay(Duration::from_secs(5)),
        );

        assert_eq!(message.job_id.as_deref(), Some("token:0xa"));
        assert_eq!(message.delay(), Duration::from_secs(5));
        assert_eq!(message.attempts, 0);
        assert!(message.persistent);
    }

    #[test]
    fn test_unique_overrides_job_id() {
        let options = JobOptions::with_job_id("token:0xa").unique();
        let a = JobMessage::new("q", json!(1)).with_options(&options);
        let b = JobMessage::new("q", json!(1)).with_options(&options);

        let a_id = a.job_id.unwrap();
        assert!(a_id.starts_with("unique:"));
        assert_ne!(Some(a_id), b.job_id);
    }

    #[test]
    fn test_message_deserializes_with_defaults() {
        let raw = json!({
            "id": "01j0",
            "queue": "q",
            "payload": { "x": 1 },
            "enqueued_at": "2025-06-01T00:00:00Z",
        });

        let message: JobMessage = serde_json::from_value(raw).unwrap();
        assert!(message.persistent);
        assert_eq!(message.delay_ms, 0);
        assert!(message.job_id.is_none());
    }
}
