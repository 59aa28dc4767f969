//! Job handler contract.
//!
//! A handler owns one queue: it declares the queue's [`QueueDescriptor`]
//! and processes typed payloads. The registry stores handlers behind the
//! type-erased [`ErasedHandler`] so the consumer loop can drive every
//! queue with the same code.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use blockfeed_common::AppError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::descriptor::QueueDescriptor;
use crate::job::JobMessage;

/// Result of processing one payload.
pub type JobResult<P> = Result<JobOutcome<P>, JobError>;

/// Successful outcome of [`JobHandler::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome<P> {
    /// Nothing left to do.
    Done,
    /// Republish `payload` to the same queue after `delay`.
    Continue {
        /// Next payload.
        payload: P,
        /// Delivery delay.
        delay: Duration,
        /// Give the continuation a fresh identity.
        unique: bool,
    },
}

impl<P> JobOutcome<P> {
    /// Continuation without a fresh identity.
    pub const fn continue_with(payload: P, delay: Duration) -> Self {
        Self::Continue {
            payload,
            delay,
            unique: false,
        }
    }

    /// Continuation that can never be collapsed into a live message.
    pub const fn continue_unique(payload: P, delay: Duration) -> Self {
        Self::Continue {
            payload,
            delay,
            unique: true,
        }
    }

    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }
}

/// Processing failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// Counts against the retry budget.
    #[error("{0}")]
    Retryable(String),
    /// Dead-letters without further attempts.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl JobError {
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

impl From<AppError> for JobError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Serialization(_) | AppError::Config(_) => Self::Fatal(err.to_string()),
            _ => Self::Retryable(err.to_string()),
        }
    }
}

/// A typed queue handler.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Payload carried by this queue's messages.
    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Queue configuration.
    fn descriptor(&self) -> QueueDescriptor;

    /// Process one payload.
    async fn process(&self, payload: Self::Payload) -> JobResult<Self::Payload>;

    /// Called after `process` succeeds. Never affects the retry budget.
    async fn on_completed(&self, _message: &JobMessage, _outcome: &JobOutcome<Self::Payload>) {}

    /// Payload published on every tick of [`QueueDescriptor::interval`].
    fn scheduled_payload(&self) -> Option<Self::Payload> {
        None
    }
}

/// Continuation produced by an erased handler.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub payload: Value,
    pub delay: Duration,
    pub unique: bool,
}

/// Object-safe view of a [`JobHandler`] working on raw JSON payloads.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    fn descriptor(&self) -> &QueueDescriptor;

    /// Decode, process and re-encode any continuation.
    async fn handle(&self, message: &JobMessage) -> Result<Option<Continuation>, JobError>;

    /// Encoded scheduled payload, if the handler has one.
    fn scheduled_payload(&self) -> Option<Value>;
}

pub(crate) struct HandlerAdapter<H: JobHandler> {
    handler: H,
    descriptor: QueueDescriptor,
    _payload: PhantomData<fn() -> H::Payload>,
}

impl<H: JobHandler> HandlerAdapter<H> {
    pub(crate) fn new(handler: H) -> Self {
        let descriptor = handler.descriptor();
        Self {
            handler,
            descriptor,
            _payload: PhantomData,
        }
    }
}

#[async_trait]
impl<H: JobHandler> ErasedHandler for HandlerAdapter<H> {
    fn descriptor(&self) -> &QueueDescriptor {
        &self.descriptor
    }

    async fn handle(&self, message: &JobMessage) -> Result<Option<Continuation>, JobError> {
        // A payload that does not decode will never decode.
        let payload: H::Payload = serde_json::from_value(message.payload.clone())
            .map_err(|e| JobError::Fatal(format!("invalid payload: {e}")))?;

        let outcome = self.handler.process(payload).await?;
        self.handler.on_completed(message, &outcome).await;

        match outcome {
            JobOutcome::Done => Ok(None),
            JobOutcome::Continue {
                payload,
                delay,
                unique,
            } => {
                let payload = serde_json::to_value(payload).map_err(JobError::fatal)?;
                Ok(Some(Continuation {
                    payload,
                    delay,
                    unique,
                }))
            }
        }
    }

    fn scheduled_payload(&self) -> Option<Value> {
        self.handler
            .scheduled_payload()
            .and_then(|payload| serde_json::to_value(payload).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Countdown {
        remaining: u32,
    }

    #[derive(Default)]
    struct CountdownHandler {
        completed: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for CountdownHandler {
        type Payload = Countdown;

        fn descriptor(&self) -> QueueDescriptor {
            QueueDescriptor::new("countdown")
        }

        async fn process(&self, payload: Countdown) -> JobResult<Countdown> {
            if payload.remaining == 0 {
                return Ok(JobOutcome::Done);
            }
            Ok(JobOutcome::continue_unique(
                Countdown {
                    remaining: payload.remaining - 1,
                },
                Duration::from_secs(1),
            ))
        }

        async fn on_completed(&self, _message: &JobMessage, _outcome: &JobOutcome<Countdown>) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_adapter_encodes_continuation() {
        let adapter = HandlerAdapter::new(CountdownHandler::default());
        let message = JobMessage::new("countdown", json!({ "remaining": 2 }));

        let next = adapter.handle(&message).await.unwrap().unwrap();
        assert_eq!(next.payload, json!({ "remaining": 1 }));
        assert_eq!(next.delay, Duration::from_secs(1));
        assert!(next.unique);
        assert_eq!(adapter.handler.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_fatal() {
        let adapter = HandlerAdapter::new(CountdownHandler::default());
        let message = JobMessage::new("countdown", json!({ "remaining": "many" }));

        let err = adapter.handle(&message).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(adapter.handler.completed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_app_error_mapping() {
        assert!(JobError::from(AppError::Database("timeout".into())).is_retryable());
        assert!(!JobError::from(AppError::Serialization("bad".into())).is_retryable());
    }
}
