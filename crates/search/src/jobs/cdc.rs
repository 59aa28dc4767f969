//! Change record consumer.

use std::sync::Arc;

use async_trait::async_trait;
use blockfeed_queue::{JobHandler, JobOutcome, JobResult, QueueDescriptor};

use crate::cdc::{CdcDispatcher, ChangeRecord};

pub const CDC_QUEUE: &str = "cdc-changes";

/// Feeds change records from the `cdc-changes` queue to the dispatcher.
pub struct CdcChangeJob {
    dispatcher: Arc<CdcDispatcher>,
}

impl CdcChangeJob {
    #[must_use]
    pub const fn new(dispatcher: Arc<CdcDispatcher>) -> Self {
        Self { dispatcher }
    }

    #[must_use]
    pub fn queue_descriptor() -> QueueDescriptor {
        QueueDescriptor::new(CDC_QUEUE).concurrency(4).max_retries(5)
    }
}

#[async_trait]
impl JobHandler for CdcChangeJob {
    type Payload = ChangeRecord;

    fn descriptor(&self) -> QueueDescriptor {
        Self::queue_descriptor()
    }

    async fn process(&self, record: ChangeRecord) -> JobResult<ChangeRecord> {
        self.dispatcher.dispatch(&record).await?;
        Ok(JobOutcome::Done)
    }
}
