//! Handler registry.
//!
//! Built once at startup and shared read-only afterwards. Queue names are
//! unique: registering two handlers for the same queue is a configuration
//! error.

use std::collections::BTreeMap;
use std::sync::Arc;

use blockfeed_common::{AppError, AppResult};
use tracing::info;

use crate::broker::BrokerError;
use crate::descriptor::QueueDescriptor;
use crate::handler::{ErasedHandler, HandlerAdapter, JobHandler};
use crate::producer::Publisher;

/// Collects handlers before the registry is frozen.
#[derive(Default)]
pub struct RegistryBuilder {
    handlers: BTreeMap<String, Arc<dyn ErasedHandler>>,
}

impl RegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its descriptor's queue name.
    pub fn register<H: JobHandler>(mut self, handler: H) -> AppResult<Self> {
        let adapter = HandlerAdapter::new(handler);
        let name = adapter.descriptor().name.clone();

        if self.handlers.contains_key(&name) {
            return Err(AppError::Config(format!(
                "queue '{name}' has more than one handler"
            )));
        }

        self.handlers.insert(name, Arc::new(adapter));
        Ok(self)
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self, publisher: Publisher) -> HandlerRegistry {
        HandlerRegistry {
            handlers: self.handlers,
            publisher,
        }
    }
}

/// Read-only handler lookup by queue name.
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn ErasedHandler>>,
    publisher: Publisher,
}

impl HandlerRegistry {
    #[must_use]
    pub fn get(&self, queue: &str) -> Option<&Arc<dyn ErasedHandler>> {
        self.handlers.get(queue)
    }

    #[must_use]
    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    /// Handlers in queue-name order.
    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn ErasedHandler>> {
        self.handlers.values()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &QueueDescriptor> {
        self.handlers.values().map(|h| h.descriptor())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    #[must_use]
    pub const fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Declare every registered queue on the broker.
    pub async fn declare_all(&self) -> Result<(), BrokerError> {
        for descriptor in self.descriptors() {
            self.publisher.broker().declare(descriptor).await?;
        }
        info!(queues = self.handlers.len(), "Queues declared");
        Ok(())
    }
}
