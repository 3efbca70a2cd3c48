//! Domain-level pub/sub on top of the channel transport.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::RwLock;

use common::CorrelationId;

use crate::config::BusConfig;
use crate::envelope::EventEnvelope;
use crate::error::Result;
use crate::transport::ChannelTransport;

/// A consumer of events delivered by the bus.
///
/// All implementations must be thread-safe (Send + Sync). A handler that
/// returns an error is logged and isolated; it never affects sibling
/// handlers or the subscription itself.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// A short name used in logs when the handler fails.
    fn name(&self) -> &str {
        "anonymous"
    }

    /// Processes one event.
    ///
    /// Delivery is at-least-once, so handlers must tolerate duplicates.
    async fn handle(&self, event: &EventEnvelope) -> Result<()>;
}

type HandlerRegistry = Arc<RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>>;

/// Domain event bus: namespaces topics, stamps envelope metadata, and
/// fans out to every handler registered for an event type.
///
/// The first subscription for an event type opens the underlying
/// transport subscription once; later subscriptions for the same type
/// only append to a local registry.
pub struct EventBus<T: ChannelTransport> {
    transport: Arc<T>,
    namespace: String,
    handlers: HandlerRegistry,
}

impl<T: ChannelTransport> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            namespace: self.namespace.clone(),
            handlers: Arc::clone(&self.handlers),
        }
    }
}

impl<T: ChannelTransport> EventBus<T> {
    /// Creates a bus over the given transport.
    pub fn new(transport: Arc<T>, config: &BusConfig) -> Self {
        Self {
            transport,
            namespace: config.namespace.clone(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns the broker topic for an event type.
    pub fn topic(&self, event_type: &str) -> String {
        format!("{}:events:{}", self.namespace, event_type)
    }

    /// Publishes an event, stamping the current time and the given source.
    #[tracing::instrument(skip(self, payload))]
    pub async fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        source: &str,
        correlation_id: Option<CorrelationId>,
    ) -> Result<()> {
        let mut builder = EventEnvelope::builder()
            .event_type(event_type)
            .payload_raw(payload)
            .source(source);
        if let Some(id) = correlation_id {
            builder = builder.correlation_id(id);
        }
        let envelope = builder.build();

        self.transport.publish(&self.topic(event_type), &envelope).await?;

        metrics::counter!("event_bus_published_total").increment(1);
        tracing::debug!(event_type, "event published");
        Ok(())
    }

    /// Registers a handler for an event type.
    pub async fn subscribe(&self, event_type: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        match handlers.entry(event_type.to_string()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(handler);
            }
            Entry::Vacant(entry) => {
                entry.insert(vec![handler]);
                let dispatcher = Arc::new(FanOutDispatcher {
                    event_type: event_type.to_string(),
                    handlers: Arc::clone(&self.handlers),
                });
                if let Err(error) = self.transport.subscribe(&self.topic(event_type), dispatcher).await {
                    handlers.remove(event_type);
                    return Err(error);
                }
            }
        }
        tracing::debug!(event_type, "handler registered");
        Ok(())
    }

    /// Closes the transport subscription for an event type and clears its
    /// handler registry.
    pub async fn unsubscribe(&self, event_type: &str) -> Result<()> {
        self.handlers.write().await.remove(event_type);
        self.transport.unsubscribe(&self.topic(event_type)).await
    }

    /// Returns the number of handlers registered for an event type.
    pub async fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .await
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// The single transport-level handler per event type. Runs every
/// registered handler concurrently and isolates individual failures.
struct FanOutDispatcher {
    event_type: String,
    handlers: HandlerRegistry,
}

#[async_trait]
impl EventHandler for FanOutDispatcher {
    fn name(&self) -> &str {
        "fan-out"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .await
            .get(&self.event_type)
            .cloned()
            .unwrap_or_default();

        let results = join_all(handlers.iter().map(|handler| handler.handle(event))).await;
        for (handler, result) in handlers.iter().zip(results) {
            if let Err(error) = result {
                tracing::error!(
                    event_type = %self.event_type,
                    handler = handler.name(),
                    %error,
                    "event handler failed"
                );
                metrics::counter!("event_bus_handler_failures_total").increment(1);
            }
        }
        Ok(())
    }
}
