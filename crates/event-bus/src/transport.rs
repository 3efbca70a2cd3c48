//! Broker transport: topic-scoped publish and per-topic handler dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use crate::bus::EventHandler;
use crate::envelope::EventEnvelope;
use crate::error::{EventBusError, Result};

/// Buffered messages per topic before slow subscribers start lagging.
const TOPIC_CHANNEL_CAPACITY: usize = 256;

/// A thin wrapper over a broker's publish and subscribe connections.
///
/// Delivery is at-least-once. Ordering is guaranteed only per topic on a
/// single publisher connection, not across topics or publishers. All
/// implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Establishes the publish and subscribe connections to the broker.
    ///
    /// Idempotent: calling it on an already-connected transport is a no-op.
    /// A connection failure here is fatal for startup.
    async fn connect(&self) -> Result<()>;

    /// Serializes the envelope and writes it to `topic`.
    ///
    /// Fails with `NotConnected` on a disconnected transport.
    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<()>;

    /// Registers `handler` for `topic`.
    ///
    /// Incoming messages are deserialized and dispatched to the handler.
    /// A handler that fails is logged; it never terminates the
    /// subscription loop.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<()>;

    /// Releases the subscription for `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Releases all broker resources.
    ///
    /// Subsequent publishes and subscribes fail explicitly rather than
    /// silently no-op.
    async fn disconnect(&self) -> Result<()>;
}

/// A process-local broker that in-memory transports attach to.
///
/// One broadcast channel per topic. Multiple transports sharing a broker
/// see each other's messages, which is how tests stand up participant
/// services next to the orchestrator.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    topics: Arc<RwLock<HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl InMemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the sender for `topic`, creating the channel on first use.
    async fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Returns the number of topics with at least one channel.
    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }
}

/// In-memory transport implementation.
///
/// Provides the same interface a production broker client would sit
/// behind. Messages are serialized to JSON bytes on publish and
/// deserialized in the subscription task, so the wire shape is exercised
/// even without a real broker.
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    connected: AtomicBool,
    subscriptions: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl InMemoryTransport {
    /// Creates a transport attached to the given broker.
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            connected: AtomicBool::new(false),
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventBusError::NotConnected)
        }
    }
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new(InMemoryBroker::new())
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        for (_, handle) in self.subscriptions.get_mut().drain() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ChannelTransport for InMemoryTransport {
    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &EventEnvelope) -> Result<()> {
        self.ensure_connected()?;

        let bytes = serde_json::to_vec(envelope)?;
        let sender = self.broker.sender(topic).await;

        // A send error only means no subscriber is currently attached;
        // the broker drops the message, matching pub/sub semantics.
        if sender.send(bytes).is_err() {
            tracing::trace!(topic, "no subscribers for topic, message dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.ensure_connected()?;

        let mut receiver = self.broker.sender(topic).await.subscribe();
        let topic_name = topic.to_string();

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(bytes) => {
                        let envelope = match serde_json::from_slice::<EventEnvelope>(&bytes) {
                            Ok(envelope) => envelope,
                            Err(error) => {
                                tracing::error!(topic = %topic_name, %error, "failed to decode message");
                                continue;
                            }
                        };
                        if let Err(error) = handler.handle(&envelope).await {
                            tracing::error!(
                                topic = %topic_name,
                                handler = handler.name(),
                                %error,
                                "handler failed"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(topic = %topic_name, skipped, "subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let mut subscriptions = self.subscriptions.write().await;
        if let Some(previous) = subscriptions.insert(topic.to_string(), task) {
            tracing::warn!(topic, "replacing existing subscription");
            previous.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        match subscriptions.remove(topic) {
            Some(task) => {
                task.abort();
                Ok(())
            }
            None => Err(EventBusError::NotSubscribed(topic.to_string())),
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        for (_, task) in subscriptions.drain() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records every envelope it receives; optionally fails each call.
    struct RecordingHandler {
        received: Mutex<Vec<EventEnvelope>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        fn name(&self) -> &str {
            "recording"
        }

        async fn handle(&self, event: &EventEnvelope) -> Result<()> {
            self.received.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(EventBusError::Handler {
                    handler: "recording".to_string(),
                    reason: "configured to fail".to_string(),
                });
            }
            Ok(())
        }
    }

    fn test_envelope(event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type(event_type)
            .payload_raw(serde_json::json!({"n": 1}))
            .source("test")
            .build()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn publish_before_connect_fails() {
        let transport = InMemoryTransport::default();
        let result = transport.publish("t", &test_envelope("e")).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));
    }

    #[tokio::test]
    async fn subscribe_before_connect_fails() {
        let transport = InMemoryTransport::default();
        let result = transport.subscribe("t", RecordingHandler::new()).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();
        transport.connect().await.unwrap();
        transport.publish("t", &test_envelope("e")).await.unwrap();
    }

    #[tokio::test]
    async fn publish_subscribe_roundtrip() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();

        let handler = RecordingHandler::new();
        transport.subscribe("t", handler.clone()).await.unwrap();

        transport.publish("t", &test_envelope("e")).await.unwrap();

        wait_until(|| handler.count() == 1).await;
        let received = handler.received.lock().unwrap();
        assert_eq!(received[0].event_type, "e");
    }

    #[tokio::test]
    async fn handler_failure_does_not_stop_subscription() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();

        let handler = RecordingHandler::failing();
        transport.subscribe("t", handler.clone()).await.unwrap();

        transport.publish("t", &test_envelope("first")).await.unwrap();
        transport.publish("t", &test_envelope("second")).await.unwrap();

        wait_until(|| handler.count() == 2).await;
    }

    #[tokio::test]
    async fn per_topic_ordering_is_preserved() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();

        let handler = RecordingHandler::new();
        transport.subscribe("t", handler.clone()).await.unwrap();

        for i in 0..10 {
            transport
                .publish("t", &test_envelope(&format!("e{i}")))
                .await
                .unwrap();
        }

        wait_until(|| handler.count() == 10).await;
        let received = handler.received.lock().unwrap();
        for (i, envelope) in received.iter().enumerate() {
            assert_eq!(envelope.event_type, format!("e{i}"));
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();

        let handler = RecordingHandler::new();
        transport.subscribe("t", handler.clone()).await.unwrap();
        transport.publish("t", &test_envelope("e")).await.unwrap();
        wait_until(|| handler.count() == 1).await;

        transport.unsubscribe("t").await.unwrap();
        transport.publish("t", &test_envelope("e")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_topic_fails() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();
        let result = transport.unsubscribe("missing").await;
        assert!(matches!(result, Err(EventBusError::NotSubscribed(_))));
    }

    #[tokio::test]
    async fn disconnected_transport_fails_explicitly() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();
        transport.disconnect().await.unwrap();

        let result = transport.publish("t", &test_envelope("e")).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));

        let result = transport.subscribe("t", RecordingHandler::new()).await;
        assert!(matches!(result, Err(EventBusError::NotConnected)));
    }

    #[tokio::test]
    async fn transports_sharing_a_broker_exchange_messages() {
        let broker = InMemoryBroker::new();
        let publisher = InMemoryTransport::new(broker.clone());
        let subscriber = InMemoryTransport::new(broker);
        publisher.connect().await.unwrap();
        subscriber.connect().await.unwrap();

        let handler = RecordingHandler::new();
        subscriber.subscribe("t", handler.clone()).await.unwrap();

        publisher.publish("t", &test_envelope("e")).await.unwrap();
        wait_until(|| handler.count() == 1).await;
    }

    #[tokio::test]
    async fn messages_on_other_topics_are_not_delivered() {
        let transport = InMemoryTransport::default();
        transport.connect().await.unwrap();

        let handler = RecordingHandler::new();
        transport.subscribe("a", handler.clone()).await.unwrap();

        transport.publish("b", &test_envelope("e")).await.unwrap();
        transport.publish("a", &test_envelope("wanted")).await.unwrap();

        wait_until(|| handler.count() == 1).await;
        assert_eq!(handler.received.lock().unwrap()[0].event_type, "wanted");
    }
}
