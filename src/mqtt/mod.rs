pub mod client;

use std::sync::Arc;

use async_trait::async_trait;
use rumqttc::QoS;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Callback invoked for every publish matching a subscription (topic, payload).
pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub struct MqttMessage {
    pub topic: String,
    pub payload: String,
}

/// Handler that hands messages to another task instead of handling them on
/// the event loop.
pub fn forward_to(tx: mpsc::Sender<MqttMessage>) -> MessageHandler {
    Arc::new(move |topic: &str, payload: &[u8]| {
        let msg = MqttMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).to_string(),
        };
        if let Err(e) = tx.try_send(msg) {
            warn!("Dropping message on {}: {}", topic, e);
        }
    })
}

/// Opaque handle returned by [`Transport::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub(crate) u64);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("unknown subscription {0:?}")]
    UnknownSubscription(SubscriptionId),
}

/// The publish/subscribe primitive the bridge is written against.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn subscribe(
        &self,
        filter: &str,
        qos: QoS,
        handler: MessageHandler,
    ) -> Result<SubscriptionId, TransportError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;
}

/// MQTT topic filter matching with `+` (single level) and `#` (multi level).
/// `#` also matches the parent level, so `a/#` matches `a`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
