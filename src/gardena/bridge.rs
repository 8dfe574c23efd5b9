use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::QoS;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::message::{ActuatorCommand, CommandMessage, StateUpdate, parse_state_update};
use super::{DeviceAddress, response_topic};
use crate::mqtt::{MessageHandler, SubscriptionId, Transport, TransportError};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge {0} is already attached")]
    AlreadyAttached(String),
    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to unsubscribe from {topic}: {source}")]
    Unsubscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to publish to {topic}: {source}")]
    Publish {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
}

/// Sent to the host each time a state message for the entry was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRefresh {
    pub entry_id: String,
    pub is_on: bool,
}

#[derive(Debug, Clone)]
pub struct CommandSettings {
    pub response_client_id: String,
    /// Reused for every command when set; otherwise each command gets a fresh UUID.
    pub session_id: Option<String>,
    pub run_seconds: u32,
    pub call_timeout: Duration,
}

/// Inbound half, shared with the subscription handler.
struct Inbound {
    entry_id: String,
    actuator_index: u32,
    is_on: Mutex<bool>,
    refresh_tx: mpsc::UnboundedSender<StateRefresh>,
}

impl Inbound {
    fn handle(&self, topic: &str, payload: &[u8]) {
        let update = match parse_state_update(payload, self.actuator_index) {
            Ok(update) => update,
            Err(e) => {
                warn!(
                    "Ignoring malformed state message for {} on {}: {}",
                    self.entry_id, topic, e
                );
                return;
            }
        };

        let Some(is_on) = update.is_on() else {
            debug!("Ignoring unrecognized message on {}", topic);
            return;
        };

        // Hold the lock while notifying so refreshes keep delivery order.
        let mut state = self.is_on.lock();
        *state = is_on;
        let shape = match update {
            StateUpdate::Snapshot { .. } => "snapshot",
            _ => "direct",
        };
        info!(
            "State of {} is now {} ({} update on {})",
            self.entry_id,
            if is_on { "on" } else { "off" },
            shape,
            topic
        );
        let refresh = StateRefresh {
            entry_id: self.entry_id.clone(),
            is_on,
        };
        if self.refresh_tx.send(refresh).is_err() {
            debug!("State refresh receiver for {} is gone", self.entry_id);
        }
    }
}

/// Maps one actuator's bus state onto a boolean switch.
///
/// `is_on` only ever changes when the gateway reports a state; commands do not
/// update it optimistically.
pub struct ActuatorBridge<T: Transport> {
    address: DeviceAddress,
    transport: Arc<T>,
    settings: CommandSettings,
    inbound: Arc<Inbound>,
    subscription: tokio::sync::Mutex<Option<SubscriptionId>>,
}

impl<T: Transport> ActuatorBridge<T> {
    pub fn new(
        entry_id: impl Into<String>,
        address: DeviceAddress,
        transport: Arc<T>,
        settings: CommandSettings,
        refresh_tx: mpsc::UnboundedSender<StateRefresh>,
    ) -> Self {
        let inbound = Arc::new(Inbound {
            entry_id: entry_id.into(),
            actuator_index: address.actuator_index,
            is_on: Mutex::new(false),
            refresh_tx,
        });
        Self {
            address,
            transport,
            settings,
            inbound,
            subscription: tokio::sync::Mutex::new(None),
        }
    }

    pub fn entry_id(&self) -> &str {
        &self.inbound.entry_id
    }

    pub fn is_on(&self) -> bool {
        *self.inbound.is_on.lock()
    }

    pub async fn is_attached(&self) -> bool {
        self.subscription.lock().await.is_some()
    }

    /// Subscribe to the device's state topics. Fails if already attached.
    pub async fn attach(&self) -> Result<(), BridgeError> {
        let mut subscription = self.subscription.lock().await;
        if subscription.is_some() {
            return Err(BridgeError::AlreadyAttached(self.entry_id().to_string()));
        }

        let topic = self.address.state_topic();
        let inbound = self.inbound.clone();
        let handler: MessageHandler =
            Arc::new(move |topic: &str, payload: &[u8]| inbound.handle(topic, payload));

        let id = self
            .bounded(
                "subscribe",
                self.transport.subscribe(&topic, QoS::AtLeastOnce, handler),
            )
            .await?
            .map_err(|source| BridgeError::Subscribe {
                topic: topic.clone(),
                source,
            })?;

        *subscription = Some(id);
        info!("Subscribed {} to state topic {}", self.entry_id(), topic);
        Ok(())
    }

    /// Cancel the state subscription. No-op when not attached.
    pub async fn detach(&self) -> Result<(), BridgeError> {
        let mut subscription = self.subscription.lock().await;
        let Some(id) = *subscription else {
            return Ok(());
        };

        let result = self
            .bounded("unsubscribe", self.transport.unsubscribe(id))
            .await?;
        match result {
            Ok(()) => {}
            Err(TransportError::UnknownSubscription(_)) => {
                warn!("Subscription of {} was already gone", self.entry_id());
            }
            Err(source) => {
                return Err(BridgeError::Unsubscribe {
                    topic: self.address.state_topic(),
                    source,
                });
            }
        }

        *subscription = None;
        info!("Unsubscribed {} from state topic", self.entry_id());
        Ok(())
    }

    pub async fn turn_on(&self) -> Result<(), BridgeError> {
        self.send(ActuatorCommand::Start {
            seconds: self.settings.run_seconds,
        })
        .await
    }

    pub async fn turn_off(&self) -> Result<(), BridgeError> {
        self.send(ActuatorCommand::Stop).await
    }

    async fn send(&self, command: ActuatorCommand) -> Result<(), BridgeError> {
        let session_id = self
            .settings
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let res_topic = response_topic(
            &self.address.tenant,
            &self.settings.response_client_id,
            &session_id,
        );
        let payload = CommandMessage::new(command, session_id, res_topic).to_bytes()?;
        let topic = self.address.command_topic();

        info!("Sending {:?} for {} to {}", command, self.entry_id(), topic);

        let result = self
            .bounded(
                "publish",
                self.transport
                    .publish(&topic, QoS::AtLeastOnce, false, payload),
            )
            .await?;
        result.map_err(|source| BridgeError::Publish { topic, source })
    }

    async fn bounded<F: Future>(
        &self,
        operation: &'static str,
        fut: F,
    ) -> Result<F::Output, BridgeError> {
        let timeout = self.settings.call_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| BridgeError::Timeout { operation, timeout })
    }
}
