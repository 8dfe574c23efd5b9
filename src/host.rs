//! Host side of the bridge: one on/off switch per configured entry, exposed on
//! plain MQTT command/state topics and optionally announced through Home
//! Assistant discovery.

use std::collections::HashMap;
use std::sync::Arc;

use rumqttc::QoS;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{Config, EntryConfig};
use crate::gardena::bridge::{ActuatorBridge, BridgeError, StateRefresh};
use crate::mqtt::{MqttMessage, SubscriptionId, Transport, TransportError, forward_to};

const UNIQUE_ID_PREFIX: &str = "gardena_smart_system_mqtt_switch";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Some(SwitchCommand::On),
            "off" | "0" | "false" => Some(SwitchCommand::Off),
            _ => None,
        }
    }
}

pub fn state_payload(is_on: bool) -> &'static str {
    if is_on { "ON" } else { "OFF" }
}

/// Parse a switch set topic into its entry id.
/// Expected format: {prefix}/{entry_id}/set
pub fn parse_set_topic<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    let entry_id = rest.strip_suffix("/set")?;
    if entry_id.is_empty() || entry_id.contains('/') {
        return None;
    }
    Some(entry_id)
}

/// Home Assistant MQTT discovery document for an entry's switch.
pub fn discovery_document(config: &Config, entry: &EntryConfig) -> serde_json::Value {
    json!({
        "name": entry.name,
        "unique_id": format!("{UNIQUE_ID_PREFIX}_{}", entry.entry_id),
        "command_topic": config.switch_command_topic(&entry.entry_id),
        "state_topic": config.switch_state_topic(&entry.entry_id),
        "availability_topic": config.bridge_status_topic(),
        "payload_on": state_payload(true),
        "payload_off": state_payload(false),
        "optimistic": false,
        "icon": "mdi:sprinkler",
        "device": {
            "identifiers": [format!("gardena_{}_{}", entry.gateway_id, entry.device_id)],
            "name": entry.name,
            "manufacturer": "GARDENA",
            "via_device": entry.gateway_id,
        },
    })
}

/// Bridges owned by the host adapter, keyed by entry id.
pub struct BridgeRegistry<T: Transport> {
    bridges: HashMap<String, Arc<ActuatorBridge<T>>>,
}

impl<T: Transport> Default for BridgeRegistry<T> {
    fn default() -> Self {
        Self {
            bridges: HashMap::new(),
        }
    }
}

impl<T: Transport> BridgeRegistry<T> {
    /// Attach the bridge and register it. A bridge that fails to attach is
    /// not registered.
    pub async fn setup(&mut self, bridge: ActuatorBridge<T>) -> Result<(), BridgeError> {
        let entry_id = bridge.entry_id().to_string();
        if self.bridges.contains_key(&entry_id) {
            return Err(BridgeError::AlreadyAttached(entry_id));
        }
        bridge.attach().await?;
        self.bridges.insert(entry_id, Arc::new(bridge));
        Ok(())
    }

    /// Detach and drop the entry's bridge. Returns false if it was not registered.
    pub async fn unload(&mut self, entry_id: &str) -> Result<bool, BridgeError> {
        let Some(bridge) = self.bridges.remove(entry_id) else {
            return Ok(false);
        };
        bridge.detach().await?;
        Ok(true)
    }

    pub fn get(&self, entry_id: &str) -> Option<Arc<ActuatorBridge<T>>> {
        self.bridges.get(entry_id).cloned()
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.bridges.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

pub struct HostAdapter<T: Transport> {
    config: Config,
    transport: Arc<T>,
    registry: BridgeRegistry<T>,
    command_subscription: Option<SubscriptionId>,
}

impl<T: Transport> HostAdapter<T> {
    pub fn new(config: Config, transport: Arc<T>) -> Self {
        Self {
            config,
            transport,
            registry: BridgeRegistry::default(),
            command_subscription: None,
        }
    }

    pub fn registry(&self) -> &BridgeRegistry<T> {
        &self.registry
    }

    /// Listen for switch commands and set up a bridge per configured entry.
    /// Entries that fail to set up are logged and skipped.
    pub async fn start(
        &mut self,
        command_tx: mpsc::Sender<MqttMessage>,
        refresh_tx: mpsc::UnboundedSender<StateRefresh>,
    ) -> Result<(), TransportError> {
        let filter = self.config.switch_command_filter();
        let id = self
            .transport
            .subscribe(&filter, QoS::AtLeastOnce, forward_to(command_tx))
            .await?;
        self.command_subscription = Some(id);

        for entry in self.config.entries.clone() {
            let bridge = ActuatorBridge::new(
                entry.entry_id.clone(),
                self.config.device_address(&entry),
                self.transport.clone(),
                self.config.command_settings(),
                refresh_tx.clone(),
            );
            if let Err(e) = self.registry.setup(bridge).await {
                error!("Failed to set up {}: {}", entry.name, e);
                continue;
            }
            info!(
                "  Switch: {} -> gateway {} device {} actuator {}",
                entry.entry_id, entry.gateway_id, entry.device_id, entry.actuator_index
            );

            if self.config.host.discovery {
                self.publish_discovery(&entry).await;
            }
        }
        Ok(())
    }

    async fn publish_discovery(&self, entry: &EntryConfig) {
        let topic = self.config.discovery_topic(&entry.entry_id);
        let document = discovery_document(&self.config, entry).to_string();
        if let Err(e) = self
            .transport
            .publish(&topic, QoS::AtLeastOnce, true, document.into_bytes())
            .await
        {
            warn!("Failed to publish discovery for {}: {}", entry.entry_id, e);
        }
    }

    /// Route one message from a switch set topic to its bridge.
    pub async fn handle_command(&self, msg: &MqttMessage) -> Result<(), BridgeError> {
        let Some(entry_id) = parse_set_topic(&msg.topic, &self.config.host.topic_prefix) else {
            warn!("Unexpected command topic: {}", msg.topic);
            return Ok(());
        };
        let Some(bridge) = self.registry.get(entry_id) else {
            warn!("Unknown switch in command topic: {}", entry_id);
            return Ok(());
        };
        match SwitchCommand::parse(&msg.payload) {
            Some(SwitchCommand::On) => bridge.turn_on().await,
            Some(SwitchCommand::Off) => bridge.turn_off().await,
            None => {
                warn!("Invalid switch command for {}: {}", entry_id, msg.payload);
                Ok(())
            }
        }
    }

    pub async fn publish_state(&self, refresh: &StateRefresh) -> Result<(), TransportError> {
        let topic = self.config.switch_state_topic(&refresh.entry_id);
        self.transport
            .publish(
                &topic,
                QoS::AtLeastOnce,
                true,
                state_payload(refresh.is_on).as_bytes().to_vec(),
            )
            .await
    }

    /// Unload every entry and stop listening for commands.
    pub async fn shutdown(&mut self) {
        for entry_id in self.registry.entry_ids() {
            if let Err(e) = self.registry.unload(&entry_id).await {
                warn!("Failed to unload {}: {}", entry_id, e);
            }
        }
        if let Some(id) = self.command_subscription.take() {
            if let Err(e) = self.transport.unsubscribe(id).await {
                warn!("Failed to unsubscribe from switch commands: {}", e);
            }
        }
    }
}
