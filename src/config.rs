use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::gardena::DeviceAddress;
use crate::gardena::bridge::CommandSettings;
use crate::gardena::message::DEFAULT_RUN_SECONDS;

/// Response client id the GARDENA gateway app uses for its own commands.
const DEFAULT_RESPONSE_ID: &str = "bs-da-1013015b-6d69-412a-8cc0-8bf0fc12bb27";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub gardena: GardenaConfig,
    pub host: HostConfig,
    pub entries: Vec<EntryConfig>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct GardenaConfig {
    pub tenant: String,
    pub response_client_id: String,
    pub session_id: Option<String>,
    pub run_seconds: u32,
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub discovery: bool,
}

/// One switch entry: a single actuator behind a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryConfig {
    /// Sanitized name for use in MQTT topics (lowercase, spaces to underscores)
    pub entry_id: String,
    pub name: String,
    pub gateway_id: String,
    pub device_id: String,
    pub actuator_index: u32,
}

#[derive(Deserialize)]
struct RawEntry {
    #[serde(default)]
    name: Option<String>,
    gateway_id: String,
    device_id: String,
    #[serde(default)]
    actuator_index: u32,
}

fn env_required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVar(key))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let actuators_file = env_or_default("ACTUATORS_FILE", "actuators.json".to_string());
        let entries = load_entries(&actuators_file)?;

        let config = Self {
            mqtt: MqttConfig {
                broker_host: env_required("MQTT_BROKER_HOST")?,
                broker_port: env_or_default("MQTT_BROKER_PORT", 1883),
                username: env_optional("MQTT_USERNAME"),
                password: env_optional("MQTT_PASSWORD"),
                client_id: env_or_default("MQTT_CLIENT_ID", "gardena-smart-mqtt".to_string()),
            },
            gardena: GardenaConfig {
                tenant: env_or_default("GARDENA_TENANT", "hass".to_string()),
                response_client_id: env_or_default(
                    "GARDENA_RESPONSE_ID",
                    DEFAULT_RESPONSE_ID.to_string(),
                ),
                session_id: env_optional("GARDENA_SESSION_ID"),
                run_seconds: env_or_default("GARDENA_RUN_SECONDS", DEFAULT_RUN_SECONDS),
                call_timeout_secs: env_or_default("BRIDGE_CALL_TIMEOUT_SECS", 10),
            },
            host: HostConfig {
                topic_prefix: env_or_default("BRIDGE_TOPIC_PREFIX", "gardena".to_string()),
                discovery_prefix: env_or_default(
                    "HA_DISCOVERY_PREFIX",
                    "homeassistant".to_string(),
                ),
                discovery: env_or_default("HA_DISCOVERY", true),
            },
            entries,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_host.is_empty() {
            return Err(invalid("MQTT_BROKER_HOST must not be empty"));
        }
        if self.gardena.tenant.is_empty() {
            return Err(invalid("GARDENA_TENANT must not be empty"));
        }
        if self.gardena.run_seconds == 0 {
            return Err(invalid("GARDENA_RUN_SECONDS must be > 0"));
        }
        if self.gardena.call_timeout_secs == 0 {
            return Err(invalid("BRIDGE_CALL_TIMEOUT_SECS must be > 0"));
        }
        if self.entries.is_empty() {
            return Err(invalid("No actuators found in actuators file"));
        }

        let mut seen = HashSet::new();
        for entry in &self.entries {
            if !seen.insert(entry.entry_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate actuator name '{}'",
                    entry.entry_id
                )));
            }
        }
        Ok(())
    }

    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge_status", self.host.topic_prefix)
    }

    /// Filter covering the set topic of every entry.
    pub fn switch_command_filter(&self) -> String {
        format!("{}/+/set", self.host.topic_prefix)
    }

    pub fn switch_command_topic(&self, entry_id: &str) -> String {
        format!("{}/{}/set", self.host.topic_prefix, entry_id)
    }

    pub fn switch_state_topic(&self, entry_id: &str) -> String {
        format!("{}/{}/state", self.host.topic_prefix, entry_id)
    }

    pub fn discovery_topic(&self, entry_id: &str) -> String {
        format!("{}/switch/{}/config", self.host.discovery_prefix, entry_id)
    }

    pub fn device_address(&self, entry: &EntryConfig) -> DeviceAddress {
        DeviceAddress::new(
            &self.gardena.tenant,
            &entry.gateway_id,
            &entry.device_id,
            entry.actuator_index,
        )
    }

    pub fn command_settings(&self) -> CommandSettings {
        CommandSettings {
            response_client_id: self.gardena.response_client_id.clone(),
            session_id: self.gardena.session_id.clone(),
            run_seconds: self.gardena.run_seconds,
            call_timeout: Duration::from_secs(self.gardena.call_timeout_secs),
        }
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}

fn load_entries(path: &str) -> Result<Vec<EntryConfig>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    parse_entries(&content).map_err(|e| match e {
        ConfigError::Parse { source, .. } => ConfigError::Parse {
            path: path.to_string(),
            source,
        },
        other => other,
    })
}

fn parse_entries(content: &str) -> Result<Vec<EntryConfig>, ConfigError> {
    let raw_entries: Vec<RawEntry> =
        serde_json::from_str(content).map_err(|source| ConfigError::Parse {
            path: String::new(),
            source,
        })?;

    raw_entries
        .into_iter()
        .map(|raw| {
            if raw.gateway_id.trim().is_empty() {
                return Err(invalid("Actuator with empty 'gateway_id'"));
            }
            if raw.device_id.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Actuator on gateway {} has an empty 'device_id'",
                    raw.gateway_id
                )));
            }

            // Same default title as the gateway setup step: the gateway id.
            let name = raw
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| match raw.actuator_index {
                    0 => raw.gateway_id.clone(),
                    index => format!("{} {}", raw.gateway_id, index),
                });
            let entry_id = sanitize_topic_name(&name);
            if entry_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "Actuator name '{name}' has no usable characters"
                )));
            }

            Ok(EntryConfig {
                entry_id,
                name,
                gateway_id: raw.gateway_id,
                device_id: raw.device_id,
                actuator_index: raw.actuator_index,
            })
        })
        .collect()
}

/// Convert an entry name into a safe MQTT topic segment.
/// "Front Lawn" → "front_lawn"
fn sanitize_topic_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}
