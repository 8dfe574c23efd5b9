use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Channel addressed by the gateway's actuator-setting instruction.
pub const ACTUATOR_CHANNEL: u32 = 16;
/// Run duration in seconds sent with an "on" command unless configured otherwise.
pub const DEFAULT_RUN_SECONDS: u32 = 60;

/// Result of reducing one inbound state message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateUpdate {
    /// Delta for a single actuator (`entity.path == "actuator/<n>"`).
    Direct { is_on: bool },
    /// Full device snapshot (`entity.path == ""`).
    Snapshot { is_on: bool },
    Unrecognized,
}

impl StateUpdate {
    pub fn is_on(self) -> Option<bool> {
        match self {
            StateUpdate::Direct { is_on } | StateUpdate::Snapshot { is_on } => Some(is_on),
            StateUpdate::Unrecognized => None,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    op: String,
    entity: EntityRef,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
struct EntityRef {
    path: String,
}

/// Reduce a raw state payload for the given actuator index.
///
/// Only malformed JSON is an error; any valid JSON that does not match one of
/// the two update shapes yields [`StateUpdate::Unrecognized`].
///
/// Both shapes are keyed by `actuator_index`: the direct shape matches entity
/// path `actuator/{index}` and the snapshot shape reads `actuator["{index}"]`.
/// At the default index 0 these are the literal `actuator/0` and
/// `actuator["0"]` the gateway sends.
pub fn parse_state_update(
    payload: &[u8],
    actuator_index: u32,
) -> Result<StateUpdate, serde_json::Error> {
    let value: Value = serde_json::from_slice(payload)?;

    let Ok(envelope) = Envelope::deserialize(&value) else {
        return Ok(StateUpdate::Unrecognized);
    };
    if envelope.op != "update" {
        return Ok(StateUpdate::Unrecognized);
    }

    let update = if envelope.entity.path == format!("actuator/{actuator_index}") {
        envelope
            .payload
            .pointer("/state/vi")
            .map(|vi| StateUpdate::Direct { is_on: truthy(vi) })
    } else if envelope.entity.path.is_empty() {
        // Keyed map only; a JSON pointer would also index into an array.
        envelope
            .payload
            .get("actuator")
            .and_then(Value::as_object)
            .and_then(|actuators| actuators.get(&actuator_index.to_string()))
            .and_then(|actuator| actuator.pointer("/state/vi"))
            .map(|vi| StateUpdate::Snapshot { is_on: truthy(vi) })
    } else {
        None
    };

    Ok(update.unwrap_or(StateUpdate::Unrecognized))
}

/// Gateway firmware is loose about the type of `vi`.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorCommand {
    Start { seconds: u32 },
    Stop,
}

impl ActuatorCommand {
    fn value(self) -> u32 {
        match self {
            ActuatorCommand::Start { seconds } => seconds,
            ActuatorCommand::Stop => 0,
        }
    }

    /// `0='<channel>',1='<value>'`
    pub fn instruction(self) -> String {
        format!("0='{ACTUATOR_CHANNEL}',1='{}'", self.value())
    }
}

/// Outbound command, serialized with keys in gateway order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMessage {
    #[serde(rename = "session-id")]
    pub session_id: String,
    #[serde(rename = "res-topic")]
    pub res_topic: String,
    pub payload: CommandPayload,
    pub metadata: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandPayload {
    #[serde(rename = "as")]
    pub actuator_settings: Vec<String>,
}

impl CommandMessage {
    pub fn new(command: ActuatorCommand, session_id: String, res_topic: String) -> Self {
        Self {
            session_id,
            res_topic,
            payload: CommandPayload {
                actuator_settings: vec![command.instruction()],
            },
            metadata: serde_json::Map::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(payload: &str) -> StateUpdate {
        parse_state_update(payload.as_bytes(), 0).expect("valid json")
    }

    #[test]
    fn direct_update_reads_state_vi() {
        assert_eq!(
            parse(r#"{"op":"update","entity":{"path":"actuator/0"},"payload":{"state":{"vi":true}}}"#),
            StateUpdate::Direct { is_on: true }
        );
        assert_eq!(
            parse(r#"{"op":"update","entity":{"path":"actuator/0"},"payload":{"state":{"vi":false}}}"#),
            StateUpdate::Direct { is_on: false }
        );
    }

    #[test]
    fn snapshot_update_reads_nested_actuator() {
        assert_eq!(
            parse(
                r#"{"op":"update","entity":{"path":""},"payload":{"actuator":{"0":{"state":{"vi":true}}}}}"#
            ),
            StateUpdate::Snapshot { is_on: true }
        );
        assert_eq!(
            parse(
                r#"{"op":"update","entity":{"path":""},"payload":{"actuator":{"0":{"state":{"vi":false}}}}}"#
            ),
            StateUpdate::Snapshot { is_on: false }
        );
    }

    #[test]
    fn vi_uses_truthiness() {
        let direct = |vi: &str| {
            parse(&format!(
                r#"{{"op":"update","entity":{{"path":"actuator/0"}},"payload":{{"state":{{"vi":{vi}}}}}}}"#
            ))
        };
        assert_eq!(direct("1").is_on(), Some(true));
        assert_eq!(direct("0").is_on(), Some(false));
        assert_eq!(direct(r#""on""#).is_on(), Some(true));
        assert_eq!(direct(r#""""#).is_on(), Some(false));
        assert_eq!(direct("null").is_on(), Some(false));
    }

    #[test]
    fn other_shapes_are_unrecognized() {
        for payload in [
            r#"{"op":"delete","entity":{"path":"actuator/0"},"payload":{"state":{"vi":true}}}"#,
            r#"{"op":"update","entity":{"path":"actuator/1"},"payload":{"state":{"vi":true}}}"#,
            r#"{"op":"update","entity":{"path":"actuator/0"},"payload":{"state":{}}}"#,
            r#"{"op":"update","entity":{"path":""},"payload":{"sensor":{}}}"#,
            r#"{"op":"update","entity":{"path":""},"payload":{"actuator":{"1":{"state":{"vi":true}}}}}"#,
            r#"{"op":"update","entity":{"path":""},"payload":{"actuator":[{"state":{"vi":true}}]}}"#,
            r#"{"op":"update","entity":{"path":""},"payload":{"actuator":"0"}}"#,
            r#"{"op":"update","payload":{"state":{"vi":true}}}"#,
            r#"{"session-id":"x","payload":{"as":[]}}"#,
            r#"[1,2,3]"#,
            r#"42"#,
        ] {
            assert_eq!(parse(payload), StateUpdate::Unrecognized, "{payload}");
        }
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_state_update(b"not json", 0).is_err());
        assert!(parse_state_update(b"", 0).is_err());
        assert!(parse_state_update(b"{\"op\":", 0).is_err());
    }

    #[test]
    fn actuator_index_selects_path() {
        let direct =
            br#"{"op":"update","entity":{"path":"actuator/2"},"payload":{"state":{"vi":true}}}"#;
        assert_eq!(
            parse_state_update(direct, 2).unwrap(),
            StateUpdate::Direct { is_on: true }
        );
        assert_eq!(
            parse_state_update(direct, 0).unwrap(),
            StateUpdate::Unrecognized
        );
    }

    #[test]
    fn command_serializes_in_gateway_order() {
        let message = CommandMessage::new(
            ActuatorCommand::Start {
                seconds: DEFAULT_RUN_SECONDS,
            },
            "991b1782-0fa0-459c-808b-ca89164ad152".to_string(),
            "hass/exc-res/bs-da-1/991b1782-0fa0-459c-808b-ca89164ad152".to_string(),
        );
        let json = String::from_utf8(message.to_bytes().unwrap()).unwrap();
        assert_eq!(
            json,
            r#"{"session-id":"991b1782-0fa0-459c-808b-ca89164ad152","res-topic":"hass/exc-res/bs-da-1/991b1782-0fa0-459c-808b-ca89164ad152","payload":{"as":["0='16',1='60'"]},"metadata":{}}"#
        );
    }

    #[test]
    fn stop_instruction_sends_zero() {
        assert_eq!(ActuatorCommand::Stop.instruction(), "0='16',1='0'");
        assert_eq!(
            ActuatorCommand::Start { seconds: 300 }.instruction(),
            "0='16',1='300'"
        );
    }
}
