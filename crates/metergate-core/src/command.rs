//! Bus command decoding, validation and the response envelope.
//!
//! Command requests arrive as JSON with field presence varying by method;
//! they decode into a tagged union of per-method records at this boundary
//! so the dispatcher works with plain pattern matches. Validation failures
//! reject before anything touches the wire.

use metergate_proto::{
    obis::{self, ObisDescriptor},
    registers::{self, RegisterDescriptor},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;

/// Requested relay position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    /// Disconnect the load.
    Open,
    /// Reconnect the load.
    Close,
}

/// A register reference resolved against the descriptor tables.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterTarget {
    /// An R645 register descriptor.
    R645(&'static RegisterDescriptor),
    /// A COSEM register descriptor.
    Obis(&'static ObisDescriptor),
    /// A raw data identifier with no descriptor.
    RawDi(u32),
}

/// Per-method command parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    /// Read one register.
    ReadRegister {
        /// Resolved register reference.
        target: RegisterTarget,
    },
    /// Read the configured register set.
    ReadAll,
    /// Drive the supply relay.
    RelayControl {
        /// Requested position.
        state: RelayState,
    },
    /// Read relay output and control state (DLMS only).
    ReadRelayState,
    /// Report the stored meter identity.
    ReadAddress,
    /// Broadcast the gateway clock on the meter's line (R645 only,
    /// fire-and-forget).
    BroadcastTime,
}

/// A validated command request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    /// Requester-chosen correlation id, echoed in the response.
    pub id: String,
    /// Decoded parameters.
    pub kind: CommandKind,
}

#[derive(Debug, Deserialize)]
struct RawRequest {
    id: Option<String>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// Decode and validate a command request payload.
pub fn parse_request(payload: &[u8]) -> Result<CommandRequest, CommandError> {
    let raw: RawRequest = serde_json::from_slice(payload)
        .map_err(|e| CommandError::Invalid(format!("malformed JSON: {e}")))?;

    let id = match raw.id {
        Some(id) if !id.is_empty() => id,
        _ => return Err(CommandError::Invalid("missing command id".to_string())),
    };

    let Some(method) = raw.method.as_deref() else {
        return Err(CommandError::Invalid("missing method".to_string()));
    };

    let kind = match method {
        "read_register" => CommandKind::ReadRegister { target: resolve_register(&raw.params)? },
        "read_all" => CommandKind::ReadAll,
        "relay_control" => {
            let state = raw
                .params
                .get("state")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CommandError::Invalid("relay_control requires params.state".to_string())
                })?;
            let state = match state {
                "open" => RelayState::Open,
                "close" => RelayState::Close,
                other => {
                    return Err(CommandError::Invalid(format!(
                        "unknown relay state {other:?} (expected \"open\" or \"close\")"
                    )));
                },
            };
            CommandKind::RelayControl { state }
        },
        "read_relay_state" => CommandKind::ReadRelayState,
        "read_address" => CommandKind::ReadAddress,
        "broadcast_time" => CommandKind::BroadcastTime,
        other => return Err(CommandError::Invalid(format!("unknown method {other:?}"))),
    };

    Ok(CommandRequest { id, kind })
}

/// Resolve `params.register` (by name, case-insensitive, against both
/// descriptor tables) or `params.dataId` (number or hex string).
fn resolve_register(params: &Value) -> Result<RegisterTarget, CommandError> {
    if let Some(name) = params.get("register").and_then(Value::as_str) {
        if let Some(descriptor) = registers::by_key(name) {
            return Ok(RegisterTarget::R645(descriptor));
        }
        if let Some(descriptor) = obis::by_key(name) {
            return Ok(RegisterTarget::Obis(descriptor));
        }
        return Err(CommandError::Invalid(format!("unknown register {name:?}")));
    }

    if let Some(data_id) = params.get("dataId") {
        let di = match data_id {
            Value::Number(n) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| CommandError::Invalid("dataId out of range".to_string()))?,
            Value::String(s) => {
                let trimmed = s.trim_start_matches("0x").trim_start_matches("0X");
                u32::from_str_radix(trimmed, 16)
                    .map_err(|_| CommandError::Invalid(format!("bad dataId {s:?}")))?
            },
            _ => return Err(CommandError::Invalid("dataId must be number or string".to_string())),
        };
        return Ok(match registers::by_di(di) {
            Some(descriptor) => RegisterTarget::R645(descriptor),
            None => RegisterTarget::RawDi(di),
        });
    }

    Err(CommandError::Invalid("read_register requires params.register or params.dataId".to_string()))
}

/// Uniform response envelope published on the command response topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    /// Echoed request id.
    pub id: String,
    /// Whether the command succeeded.
    pub success: bool,
    /// Command result, present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description, present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp in milliseconds.
    pub ts: u64,
}

impl CommandResponse {
    /// Successful response.
    pub fn ok(id: impl Into<String>, result: Value, ts: u64) -> Self {
        Self { id: id.into(), success: true, result: Some(result), error: None, ts }
    }

    /// Failed response.
    pub fn fail(id: impl Into<String>, error: &CommandError, ts: u64) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            ts,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn parse(value: Value) -> Result<CommandRequest, CommandError> {
        parse_request(value.to_string().as_bytes())
    }

    #[test]
    fn read_register_by_name() {
        let request = parse(json!({
            "id": "cmd-1",
            "method": "read_register",
            "params": {"register": "voltage_a"}
        }))
        .unwrap();
        assert_eq!(request.id, "cmd-1");
        let CommandKind::ReadRegister { target: RegisterTarget::R645(descriptor) } = request.kind
        else {
            panic!("expected R645 target");
        };
        assert_eq!(descriptor.di, 0x0201_0100);
    }

    #[test]
    fn read_register_by_obis_name() {
        let request = parse(json!({
            "id": "cmd-2",
            "method": "read_register",
            "params": {"register": "ACTIVE_ENERGY_IMPORT"}
        }))
        .unwrap();
        assert!(matches!(
            request.kind,
            CommandKind::ReadRegister { target: RegisterTarget::Obis(_) }
        ));
    }

    #[test]
    fn read_register_by_data_id() {
        let request = parse(json!({
            "id": "cmd-3",
            "method": "read_register",
            "params": {"dataId": "0x02010100"}
        }))
        .unwrap();
        assert!(matches!(
            request.kind,
            CommandKind::ReadRegister { target: RegisterTarget::R645(d) } if d.di == 0x0201_0100
        ));

        let request = parse(json!({
            "id": "cmd-4",
            "method": "read_register",
            "params": {"dataId": 0x0999_0001u32}
        }))
        .unwrap();
        assert!(matches!(
            request.kind,
            CommandKind::ReadRegister { target: RegisterTarget::RawDi(0x0999_0001) }
        ));
    }

    #[test]
    fn missing_id_rejected() {
        let err = parse(json!({"method": "read_all"})).unwrap_err();
        assert!(err.to_string().contains("id"));
        let err = parse(json!({"id": "", "method": "read_all"})).unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn unknown_method_rejected() {
        let err = parse(json!({"id": "x", "method": "explode"})).unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }

    #[test]
    fn relay_control_needs_state() {
        let err = parse(json!({"id": "x", "method": "relay_control"})).unwrap_err();
        assert!(err.to_string().contains("state"));

        let request = parse(json!({
            "id": "x",
            "method": "relay_control",
            "params": {"state": "open"}
        }))
        .unwrap();
        assert_eq!(request.kind, CommandKind::RelayControl { state: RelayState::Open });

        let err = parse(json!({
            "id": "x",
            "method": "relay_control",
            "params": {"state": "sideways"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("sideways"));
    }

    #[test]
    fn read_register_needs_target() {
        let err = parse(json!({"id": "x", "method": "read_register"})).unwrap_err();
        assert!(err.to_string().contains("register"));

        let err = parse(json!({
            "id": "x",
            "method": "read_register",
            "params": {"register": "NOT_A_REGISTER"}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown register"));
    }

    #[test]
    fn broadcast_time_method() {
        let request = parse(json!({"id": "t-1", "method": "broadcast_time"})).unwrap();
        assert_eq!(request.kind, CommandKind::BroadcastTime);
    }

    #[test]
    fn response_envelope_shapes() {
        let ok = CommandResponse::ok("cmd-1", json!({"value": 220.5}), 1000);
        let encoded = serde_json::to_value(&ok).unwrap();
        assert_eq!(encoded["id"], "cmd-1");
        assert_eq!(encoded["success"], true);
        assert_eq!(encoded["result"]["value"], 220.5);
        assert!(encoded.get("error").is_none());

        let fail =
            CommandResponse::fail("cmd-2", &CommandError::AssociationTimeout, 1000);
        let encoded = serde_json::to_value(&fail).unwrap();
        assert_eq!(encoded["success"], false);
        assert!(encoded["error"].as_str().unwrap().contains("association"));
        assert!(encoded.get("result").is_none());
    }
}
