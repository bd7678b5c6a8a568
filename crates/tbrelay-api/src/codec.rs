//! Wire messages for the ThingsBoard telemetry WebSocket.
//!
//! Outbound, the session sends two JSON frames after connecting: an auth
//! frame (`{"authCmd": {...}}`) and a command frame (`{"cmds": [...]}`).
//! Inbound, frames carrying a `subscriptionId` are telemetry pushes; anything
//! else (acks, notices) is [`Decoded::Ignored`].
//!
//! Everything in this module is pure: no I/O, no state.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Default key under `data` holding the telemetry series.
pub const DEFAULT_TELEMETRY_KEY: &str = "temperature";

/// Default device label attached to decoded readings.
pub const DEFAULT_DEVICE_LABEL: &str = "ThingsBoard";

// ── Reading ──────────────────────────────────────────────────────────

/// One decoded telemetry sample, as pushed to downstream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Epoch milliseconds reported by the platform.
    pub timestamp: i64,
    pub value: f64,
    pub device: String,
}

// ── Outbound commands ────────────────────────────────────────────────

/// Authentication command carrying the platform JWT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCommand {
    pub cmd_id: u32,
    pub token: String,
}

impl AuthCommand {
    /// Wrap into the `{"authCmd": ...}` frame sent on the wire.
    pub fn into_frame(self) -> AuthFrame {
        AuthFrame { auth_cmd: self }
    }
}

/// `{"authCmd": {"cmdId": .., "token": ..}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFrame {
    pub auth_cmd: AuthCommand,
}

/// Time-series subscription for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySubscribeCommand {
    pub entity_type: String,
    pub entity_id: String,
    pub scope: String,
    pub cmd_id: u32,
    #[serde(rename = "type")]
    pub kind: String,
}

/// `{"cmds": [...]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandEnvelope {
    pub cmds: Vec<TelemetrySubscribeCommand>,
}

/// Overrides for the subscription shape. The defaults reproduce what the
/// platform expects for a device's latest telemetry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub entity_type: String,
    pub scope: String,
    pub cmd_id: u32,
    pub kind: String,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            entity_type: "DEVICE".into(),
            scope: "LATEST_TELEMETRY".into(),
            cmd_id: 10,
            kind: "TIMESERIES".into(),
        }
    }
}

pub fn build_auth_command(token: &str, cmd_id: u32) -> AuthCommand {
    AuthCommand {
        cmd_id,
        token: token.to_owned(),
    }
}

/// Build a subscribe command with the default shape.
pub fn build_subscribe_command(entity_id: &str) -> TelemetrySubscribeCommand {
    build_subscribe_command_with(entity_id, &SubscribeOptions::default())
}

pub fn build_subscribe_command_with(
    entity_id: &str,
    options: &SubscribeOptions,
) -> TelemetrySubscribeCommand {
    TelemetrySubscribeCommand {
        entity_type: options.entity_type.clone(),
        entity_id: entity_id.to_owned(),
        scope: options.scope.clone(),
        cmd_id: options.cmd_id,
        kind: options.kind.clone(),
    }
}

/// Wrap commands into a single envelope. Order is preserved, duplicates kept.
pub fn wrap_commands(commands: Vec<TelemetrySubscribeCommand>) -> CommandEnvelope {
    CommandEnvelope { cmds: commands }
}

// ── Inbound decoding ─────────────────────────────────────────────────

/// Outcome of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Reading(Reading),
    /// Not a telemetry push (`subscriptionId` absent or unset), e.g. a
    /// subscription ack.
    Ignored,
}

/// Decodes telemetry pushes for one series key and device label.
#[derive(Debug, Clone)]
pub struct TelemetryDecoder {
    key: String,
    device: String,
}

impl Default for TelemetryDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_KEY, DEFAULT_DEVICE_LABEL)
    }
}

impl TelemetryDecoder {
    pub fn new(key: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            device: device.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Decode a raw inbound frame.
    ///
    /// The first `[timestamp, value]` pair of `data.<key>` is the latest
    /// reading. The value may arrive as a number or a numeric string.
    pub fn decode(&self, raw: &[u8]) -> Result<Decoded, Error> {
        let frame: Value = serde_json::from_slice(raw).map_err(|e| Error::MalformedPayload {
            message: format!("invalid JSON: {e}"),
        })?;

        if frame.get("subscriptionId").is_none_or(is_unset_id) {
            return Ok(Decoded::Ignored);
        }

        let series = frame
            .get("data")
            .and_then(|data| data.get(&self.key))
            .and_then(Value::as_array)
            .ok_or_else(|| malformed(format!("missing data.{} array", self.key)))?;

        let point = series
            .first()
            .and_then(Value::as_array)
            .ok_or_else(|| malformed(format!("data.{} has no [timestamp, value] pair", self.key)))?;

        let (Some(ts), Some(raw_value)) = (point.first(), point.get(1)) else {
            return Err(malformed(format!("data.{} pair is incomplete", self.key)));
        };

        let timestamp = ts
            .as_i64()
            .ok_or_else(|| malformed(format!("timestamp is not an integer: {ts}")))?;
        let value = numeric(raw_value)
            .ok_or_else(|| malformed(format!("value is not numeric: {raw_value}")))?;

        Ok(Decoded::Reading(Reading {
            timestamp,
            value,
            device: self.device.clone(),
        }))
    }
}

/// Decode with the default key and device label.
pub fn decode_telemetry_push(raw: &[u8]) -> Result<Decoded, Error> {
    TelemetryDecoder::default().decode(raw)
}

/// Telemetry pushes carry a non-zero id. `0`, `""`, `false` and `null`
/// mark a frame that is not one.
fn is_unset_id(id: &Value) -> bool {
    match id {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.abs() < f64::EPSILON),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn malformed(message: String) -> Error {
    Error::MalformedPayload { message }
}

// ── Tests ────────────────────────────────────────────────────────────
