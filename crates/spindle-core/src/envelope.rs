//! Message envelope carried in every spindle frame.
//!
//! JSON shape:
//!
//!   { "messageId": "…", "type": "request_item", "payload": {…},
//!     "correlatesTo": "…", "relayPath": ["relay-a"] }
//!
//! `payload`, `correlatesTo` and `relayPath` are omitted when empty. A
//! response always carries a fresh `messageId` and names the request it
//! answers in `correlatesTo`.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::wire::WireError;

// ── Message ids ───────────────────────────────────────────────────────────────

/// Opaque message identifier. Generated ids are 16 random bytes, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(hex::encode(rand::random::<[u8; 16]>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ── Message kinds ─────────────────────────────────────────────────────────────

/// The `type` field of an envelope.
///
/// Unknown strings are preserved in [`MessageKind::Other`] so a relay can
/// forward message types it does not itself understand.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Heartbeat,
    Register,
    RegisterAck,
    RequestItem,
    Assignment,
    ReportComplete,
    CompleteAck,
    ForceReset,
    ResetAck,
    ReportStatus,
    StatusReport,
    WorkerJoined,
    WorkerLeft,
    Shutdown,
    RelayFailure,
    Error,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Register => "register",
            Self::RegisterAck => "register_ack",
            Self::RequestItem => "request_item",
            Self::Assignment => "assignment",
            Self::ReportComplete => "report_complete",
            Self::CompleteAck => "complete_ack",
            Self::ForceReset => "force_reset",
            Self::ResetAck => "reset_ack",
            Self::ReportStatus => "report_status",
            Self::StatusReport => "status_report",
            Self::WorkerJoined => "worker_joined",
            Self::WorkerLeft => "worker_left",
            Self::Shutdown => "shutdown",
            Self::RelayFailure => "relay_failure",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "heartbeat" => Self::Heartbeat,
            "register" => Self::Register,
            "register_ack" => Self::RegisterAck,
            "request_item" => Self::RequestItem,
            "assignment" => Self::Assignment,
            "report_complete" => Self::ReportComplete,
            "complete_ack" => Self::CompleteAck,
            "force_reset" => Self::ForceReset,
            "reset_ack" => Self::ResetAck,
            "report_status" => Self::ReportStatus,
            "status_report" => Self::StatusReport,
            "worker_joined" => Self::WorkerJoined,
            "worker_left" => Self::WorkerLeft,
            "shutdown" => Self::Shutdown,
            "relay_failure" => Self::RelayFailure,
            "error" => Self::Error,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlates_to: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relay_path: Vec<String>,
}

impl Envelope {
    /// New envelope with a freshly generated id.
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self::with_id(MessageId::generate(), kind, payload)
    }

    pub fn with_id(message_id: MessageId, kind: MessageKind, payload: Value) -> Self {
        Self {
            message_id,
            kind,
            payload,
            correlates_to: None,
            relay_path: Vec::new(),
        }
    }

    /// Response to `request`: fresh id, `correlatesTo` set to the request's id.
    pub fn reply_to(request: &Envelope, kind: MessageKind, payload: Value) -> Self {
        Self {
            correlates_to: Some(request.message_id.clone()),
            ..Self::new(kind, payload)
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(MessageKind::Heartbeat, Value::Null)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind == MessageKind::Heartbeat
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            WireError::Malformed(format!("{} payload: {e}", self.kind))
        })
    }
}
