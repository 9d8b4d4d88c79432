//! Work items and the payloads exchanged while dispensing them.
//!
//! Payload structs here are the `payload` field of an [`Envelope`] for the
//! matching [`MessageKind`]. Field names are snake_case on the wire.
//!
//! [`Envelope`]: crate::envelope::Envelope
//! [`MessageKind`]: crate::envelope::MessageKind

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque experiment parameters, name to scalar.
pub type Parameters = Map<String, Value>;

/// Assignee recorded for items pre-completed by a resume offset.
pub const PRE_COMPLETED: &str = "PRE";

/// Body returned to HTTP callers once every item has been dispensed.
pub const END_OF_WORK_MESSAGE: &str = "No more data left.";

// ── Items ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub parameters: Parameters,
}

impl WorkItem {
    pub fn new(id: u64, parameters: Parameters) -> Self {
        Self { id, parameters }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Unassigned,
    Assigned,
    Completed,
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => write!(f, "unassigned"),
            Self::Assigned => write!(f, "assigned"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

// ── Dispatch payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub node: String,
}

/// `request_item` payload. `prior_id` is the item this worker was last
/// given, if it never reported it complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRequest {
    pub worker: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_id: Option<u64>,
}

/// `assignment` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Assignment {
    Item { item: WorkItem },
    EndOfWork,
}

impl Assignment {
    pub fn item(&self) -> Option<&WorkItem> {
        match self {
            Self::Item { item } => Some(item),
            Self::EndOfWork => None,
        }
    }

    pub fn is_end_of_work(&self) -> bool {
        matches!(self, Self::EndOfWork)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub id: u64,
    pub worker: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionAck {
    pub id: u64,
    pub already_completed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRequest {
    pub target: ResetTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetAck {
    /// Ids actually returned to the reissue stack.
    pub reset: Vec<u64>,
}

/// `worker_joined` / `worker_left` payload sent by a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPresence {
    pub worker: String,
    pub relay: String,
}

/// `relay_failure` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayFailure {
    pub reason: String,
    pub attempts: u32,
}

/// `error` payload produced when a handler fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub error: String,
    pub status: String,
}

impl ErrorReply {
    pub fn handler_failure(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            status: "handler_exception".into(),
        }
    }
}

// ── Status ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub total: usize,
    pub unassigned: usize,
    pub assigned: usize,
    pub completed: usize,
    pub pending_reissue: usize,
    pub exhausted_requests: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCensus {
    pub relay: String,
    pub workers: Vec<String>,
}

/// `status_report` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node: String,
    /// Workers connected directly to `node`.
    pub workers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<QueueSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relays: Vec<RelayCensus>,
}

// ── Reset targets ─────────────────────────────────────────────────────────────

/// Administrative reset target: `"3"` or the inclusive range `"2:5"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetTarget {
    Single(u64),
    Range { start: u64, end: u64 },
}

impl ResetTarget {
    pub fn bounds(&self) -> (u64, u64) {
        match *self {
            Self::Single(id) => (id, id),
            Self::Range { start, end } => (start, end),
        }
    }
}

impl FromStr for ResetTarget {
    type Err = ParseTargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|_| ParseTargetError(s.to_string()))
        };
        match s.split_once(':') {
            Some((start, end)) => Ok(Self::Range {
                start: parse(start)?,
                end: parse(end)?,
            }),
            None => Ok(Self::Single(parse(s)?)),
        }
    }
}

impl fmt::Display for ResetTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single(id) => write!(f, "{id}"),
            Self::Range { start, end } => write!(f, "{start}:{end}"),
        }
    }
}

impl Serialize for ResetTarget {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResetTarget {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid reset target {0:?}, expected N or START:END")]
pub struct ParseTargetError(pub String);

/// Parse a prior-id header. Empty, `-1` and non-numeric values mean none.
pub fn parse_prior_id(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

// ── Loading ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ItemLoadError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, serde_json::Error),
    #[error("item list must be a JSON array")]
    NotAnArray,
    #[error("item {0} is not a JSON object")]
    NotAnObject(usize),
    #[error("item {0} has an invalid id")]
    InvalidId(usize),
    #[error("duplicate item id {0}")]
    DuplicateId(u64),
}

/// Read a JSON array of parameter objects from `path`.
pub fn load_items(path: &Path) -> Result<Vec<WorkItem>, ItemLoadError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ItemLoadError::ReadFailed(path.to_path_buf(), e))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| ItemLoadError::ParseFailed(path.to_path_buf(), e))?;
    items_from_json(value)
}

/// Build items from an already-parsed array.
///
/// A numeric `id` field is taken as the item id and removed from the
/// parameters; otherwise ids run 1.. in array order.
pub fn items_from_json(value: Value) -> Result<Vec<WorkItem>, ItemLoadError> {
    let Value::Array(entries) = value else {
        return Err(ItemLoadError::NotAnArray);
    };

    let mut seen = HashSet::with_capacity(entries.len());
    let mut items = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let Value::Object(mut parameters) = entry else {
            return Err(ItemLoadError::NotAnObject(index));
        };
        let id = match parameters.remove("id") {
            Some(Value::Number(n)) => match n.as_u64() {
                Some(id) if id > 0 => id,
                _ => return Err(ItemLoadError::InvalidId(index)),
            },
            Some(_) => return Err(ItemLoadError::InvalidId(index)),
            None => index as u64 + 1,
        };
        if !seen.insert(id) {
            return Err(ItemLoadError::DuplicateId(id));
        }
        items.push(WorkItem::new(id, parameters));
    }
    Ok(items)
}
