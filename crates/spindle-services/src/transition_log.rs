//! Append-only record of item state transitions.
//!
//! Sequence numbers start at 1 and increase by one per entry, so a reader
//! can poll with the last `seq` it saw and get only newer entries.

use serde::{Deserialize, Serialize};

use crate::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Running,
    Finished,
    Reset,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub seq: u64,
    pub item_id: u64,
    pub kind: TransitionKind,
    /// Who the item went to, or who finished it. Empty for resets.
    pub worker: String,
    pub at_ms: u64,
}

#[derive(Debug, Default)]
pub struct TransitionLog {
    entries: Vec<Transition>,
}

impl TransitionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry and return its sequence number.
    pub fn record(&mut self, item_id: u64, kind: TransitionKind, worker: &str) -> u64 {
        let seq = self.entries.len() as u64 + 1;
        self.entries.push(Transition {
            seq,
            item_id,
            kind,
            worker: worker.to_string(),
            at_ms: now_ms(),
        });
        seq
    }

    /// Entries with `seq` greater than `after`; all of them for `None`.
    pub fn since(&self, after: Option<u64>) -> &[Transition] {
        let start = after.map_or(0, |seq| (seq as usize).min(self.entries.len()));
        &self.entries[start..]
    }

    pub fn last_seq(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
