//! Requests forwarded upstream that are still waiting for a response.
//!
//! Entries are keyed by the downstream request's message id, which is kept
//! unchanged on the upstream hop so retransmissions dedup at the far end.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use spindle_core::{Envelope, MessageId};

use crate::channel::ChannelId;

#[derive(Debug, Clone)]
pub struct PendingRelayEntry {
    /// Channel the request came in on; the response goes back here.
    pub downstream: ChannelId,
    /// Envelope as forwarded, relay path included.
    pub envelope: Envelope,
    /// Encoded frame, resent verbatim on retry.
    pub frame: Bytes,
    pub sent_at: Instant,
    pub retry_count: u32,
    order: u64,
}

impl PendingRelayEntry {
    pub fn new(downstream: ChannelId, envelope: Envelope, frame: Bytes, sent_at: Instant) -> Self {
        Self {
            downstream,
            envelope,
            frame,
            sent_at,
            retry_count: 0,
            order: 0,
        }
    }

    /// Total transmissions so far.
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }
}

/// What a sweep decided. Acted on after the lock is released.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Frames to send upstream again, oldest request first.
    pub resend: Vec<(MessageId, Bytes)>,
    /// Entries past the retry ceiling, already removed.
    pub expired: Vec<PendingRelayEntry>,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<MessageId, PendingRelayEntry>,
    next_order: u64,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a forwarded request. A repeat of the same id restarts its budget.
    pub fn insert(&mut self, mut entry: PendingRelayEntry) -> Option<PendingRelayEntry> {
        self.next_order += 1;
        entry.order = self.next_order;
        self.entries.insert(entry.envelope.message_id.clone(), entry)
    }

    /// Remove the entry a response correlates to.
    pub fn take(&mut self, id: &MessageId) -> Option<PendingRelayEntry> {
        self.entries.remove(id)
    }

    /// Entries older than `timeout` are either scheduled for resend
    /// (`retry_count += 1`, clock restarted) or, once `retry_count` has
    /// reached `max_retries`, removed and returned as expired.
    pub fn sweep(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        let mut expired_ids = Vec::new();
        let mut resend = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            if now.saturating_duration_since(entry.sent_at) < timeout {
                continue;
            }
            if entry.retry_count >= max_retries {
                expired_ids.push(id.clone());
            } else {
                entry.retry_count += 1;
                entry.sent_at = now;
                resend.push((entry.order, id.clone(), entry.frame.clone()));
            }
        }

        resend.sort_by_key(|(order, _, _)| *order);
        outcome.resend = resend.into_iter().map(|(_, id, frame)| (id, frame)).collect();

        for id in expired_ids {
            if let Some(entry) = self.entries.remove(&id) {
                outcome.expired.push(entry);
            }
        }
        outcome.expired.sort_by_key(|e| e.order);
        outcome
    }

    /// Drop every entry that would answer `downstream`. Returns how many.
    pub fn purge_downstream(&mut self, downstream: ChannelId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.downstream != downstream);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
