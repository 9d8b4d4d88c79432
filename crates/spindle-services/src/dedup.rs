//! Per-channel duplicate suppression.
//!
//! Remembers the last `capacity` incoming message ids and, once a handler
//! has answered one, the exact frame that was sent back. A repeat of an
//! answered id gets those bytes again without running the handler.
//! Eviction is oldest-first.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use spindle_core::MessageId;

/// What the cache knows about an incoming id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    /// First sighting. The id is now recorded.
    New,
    /// Seen before but no response was produced.
    Unanswered,
    /// Seen before; resend this frame.
    Answered(Bytes),
}

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    entries: HashMap<MessageId, Option<Bytes>>,
    order: VecDeque<MessageId>,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Check `id` and record it if new.
    pub fn observe(&mut self, id: &MessageId) -> Seen {
        match self.entries.get(id) {
            Some(Some(frame)) => return Seen::Answered(frame.clone()),
            Some(None) => return Seen::Unanswered,
            None => {}
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(id.clone(), None);
        self.order.push_back(id.clone());
        Seen::New
    }

    /// Attach the response frame sent for `id`. Ignored if `id` was evicted.
    pub fn record_response(&mut self, id: &MessageId, frame: Bytes) {
        if let Some(slot) = self.entries.get_mut(id) {
            *slot = Some(frame);
        }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_new_then_unanswered() {
        let mut cache = DedupCache::new(4);
        let id = MessageId::from("a");
        assert_eq!(cache.observe(&id), Seen::New);
        assert_eq!(cache.observe(&id), Seen::Unanswered);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn answered_ids_return_the_cached_frame() {
        let mut cache = DedupCache::new(4);
        let id = MessageId::from("a");
        cache.observe(&id);
        cache.record_response(&id, Bytes::from_static(b"\0\0\0\x02{}"));
        assert_eq!(
            cache.observe(&id),
            Seen::Answered(Bytes::from_static(b"\0\0\0\x02{}"))
        );
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let mut cache = DedupCache::new(2);
        let (a, b, c) = (MessageId::from("a"), MessageId::from("b"), MessageId::from("c"));
        cache.observe(&a);
        cache.observe(&b);
        cache.observe(&c);
        assert!(!cache.contains(&a));
        assert!(cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.observe(&a), Seen::New);
    }

    #[test]
    fn response_for_evicted_id_is_dropped() {
        let mut cache = DedupCache::new(1);
        let (a, b) = (MessageId::from("a"), MessageId::from("b"));
        cache.observe(&a);
        cache.observe(&b);
        cache.record_response(&a, Bytes::from_static(b"x"));
        assert!(!cache.contains(&a));
        assert_eq!(cache.len(), 1);
    }
}
