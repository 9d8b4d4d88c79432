//! Task dispatch queue: hands out work items, one assignee at a time.
//!
//! Items are dispensed from two sources:
//!
//!   reissue stack   indices that were handed out and then invalidated;
//!                   LIFO, always consulted first
//!   next_fresh      cursor over never-dispensed items; only moves forward
//!
//! There is no lease timeout. An assignment is only declared lost when a
//! later request names it as its prior id while it is still `Assigned`,
//! or when an operator calls [`DispatchQueue::force_reset`].
//!
//! One mutex covers every operation, so concurrent requests never receive
//! the same item.

use std::collections::HashMap;
use std::sync::Mutex;

use spindle_core::work::{QueueSummary, PRE_COMPLETED};
use spindle_core::{ItemState, ResetTarget, WorkItem};

use crate::lock;
use crate::transition_log::{Transition, TransitionKind, TransitionLog};

/// Result of [`DispatchQueue::request_item`].
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Item(WorkItem),
    EndOfWork,
}

impl From<Dispatch> for spindle_core::Assignment {
    fn from(d: Dispatch) -> Self {
        match d {
            Dispatch::Item(item) => Self::Item { item },
            Dispatch::EndOfWork => Self::EndOfWork,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Recorded,
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown item {0}")]
    UnknownItem(u64),
    #[error("invalid reset range {start}:{end}")]
    InvalidRange { start: u64, end: u64 },
    #[error("duplicate item id {0}")]
    DuplicateId(u64),
}

struct Slot {
    item: WorkItem,
    state: ItemState,
    assignee: String,
}

struct QueueState {
    slots: Vec<Slot>,
    index_of: HashMap<u64, usize>,
    next_fresh: usize,
    reissue: Vec<usize>,
    log: TransitionLog,
    exhausted: u64,
}

pub struct DispatchQueue {
    state: Mutex<QueueState>,
}

impl DispatchQueue {
    pub fn new(items: Vec<WorkItem>) -> Result<Self, DispatchError> {
        Self::resume(items, 1)
    }

    /// Build a queue that starts at the 1-based position `resume_from`.
    /// Every earlier item is recorded as completed by [`PRE_COMPLETED`].
    pub fn resume(items: Vec<WorkItem>, resume_from: u64) -> Result<Self, DispatchError> {
        let mut index_of = HashMap::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            if index_of.insert(item.id, index).is_some() {
                return Err(DispatchError::DuplicateId(item.id));
            }
        }

        let pre = (resume_from.saturating_sub(1) as usize).min(items.len());
        let mut log = TransitionLog::new();
        let slots = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                if index < pre {
                    log.record(item.id, TransitionKind::Finished, PRE_COMPLETED);
                    Slot {
                        item,
                        state: ItemState::Completed,
                        assignee: PRE_COMPLETED.to_string(),
                    }
                } else {
                    Slot {
                        item,
                        state: ItemState::Unassigned,
                        assignee: String::new(),
                    }
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(items = slots.len(), pre_completed = pre, "dispatch queue ready");
        Ok(Self {
            state: Mutex::new(QueueState {
                slots,
                index_of,
                next_fresh: pre,
                reissue: Vec::new(),
                log,
                exhausted: 0,
            }),
        })
    }

    /// Reconcile the caller's prior assignment, then dispense the next item.
    pub fn request_item(&self, prior_id: Option<u64>, worker: &str) -> Dispatch {
        let mut q = lock(&self.state);
        q.reconcile(prior_id, worker);
        q.dispense(worker)
    }

    /// If `prior_id` is still `Assigned`, treat that assignment as lost and
    /// put the item back on the reissue stack. Returns whether it was reset.
    pub fn reconcile_prior_assignment(&self, prior_id: Option<u64>, worker: &str) -> bool {
        lock(&self.state).reconcile(prior_id, worker)
    }

    /// Mark `id` completed. Repeated reports are harmless.
    pub fn report_complete(&self, id: u64, worker: &str) -> Result<Completion, DispatchError> {
        let mut q = lock(&self.state);
        let index = q.index(id)?;
        let slot = &mut q.slots[index];
        if slot.state == ItemState::Completed {
            tracing::debug!(item = id, worker, "item already completed");
            return Ok(Completion::AlreadyCompleted);
        }
        slot.state = ItemState::Completed;
        slot.assignee = worker.to_string();
        q.log.record(id, TransitionKind::Finished, worker);
        tracing::info!(item = id, worker, "item finished");
        Ok(Completion::Recorded)
    }

    /// Administrative reset of one id or an inclusive id range. Items that
    /// are already unassigned are left alone. Returns the ids reset.
    pub fn force_reset(&self, target: ResetTarget) -> Result<Vec<u64>, DispatchError> {
        let mut q = lock(&self.state);
        let (start, end) = target.bounds();
        if let ResetTarget::Single(id) = target {
            q.index(id)?;
        } else if start > end || !q.index_of.contains_key(&start) || !q.index_of.contains_key(&end) {
            return Err(DispatchError::InvalidRange { start, end });
        }

        let targets: Vec<usize> = q
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| (start..=end).contains(&s.item.id) && s.state != ItemState::Unassigned)
            .map(|(index, _)| index)
            .collect();

        let mut reset = Vec::with_capacity(targets.len());
        for index in targets {
            reset.push(q.slots[index].item.id);
            q.reset_slot(index);
        }
        tracing::info!(target = %target, reset = reset.len(), "forced reset");
        Ok(reset)
    }

    pub fn summary(&self) -> QueueSummary {
        let q = lock(&self.state);
        let mut summary = QueueSummary {
            total: q.slots.len(),
            pending_reissue: q
                .reissue
                .iter()
                .filter(|&&i| q.slots[i].state == ItemState::Unassigned)
                .count(),
            exhausted_requests: q.exhausted,
            ..QueueSummary::default()
        };
        for slot in &q.slots {
            match slot.state {
                ItemState::Unassigned => summary.unassigned += 1,
                ItemState::Assigned => summary.assigned += 1,
                ItemState::Completed => summary.completed += 1,
            }
        }
        summary
    }

    pub fn item(&self, id: u64) -> Option<WorkItem> {
        let q = lock(&self.state);
        q.index_of.get(&id).map(|&i| q.slots[i].item.clone())
    }

    /// Current state and assignee of `id`.
    pub fn state_of(&self, id: u64) -> Option<(ItemState, String)> {
        let q = lock(&self.state);
        q.index_of
            .get(&id)
            .map(|&i| (q.slots[i].state, q.slots[i].assignee.clone()))
    }

    pub fn transitions_since(&self, after: Option<u64>) -> Vec<Transition> {
        lock(&self.state).log.since(after).to_vec()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueueState {
    fn index(&self, id: u64) -> Result<usize, DispatchError> {
        self.index_of
            .get(&id)
            .copied()
            .ok_or(DispatchError::UnknownItem(id))
    }

    fn reconcile(&mut self, prior_id: Option<u64>, worker: &str) -> bool {
        let Some(id) = prior_id else {
            return false;
        };
        let Some(&index) = self.index_of.get(&id) else {
            tracing::warn!(item = id, worker, "prior id unknown, ignored");
            return false;
        };
        if self.slots[index].state != ItemState::Assigned {
            return false;
        }
        tracing::info!(
            item = id,
            worker,
            previous = %self.slots[index].assignee,
            "prior assignment lost, item reset"
        );
        self.reset_slot(index);
        true
    }

    fn reset_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.state = ItemState::Unassigned;
        slot.assignee.clear();
        let id = slot.item.id;
        self.reissue.push(index);
        self.log.record(id, TransitionKind::Reset, "");
    }

    fn dispense(&mut self, worker: &str) -> Dispatch {
        let Some(index) = self.next_index() else {
            self.exhausted += 1;
            tracing::debug!(worker, exhausted = self.exhausted, "no more items");
            return Dispatch::EndOfWork;
        };
        let slot = &mut self.slots[index];
        slot.state = ItemState::Assigned;
        slot.assignee = worker.to_string();
        let item = slot.item.clone();
        self.log.record(item.id, TransitionKind::Running, worker);
        tracing::info!(item = item.id, worker, "item dispatched");
        Dispatch::Item(item)
    }

    /// Pop the reissue stack, else advance the fresh cursor. Entries whose
    /// item is no longer unassigned (completed or handed out meanwhile) are
    /// skipped on both paths.
    fn next_index(&mut self) -> Option<usize> {
        while let Some(index) = self.reissue.pop() {
            if self.slots[index].state == ItemState::Unassigned {
                return Some(index);
            }
        }
        while self.next_fresh < self.slots.len() {
            let index = self.next_fresh;
            self.next_fresh += 1;
            if self.slots[index].state == ItemState::Unassigned {
                return Some(index);
            }
        }
        None
    }
}
