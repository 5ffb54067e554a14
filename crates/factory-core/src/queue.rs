//! In-memory attempt queue with slot accounting.
//!
//! The queue holds task ids. It is owned by exactly one worker loop and only
//! mutated between suspension points, so it carries no locking. Persisted
//! attempt rows stay authoritative; the queue is rebuilt from them via
//! [`Queue::resume`].

use std::collections::{HashSet, VecDeque};

use thiserror::Error;

use crate::resume::ResumeState;
use crate::types::Id;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("task {0} is already queued or running")]
    Duplicate(Id),
    #[error("queue corrupted: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Serializable view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct QueueSnapshot {
    pub queued: Vec<Id>,
    pub running: Vec<Id>,
    pub max_parallel: usize,
    pub stopped: bool,
}

/// FIFO of task ids plus the set currently holding a slot.
#[derive(Debug, Clone)]
pub struct Queue {
    queued: VecDeque<Id>,
    running: HashSet<Id>,
    max_parallel: usize,
    stopped: bool,
}

impl Queue {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            queued: VecDeque::new(),
            running: HashSet::new(),
            max_parallel,
            stopped: false,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn free_slots(&self) -> usize {
        self.max_parallel.saturating_sub(self.running.len())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn is_idle(&self) -> bool {
        self.queued.is_empty() && self.running.is_empty()
    }

    fn contains(&self, id: &Id) -> bool {
        self.running.contains(id) || self.queued.contains(id)
    }

    /// Append a task id. Ids already queued or running are rejected.
    pub fn enqueue(&mut self, id: Id) -> Result<()> {
        if self.contains(&id) {
            return Err(QueueError::Duplicate(id));
        }
        self.queued.push_back(id);
        Ok(())
    }

    /// Dequeue the head if the queue is live and a slot is free.
    ///
    /// The popped id is not marked running; callers do that once the start
    /// has been persisted.
    pub fn pop_next(&mut self) -> Option<Id> {
        if self.stopped || self.running.len() >= self.max_parallel {
            return None;
        }
        self.queued.pop_front()
    }

    pub fn mark_running(&mut self, id: Id) {
        self.queued.retain(|queued| queued != &id);
        self.running.insert(id);
    }

    pub fn mark_finished(&mut self, id: &Id) -> bool {
        self.running.remove(id)
    }

    /// Hard stop. `pop_next` returns `None` until the next `resume`.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Drop all state, including the stop flag.
    pub fn clear_all(&mut self) {
        self.queued.clear();
        self.running.clear();
        self.stopped = false;
    }

    /// Replace the queue wholesale from a derived state.
    pub fn resume(&mut self, state: &ResumeState, max_parallel: usize) -> Result<()> {
        let mut seen = HashSet::new();
        for id in state.running_task_ids.iter().chain(&state.queued_task_ids) {
            if !seen.insert(id) {
                return Err(QueueError::Corrupted(format!(
                    "task {id} appears more than once among live attempts"
                )));
            }
        }

        self.queued = state.queued_task_ids.iter().cloned().collect();
        self.running = state.running_task_ids.iter().cloned().collect();
        self.max_parallel = max_parallel;
        self.stopped = false;
        Ok(())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let mut running: Vec<Id> = self.running.iter().cloned().collect();
        running.sort();
        QueueSnapshot {
            queued: self.queued.iter().cloned().collect(),
            running,
            max_parallel: self.max_parallel,
            stopped: self.stopped,
        }
    }
}
