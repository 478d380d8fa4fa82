use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use task_queue_core::TaskId;

/// Holds task ids until their time comes.
///
/// Used for delayed submissions and retry back-off. The scheduler only
/// orders ids by due time; whether a due task still gets queued is decided
/// by the broker against the task's current state.
#[derive(Default)]
pub struct DelayScheduler {
    heap: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, u64, TaskId)>>>,
}

impl DelayScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `sequence` breaks ties between ids due at the same instant
    pub fn schedule(&self, task_id: TaskId, due_at: DateTime<Utc>, sequence: u64) {
        self.heap.lock().push(Reverse((due_at, sequence, task_id)));
    }

    /// Take every id due at or before `now`, earliest first
    pub fn pop_due(&self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = heap.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = heap.pop() {
                due.push(id);
            }
        }
        due
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.lock().peek().map(|Reverse((at, _, _))| *at)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}
