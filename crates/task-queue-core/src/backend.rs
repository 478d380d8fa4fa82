use crate::{Priority, QueueName, QueueStats, TaskId};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One pending task id inside a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub task_id: TaskId,
    pub priority: Priority,
    /// Admission order of the task
    pub sequence: u64,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    /// Max-heap order: higher priority first, then earlier submission.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}

/// Storage contract for named priority queues.
///
/// The broker only talks to queues through this trait. `MemoryBackend` is the
/// reference implementation; networked transports plug in behind the same
/// calls. A dequeued entry stays in flight until it is acked (work taken) or
/// nacked (returned to its queue).
pub trait QueueBackend: Send + Sync {
    /// Insert a task id; the queue is created on first use.
    fn enqueue(&self, queue: &QueueName, entry: QueueEntry);

    /// Take the best entry of a queue, if any.
    fn dequeue(&self, queue: &QueueName) -> Option<QueueEntry>;

    /// Forget an in-flight entry.
    fn ack(&self, task_id: &TaskId);

    /// Put an in-flight entry back into the queue it came from.
    fn nack(&self, task_id: &TaskId) -> bool;

    /// Drop a pending entry, e.g. on cancellation.
    fn remove(&self, task_id: &TaskId) -> bool;

    /// Make an (empty) queue visible without inserting anything.
    fn ensure_queue(&self, queue: &QueueName);

    /// Every queue created so far, in stable order.
    fn queue_names(&self) -> Vec<QueueName>;

    /// Pending counts per queue and priority.
    fn stats(&self) -> BTreeMap<QueueName, QueueStats>;

    /// Number of pending entries across all queues.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
