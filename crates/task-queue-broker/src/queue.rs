use parking_lot::Mutex;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use task_queue_core::{QueueBackend, QueueEntry, QueueName, QueueStats, TaskId};

/// One named priority queue.
///
/// Removals only touch `live`; the heap keeps the stale entry and skips it
/// when it surfaces.
#[derive(Default)]
struct NamedQueue {
    heap: BinaryHeap<QueueEntry>,
    live: HashMap<TaskId, QueueEntry>,
}

impl NamedQueue {
    fn pop(&mut self) -> Option<QueueEntry> {
        while let Some(entry) = self.heap.pop() {
            if self.live.get(&entry.task_id) == Some(&entry) {
                self.live.remove(&entry.task_id);
                return Some(entry);
            }
        }
        None
    }

    fn rebuild_if_sparse(&mut self) {
        if self.heap.len() > 64 && self.heap.len() > self.live.len() * 2 {
            self.heap = self.live.values().copied().collect();
        }
    }
}

#[derive(Default)]
struct BackendState {
    queues: BTreeMap<QueueName, NamedQueue>,
    /// Queue of every pending entry
    location: HashMap<TaskId, QueueName>,
    /// Dequeued but not yet acked
    in_flight: HashMap<TaskId, (QueueName, QueueEntry)>,
}

impl BackendState {
    fn push(&mut self, queue: &QueueName, entry: QueueEntry) {
        if self.location.contains_key(&entry.task_id) {
            return;
        }
        self.in_flight.remove(&entry.task_id);
        let named = self.queues.entry(queue.clone()).or_default();
        named.heap.push(entry);
        named.live.insert(entry.task_id, entry);
        self.location.insert(entry.task_id, queue.clone());
    }
}

/// In-process queue backend: a binary heap per named queue behind one lock.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a task id is currently pending in any queue
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.state.lock().location.contains_key(task_id)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}

impl QueueBackend for MemoryBackend {
    fn enqueue(&self, queue: &QueueName, entry: QueueEntry) {
        self.state.lock().push(queue, entry);
    }

    fn dequeue(&self, queue: &QueueName) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        let entry = state.queues.get_mut(queue)?.pop()?;
        state.location.remove(&entry.task_id);
        state.in_flight.insert(entry.task_id, (queue.clone(), entry));
        Some(entry)
    }

    fn ack(&self, task_id: &TaskId) {
        self.state.lock().in_flight.remove(task_id);
    }

    fn nack(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.lock();
        match state.in_flight.remove(task_id) {
            Some((queue, entry)) => {
                state.push(&queue, entry);
                true
            }
            None => false,
        }
    }

    fn remove(&self, task_id: &TaskId) -> bool {
        let mut state = self.state.lock();
        let Some(queue) = state.location.remove(task_id) else {
            return false;
        };
        if let Some(named) = state.queues.get_mut(&queue) {
            named.live.remove(task_id);
            named.rebuild_if_sparse();
        }
        true
    }

    fn ensure_queue(&self, queue: &QueueName) {
        self.state.lock().queues.entry(queue.clone()).or_default();
    }

    fn queue_names(&self) -> Vec<QueueName> {
        self.state.lock().queues.keys().cloned().collect()
    }

    fn stats(&self) -> BTreeMap<QueueName, QueueStats> {
        let state = self.state.lock();
        state
            .queues
            .iter()
            .map(|(name, named)| {
                let mut stats = QueueStats {
                    pending: named.live.len(),
                    ..Default::default()
                };
                for entry in named.live.values() {
                    *stats
                        .priority_breakdown
                        .entry(entry.priority.value())
                        .or_insert(0) += 1;
                }
                (name.clone(), stats)
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.state.lock().location.len()
    }
}
