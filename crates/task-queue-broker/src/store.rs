use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use task_queue_core::{Result, Task, TaskError, TaskId, TaskStatus};
use task_queue_persistence::{Journal, JournalEntry};
use tokio::sync::watch;
use tracing::error;

/// Changes to any of these mark a task as modified
fn revision(task: &Task) -> (TaskStatus, DateTime<Utc>, DateTime<Utc>, usize) {
    (
        task.status,
        task.updated_at,
        task.eligible_at,
        task.child_task_ids.len(),
    )
}

struct TaskEntry {
    task: Task,
    status_tx: watch::Sender<TaskStatus>,
}

/// Authoritative task records.
///
/// Every mutation goes through `update`, which holds the task's map entry
/// for the duration of the closure. That entry lock is the per-task lock:
/// a closure may take the queue backend lock inside it, never another task.
pub struct TaskStore {
    tasks: DashMap<TaskId, TaskEntry>,
    sequence: AtomicU64,
    journal: Option<Journal>,
}

impl TaskStore {
    pub fn new(journal: Option<Journal>) -> Self {
        TaskStore {
            tasks: DashMap::new(),
            sequence: AtomicU64::new(0),
            journal,
        }
    }

    /// Admission sequence for the next task
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    fn persist(&self, task: &Task) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record(task) {
                error!("Failed to journal task {}: {}", task.id, e);
            }
        }
    }

    /// Add a new task
    pub fn insert(&self, task: Task) {
        self.persist(&task);
        self.insert_recovered(task);
    }

    /// Add a task read back from the journal without writing it again
    pub fn insert_recovered(&self, task: Task) {
        self.sequence.fetch_max(task.sequence + 1, Ordering::SeqCst);
        let (status_tx, _) = watch::channel(task.status);
        self.tasks.insert(task.id, TaskEntry { task, status_tx });
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|e| e.task.clone())
    }

    pub fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(task_id).map(|e| e.task.status)
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Mutate a task under its lock.
    ///
    /// The change is journaled and status watchers are woken when the closure
    /// returns `Ok`. On `Err` the closure must leave the task untouched.
    pub fn update<R>(
        &self,
        task_id: &TaskId,
        f: impl FnOnce(&mut Task) -> Result<R>,
    ) -> Result<R> {
        let mut entry = self
            .tasks
            .get_mut(task_id)
            .ok_or(TaskError::TaskNotFound(*task_id))?;

        let before = revision(&entry.task);
        let out = f(&mut entry.task)?;

        if revision(&entry.task) != before {
            self.persist(&entry.task);
            let status = entry.task.status;
            entry.status_tx.send_if_modified(|current| {
                if *current != status {
                    *current = status;
                    true
                } else {
                    false
                }
            });
        }
        Ok(out)
    }

    /// Watch a task's status
    pub fn subscribe(&self, task_id: &TaskId) -> Option<watch::Receiver<TaskStatus>> {
        self.tasks.get(task_id).map(|e| e.status_tx.subscribe())
    }

    /// Ids of tasks matching a predicate
    pub fn select(&self, mut pred: impl FnMut(&Task) -> bool) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|e| pred(&e.task))
            .map(|e| *e.key())
            .collect()
    }

    /// Clones of tasks matching a predicate, in admission order
    pub fn collect(&self, mut pred: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .filter(|e| pred(&e.task))
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        tasks
    }

    pub fn count_by_status(&self) -> HashMap<TaskStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.tasks.iter() {
            *counts.entry(entry.task.status).or_insert(0) += 1;
        }
        counts
    }

    /// Drop a task for good
    pub fn purge(&self, task_id: &TaskId) -> Option<Task> {
        let (_, entry) = self.tasks.remove(task_id)?;
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.append(JournalEntry::Purged { task_id: *task_id }) {
                error!("Failed to journal purge of task {}: {}", task_id, e);
            }
        }
        Some(entry.task)
    }

    /// Rewrite the journal once it has grown past `threshold` appends
    pub fn compact_if_needed(&self, threshold: u64) -> Result<bool> {
        let Some(journal) = &self.journal else {
            return Ok(false);
        };
        if journal.appends_since_compaction() < threshold {
            return Ok(false);
        }
        let snapshot = self.collect(|_| true);
        journal.compact(&snapshot)?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn task(store: &TaskStore) -> Task {
        Task::builder("test", json!({}))
            .sequence(store.next_sequence())
            .build()
            .unwrap()
    }

    #[test]
    fn test_update_notifies_watchers() {
        let store = TaskStore::new(None);
        let t = task(&store);
        let id = t.id;
        store.insert(t);

        let rx = store.subscribe(&id).unwrap();
        assert_eq!(*rx.borrow(), TaskStatus::Pending);

        store.update(&id, |t| t.claim("w".into())).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow(), TaskStatus::Running);
    }

    #[test]
    fn test_failed_update_leaves_task_untouched() {
        let store = TaskStore::new(None);
        let t = task(&store);
        let id = t.id;
        store.insert(t);

        let err = store.update(&id, |t| t.complete(json!(1))).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(store.status(&id), Some(TaskStatus::Pending));

        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            store.update(&missing, |_| Ok(())),
            Err(TaskError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_recovered_tasks_advance_sequence() {
        let store = TaskStore::new(None);
        let t = Task::builder("test", json!({}))
            .sequence(41)
            .build()
            .unwrap();
        store.insert_recovered(t);
        assert_eq!(store.next_sequence(), 42);
    }

    #[test]
    fn test_journal_round_trip_and_compaction() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(Some(Journal::open(dir.path()).unwrap()));
        let t = task(&store);
        let id = t.id;
        store.insert(t);
        store.update(&id, |t| t.claim("w".into())).unwrap();
        store.update(&id, |t| t.complete(json!("ok"))).unwrap();

        assert!(!store.compact_if_needed(100).unwrap());
        assert!(store.compact_if_needed(3).unwrap());

        let recovered = Journal::open(dir.path()).unwrap().recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, TaskStatus::Completed);

        store.purge(&id);
        assert!(store.is_empty());
        let recovered = Journal::open(dir.path()).unwrap().recover().unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn test_count_and_select() {
        let store = TaskStore::new(None);
        let a = task(&store);
        let b = task(&store);
        let a_id = a.id;
        store.insert(a);
        store.insert(b);
        store.update(&a_id, |t| t.cancel()).unwrap();

        let counts = store.count_by_status();
        assert_eq!(counts.get(&TaskStatus::Cancelled), Some(&1));
        assert_eq!(counts.get(&TaskStatus::Pending), Some(&1));
        assert_eq!(
            store.select(|t| t.status == TaskStatus::Cancelled),
            vec![a_id]
        );
        assert_eq!(store.collect(|_| true).len(), 2);
    }
}
