use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use task_queue_core::{TaskId, WorkerStatus, WorkerView};

/// Information about a registered worker
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task: Option<TaskId>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub cpu_usage_percent: f32,
    pub memory_usage_mb: u64,
}

impl WorkerInfo {
    pub fn new(worker_id: String) -> Self {
        let now = Utc::now();
        WorkerInfo {
            worker_id,
            registered_at: now,
            last_heartbeat: now,
            current_task: None,
            tasks_completed: 0,
            tasks_failed: 0,
            cpu_usage_percent: 0.0,
            memory_usage_mb: 0,
        }
    }

    /// Check if worker is considered alive (heartbeat within timeout)
    pub fn is_alive(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat <= timeout
    }

    pub fn heartbeat(&mut self, cpu: f32, memory: u64) {
        self.last_heartbeat = Utc::now();
        self.cpu_usage_percent = cpu;
        self.memory_usage_mb = memory;
    }

    pub fn view(&self, timeout: Duration, now: DateTime<Utc>) -> WorkerView {
        let status = if !self.is_alive(timeout, now) {
            WorkerStatus::Dead
        } else if self.current_task.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };
        WorkerView {
            worker_id: self.worker_id.clone(),
            status,
            started_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
            current_task_id: self.current_task,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            cpu_usage_percent: self.cpu_usage_percent,
            memory_usage_mb: self.memory_usage_mb,
        }
    }
}

/// Registry of all known workers.
///
/// A worker appears on its first heartbeat or claim and disappears when the
/// health sweep finds it silent for longer than the heartbeat timeout.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    heartbeat_timeout: Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_timeout: std::time::Duration) -> Self {
        WorkerRegistry {
            workers: RwLock::new(HashMap::new()),
            heartbeat_timeout: Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| Duration::seconds(30)),
        }
    }

    /// Register a worker if unknown; returns true when it was new
    pub fn register(&self, worker_id: &str) -> bool {
        let mut workers = self.workers.write();
        if workers.contains_key(worker_id) {
            return false;
        }
        workers.insert(worker_id.to_string(), WorkerInfo::new(worker_id.to_string()));
        true
    }

    pub fn deregister(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.write().remove(worker_id)
    }

    /// Record a heartbeat, registering the worker on first contact
    pub fn heartbeat(&self, worker_id: &str, cpu: f32, memory: u64) -> bool {
        let mut workers = self.workers.write();
        match workers.get_mut(worker_id) {
            Some(worker) => {
                worker.heartbeat(cpu, memory);
                false
            }
            None => {
                let mut info = WorkerInfo::new(worker_id.to_string());
                info.heartbeat(cpu, memory);
                workers.insert(worker_id.to_string(), info);
                true
            }
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers.read().get(worker_id).cloned()
    }

    pub fn current_task(&self, worker_id: &str) -> Option<TaskId> {
        self.workers.read().get(worker_id).and_then(|w| w.current_task)
    }

    pub fn assign_task(&self, worker_id: &str, task_id: TaskId) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.current_task = Some(task_id);
        }
    }

    /// Clear the worker's current task if it still points at `task_id`
    /// and count the outcome.
    pub fn finish_task(&self, worker_id: &str, task_id: &TaskId, success: bool) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            if worker.current_task.as_ref() == Some(task_id) {
                worker.current_task = None;
            }
            if success {
                worker.tasks_completed += 1;
            } else {
                worker.tasks_failed += 1;
            }
        }
    }

    /// Clear the current task without counting an outcome
    pub fn clear_task(&self, worker_id: &str, task_id: &TaskId) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            if worker.current_task.as_ref() == Some(task_id) {
                worker.current_task = None;
            }
        }
    }

    pub fn all_workers(&self) -> Vec<WorkerInfo> {
        self.workers.read().values().cloned().collect()
    }

    pub fn views(&self) -> Vec<WorkerView> {
        let now = Utc::now();
        let mut views: Vec<WorkerView> = self
            .workers
            .read()
            .values()
            .map(|w| w.view(self.heartbeat_timeout, now))
            .collect();
        views.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        views
    }

    pub fn dead_workers(&self) -> Vec<WorkerInfo> {
        let now = Utc::now();
        self.workers
            .read()
            .values()
            .filter(|w| !w.is_alive(self.heartbeat_timeout, now))
            .cloned()
            .collect()
    }

    /// Remove every worker past its heartbeat timeout and return them
    pub fn cleanup_dead_workers(&self) -> Vec<WorkerInfo> {
        let now = Utc::now();
        let mut workers = self.workers.write();
        let dead_ids: Vec<String> = workers
            .values()
            .filter(|w| !w.is_alive(self.heartbeat_timeout, now))
            .map(|w| w.worker_id.clone())
            .collect();

        dead_ids
            .into_iter()
            .filter_map(|id| workers.remove(&id))
            .collect()
    }

    pub fn count_alive(&self) -> usize {
        let now = Utc::now();
        self.workers
            .read()
            .values()
            .filter(|w| w.is_alive(self.heartbeat_timeout, now))
            .count()
    }

    pub fn count_total(&self) -> usize {
        self.workers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    #[test]
    fn test_register_and_get_worker() {
        let registry = WorkerRegistry::new(StdDuration::from_secs(30));

        assert!(registry.register("worker-1"));
        assert!(!registry.register("worker-1"));

        let info = registry.get("worker-1").unwrap();
        assert_eq!(info.worker_id, "worker-1");
        assert!(info.is_alive(Duration::seconds(30), Utc::now()));
    }

    #[test]
    fn test_heartbeat_registers_and_updates() {
        let registry = WorkerRegistry::new(StdDuration::from_secs(30));

        assert!(registry.heartbeat("worker-1", 12.5, 256));
        assert!(!registry.heartbeat("worker-1", 50.0, 1024));

        let info = registry.get("worker-1").unwrap();
        assert_eq!(info.cpu_usage_percent, 50.0);
        assert_eq!(info.memory_usage_mb, 1024);
        assert_eq!(registry.count_alive(), 1);
    }

    #[test]
    fn test_worker_death_detection() {
        let registry = WorkerRegistry::new(StdDuration::from_millis(100));
        registry.register("worker-1");

        thread::sleep(StdDuration::from_millis(150));

        let dead = registry.dead_workers();
        assert_eq!(dead.len(), 1);
        assert_eq!(registry.views()[0].status, WorkerStatus::Dead);

        let removed = registry.cleanup_dead_workers();
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.count_total(), 0);
    }

    #[test]
    fn test_task_assignment() {
        let registry = WorkerRegistry::new(StdDuration::from_secs(30));
        registry.register("worker-1");

        let task_id = Uuid::new_v4();
        registry.assign_task("worker-1", task_id);
        assert_eq!(registry.current_task("worker-1"), Some(task_id));
        assert_eq!(registry.views()[0].status, WorkerStatus::Busy);

        // A stale report for another task leaves the current one alone
        registry.finish_task("worker-1", &Uuid::new_v4(), false);
        assert_eq!(registry.current_task("worker-1"), Some(task_id));

        registry.finish_task("worker-1", &task_id, true);
        let info = registry.get("worker-1").unwrap();
        assert_eq!(info.current_task, None);
        assert_eq!(info.tasks_completed, 1);
        assert_eq!(info.tasks_failed, 1);
        assert_eq!(registry.views()[0].status, WorkerStatus::Idle);
    }
}
