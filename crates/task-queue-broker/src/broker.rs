use crate::admission::{build_limiter, AdmissionLimiter, DedupOutcome, Deduplicator, RateDecision};
use crate::config::BrokerConfig;
use crate::handler::{TaskHandler, TaskHandlerRegistry};
use crate::metrics::BrokerMetrics;
use crate::monitor::{self, MonitorHandle};
use crate::queue::MemoryBackend;
use crate::scheduler::DelayScheduler;
use crate::store::TaskStore;
use crate::worker_registry::WorkerRegistry;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_queue_core::{
    FailureReason, ProgressView, QueueBackend, QueueEntry, QueueName, QueueStats, Result,
    ResultView, RetryDecision, Submission, SubmitOptions, Task, TaskError, TaskId, TaskStatus,
    WorkerView,
};
use task_queue_persistence::Journal;
use tracing::{debug, error, info, warn};

/// Proof of ownership for one attempt of a task.
///
/// Reports carrying a lease whose attempt is no longer current are discarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub task_id: TaskId,
    pub worker_id: String,
    pub attempt: u32,
}

/// A task handed to a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub task: Task,
    pub lease: Lease,
}

fn queue_entry(task: &Task) -> QueueEntry {
    QueueEntry {
        task_id: task.id,
        priority: task.priority,
        sequence: task.sequence,
    }
}

fn lease_matches(task: &Task, lease: &Lease) -> bool {
    task.status == TaskStatus::Running
        && task.worker_id.as_deref() == Some(lease.worker_id.as_str())
        && task.attempts == lease.attempt
}

/// What a caller needs after a task reached an end state
struct Settled {
    name: String,
    dedupe_key: Option<String>,
    duration: Option<Duration>,
}

impl Settled {
    fn of(task: &Task) -> Self {
        Settled {
            name: task.name.clone(),
            dedupe_key: task.dedupe_key.clone(),
            duration: task.duration(),
        }
    }
}

/// The task queue manager.
///
/// Owns the task store, the queues, the delay scheduler, admission control
/// and the worker registry. All operations are synchronous except
/// `get_result`; background sweeps run through [`Broker::start_monitors`].
pub struct Broker {
    config: Arc<BrokerConfig>,
    store: TaskStore,
    backend: Arc<dyn QueueBackend>,
    scheduler: DelayScheduler,
    workers: WorkerRegistry,
    limiter: Box<dyn AdmissionLimiter>,
    dedup: Deduplicator,
    handlers: TaskHandlerRegistry,
    metrics: Arc<BrokerMetrics>,
    queue_cursor: AtomicUsize,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> anyhow::Result<Self> {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Build a broker on top of another queue backend
    pub fn with_backend(
        config: BrokerConfig,
        backend: Arc<dyn QueueBackend>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let journal = if config.persistence.enabled {
            Some(Journal::open(&config.persistence.data_dir)?)
        } else {
            None
        };
        let recovered = match &journal {
            Some(journal) => journal.recover()?,
            None => Vec::new(),
        };

        let broker = Broker {
            store: TaskStore::new(journal),
            backend,
            scheduler: DelayScheduler::new(),
            workers: WorkerRegistry::new(config.heartbeat_timeout()),
            limiter: build_limiter(&config),
            dedup: Deduplicator::new(config.dedupe_grace()),
            handlers: TaskHandlerRegistry::new(),
            metrics: Arc::new(BrokerMetrics::new()?),
            queue_cursor: AtomicUsize::new(0),
            config: Arc::new(config),
        };
        broker.restore(recovered)?;
        Ok(broker)
    }

    /// Rebuild queues, schedule and dedupe keys from journaled tasks
    fn restore(&self, tasks: Vec<Task>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let total = tasks.len();
        let mut released = 0;

        for mut task in tasks {
            self.backend.ensure_queue(&task.queue);

            // Workers do not survive a restart
            let was_running = task.status == TaskStatus::Running;
            if was_running {
                task.release()?;
                released += 1;
            }

            if !task.status.is_terminal() {
                if let Some(key) = &task.dedupe_key {
                    self.dedup.try_register(key, task.id);
                }
            }

            let (id, status, eligible_at, sequence) =
                (task.id, task.status, task.eligible_at, task.sequence);
            let queue = task.queue.clone();
            let entry = queue_entry(&task);
            if was_running {
                self.store.insert(task);
            } else {
                self.store.insert_recovered(task);
            }

            match status {
                TaskStatus::Pending if eligible_at > now => {
                    self.scheduler.schedule(id, eligible_at, sequence)
                }
                TaskStatus::Pending => self.backend.enqueue(&queue, entry),
                TaskStatus::Retrying => self.scheduler.schedule(id, eligible_at, sequence),
                _ => {}
            }
        }

        info!(
            "Recovered {} tasks from journal ({} released from a previous run)",
            total, released
        );
        self.store.compact_if_needed(0)?;
        Ok(())
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<BrokerMetrics> {
        self.metrics.clone()
    }

    /// Spawn the periodic sweeps on the current runtime
    pub fn start_monitors(self: &Arc<Self>) -> MonitorHandle {
        monitor::spawn_monitors(self.clone())
    }

    // ---------------------------------------------------------------------
    // Admission
    // ---------------------------------------------------------------------

    /// Submit a task.
    ///
    /// Validation problems are errors; duplicates and rate limiting are
    /// reported through [`Submission`]. The rate limit is checked before the
    /// dedupe key is reserved, so a key is only ever held by an admitted task.
    /// A refused duplicate still spends a rate-limit token.
    pub fn submit(
        &self,
        name: impl Into<String>,
        payload: Value,
        opts: SubmitOptions,
    ) -> Result<Submission> {
        let built = Task::builder(name, payload)
            .max_retries(self.config.tasks.default_max_retries)
            .default_timeout_secs(self.config.tasks.default_timeout_secs)
            .options(&opts)
            .sequence(self.store.next_sequence())
            .build();
        let task = match built {
            Ok(task) => task,
            Err(e) => {
                self.metrics.inc_rejection("invalid");
                return Err(e);
            }
        };

        if let Some(parent) = task.parent_task_id {
            if !self.store.contains(&parent) {
                self.metrics.inc_rejection("invalid");
                return Err(TaskError::validation(format!(
                    "parent task {} not found",
                    parent
                )));
            }
        }

        if let RateDecision::Limited { retry_after } = self.limiter.check(&task.name) {
            warn!(
                "Rate limit reached for task '{}', retry after {:?}",
                task.name, retry_after
            );
            self.metrics.inc_rejection("rate_limited");
            return Ok(Submission::RateLimited { retry_after });
        }

        if let Some(key) = &task.dedupe_key {
            if let DedupOutcome::Duplicate(existing) = self.dedup.try_register(key, task.id) {
                debug!(
                    "Dedupe key '{}' still held by task {}; not admitting",
                    key, existing
                );
                self.metrics.inc_rejection("duplicate");
                return Ok(Submission::Duplicate { existing });
            }
        }

        Ok(Submission::Accepted(self.admit(task)))
    }

    /// Like [`Broker::submit`], with `None` for a duplicate and an error when
    /// rate limited.
    pub fn submit_task(
        &self,
        name: impl Into<String>,
        payload: Value,
        opts: SubmitOptions,
    ) -> Result<Option<TaskId>> {
        let name = name.into();
        match self.submit(name.clone(), payload, opts)? {
            Submission::Accepted(id) => Ok(Some(id)),
            Submission::Duplicate { .. } => Ok(None),
            Submission::RateLimited { retry_after } => Err(TaskError::RateLimitExceeded {
                name,
                retry_after_ms: retry_after.as_millis() as u64,
            }),
        }
    }

    fn admit(&self, task: Task) -> TaskId {
        let id = task.id;
        let name = task.name.clone();
        let queue = task.queue.clone();
        let parent = task.parent_task_id;
        let delayed_until = task.is_delayed(Utc::now()).then_some(task.eligible_at);
        let sequence = task.sequence;

        self.backend.ensure_queue(&queue);
        self.store.insert(task);

        if let Some(parent) = parent {
            let linked = self.store.update(&parent, |p| {
                p.child_task_ids.push(id);
                Ok(())
            });
            if let Err(e) = linked {
                warn!("Could not link task {} to parent {}: {}", id, parent, e);
            }
        }

        match delayed_until {
            Some(at) => {
                self.scheduler.schedule(id, at, sequence);
                info!("Submitted task {} ({}) delayed until {}", id, name, at);
            }
            None => {
                let queued = self.store.update(&id, |t| {
                    if t.status == TaskStatus::Pending {
                        self.backend.enqueue(&t.queue, queue_entry(t));
                    }
                    Ok(())
                });
                if let Err(e) = queued {
                    error!("Failed to enqueue task {}: {}", id, e);
                }
                info!("Submitted task {} ({}) to queue {}", id, name, queue);
            }
        }

        self.metrics.inc_tasks_total("submitted", &name);
        id
    }

    // ---------------------------------------------------------------------
    // Dispatch
    // ---------------------------------------------------------------------

    /// Claim the next task from any queue, rotating between queues
    pub fn claim(&self, worker_id: &str) -> Option<ClaimedTask> {
        self.claim_from(worker_id, &[])
    }

    /// Claim the next task from the given queues (all queues when empty)
    pub fn claim_from(&self, worker_id: &str, queues: &[QueueName]) -> Option<ClaimedTask> {
        if self.workers.register(worker_id) {
            info!("Registered new worker: {}", worker_id);
        }
        if let Some(current) = self.workers.current_task(worker_id) {
            let still_owned = self
                .store
                .get(&current)
                .is_some_and(|t| {
                    t.status == TaskStatus::Running
                        && t.worker_id.as_deref() == Some(worker_id)
                });
            if still_owned {
                debug!("Worker {} still holds task {}", worker_id, current);
                return None;
            }
            self.workers.clear_task(worker_id, &current);
        }

        let names = if queues.is_empty() {
            self.backend.queue_names()
        } else {
            queues.to_vec()
        };
        if names.is_empty() {
            return None;
        }

        let start = self.queue_cursor.fetch_add(1, Ordering::Relaxed) % names.len();
        for offset in 0..names.len() {
            let queue = &names[(start + offset) % names.len()];
            while let Some(entry) = self.backend.dequeue(queue) {
                let claimed = self.store.update(&entry.task_id, |task| {
                    if task.status != TaskStatus::Pending {
                        return Ok(None);
                    }
                    task.claim(worker_id.to_string())?;
                    Ok(Some(task.clone()))
                });
                self.backend.ack(&entry.task_id);

                match claimed {
                    Ok(Some(task)) => {
                        self.workers.assign_task(worker_id, task.id);
                        self.metrics.inc_tasks_total("claimed", &task.name);
                        debug!(
                            "Worker {} claimed task {} from {} (attempt {})",
                            worker_id, task.id, queue, task.attempts
                        );
                        let lease = Lease {
                            task_id: task.id,
                            worker_id: worker_id.to_string(),
                            attempt: task.attempts,
                        };
                        return Some(ClaimedTask { task, lease });
                    }
                    Ok(None) => debug!("Skipping stale queue entry {}", entry.task_id),
                    Err(e) => warn!("Dropping queue entry {}: {}", entry.task_id, e),
                }
            }
        }
        None
    }

    /// Record a successful attempt. Returns false when the report is stale.
    pub fn complete(&self, lease: &Lease, result: Value) -> Result<bool> {
        let settled = self.store.update(&lease.task_id, |task| {
            if !lease_matches(task, lease) {
                return Ok(None);
            }
            task.complete(result)?;
            Ok(Some(Settled::of(task)))
        })?;

        let Some(settled) = settled else {
            self.workers.clear_task(&lease.worker_id, &lease.task_id);
            debug!(
                "Discarding completion of task {} from worker {} (attempt {})",
                lease.task_id, lease.worker_id, lease.attempt
            );
            return Ok(false);
        };

        self.workers
            .finish_task(&lease.worker_id, &lease.task_id, true);
        if let Some(duration) = settled.duration {
            self.metrics
                .observe_processing_duration(&settled.name, duration.as_secs_f64());
        }
        self.on_settled(&lease.task_id, TaskStatus::Completed, &settled);
        info!("Task {} completed successfully", lease.task_id);
        Ok(true)
    }

    /// Record a failed attempt and apply the retry rule.
    /// Returns false when the report is stale.
    pub fn fail(&self, lease: &Lease, error: impl Into<String>) -> Result<bool> {
        let error = error.into();
        let outcome = self.store.update(&lease.task_id, |task| {
            if !lease_matches(task, lease) {
                return Ok(None);
            }
            let decision = task.fail(error.clone())?;
            if decision == RetryDecision::Retry {
                self.schedule_retry(task);
            }
            Ok(Some((decision, task.name.clone(), task.retry_count)))
        })?;

        let Some((decision, name, retry_count)) = outcome else {
            self.workers.clear_task(&lease.worker_id, &lease.task_id);
            debug!(
                "Discarding failure of task {} from worker {} (attempt {})",
                lease.task_id, lease.worker_id, lease.attempt
            );
            return Ok(false);
        };

        self.workers
            .finish_task(&lease.worker_id, &lease.task_id, false);
        self.record_failure(&lease.task_id, &name, decision, retry_count, &error);
        Ok(true)
    }

    /// Retrying -> Pending now, or after the configured back-off.
    /// Runs under the task's lock.
    fn schedule_retry(&self, task: &mut Task) {
        match &self.config.tasks.retry_backoff {
            Some(backoff) => {
                let delay = backoff.delay_for(task.retry_count.saturating_sub(1));
                let now = Utc::now();
                task.eligible_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(now);
                self.scheduler
                    .schedule(task.id, task.eligible_at, task.sequence);
            }
            None => match task.requeue() {
                Ok(()) => self.backend.enqueue(&task.queue, queue_entry(task)),
                Err(e) => error!("Failed to requeue task {}: {}", task.id, e),
            },
        }
    }

    fn record_failure(
        &self,
        task_id: &TaskId,
        name: &str,
        decision: RetryDecision,
        retry_count: u32,
        error: &str,
    ) {
        self.metrics.inc_tasks_total("failed", name);
        match decision {
            RetryDecision::Retry => {
                self.metrics.inc_tasks_total("retried", name);
                info!(
                    "Task {} failed ({}), scheduled for retry {}",
                    task_id, error, retry_count
                );
            }
            RetryDecision::Exhausted => {
                warn!(
                    "Task {} failed ({}) with no retries left; awaiting dead-letter sweep",
                    task_id, error
                );
            }
        }
    }

    /// Bookkeeping shared by every transition into an end state
    fn on_settled(&self, task_id: &TaskId, status: TaskStatus, settled: &Settled) {
        self.metrics.inc_tasks_total(status.as_str(), &settled.name);
        if let Some(key) = &settled.dedupe_key {
            self.dedup.release(key, *task_id);
        }
    }

    pub fn heartbeat(&self, worker_id: &str, cpu_usage_percent: f32, memory_usage_mb: u64) {
        if self
            .workers
            .heartbeat(worker_id, cpu_usage_percent, memory_usage_mb)
        {
            info!("Registered new worker: {}", worker_id);
        }
    }

    // ---------------------------------------------------------------------
    // Control & queries
    // ---------------------------------------------------------------------

    /// Cancel a Pending or Running task and, if that succeeded, every
    /// descendant still cancellable. Returns whether the task itself changed.
    pub fn cancel(&self, task_id: &TaskId) -> Result<bool> {
        let cancelled = self.cancel_one(task_id)?;
        if !cancelled {
            return Ok(false);
        }

        let mut stack = self
            .store
            .get(task_id)
            .map(|t| t.child_task_ids)
            .unwrap_or_default();
        while let Some(child) = stack.pop() {
            if let Err(e) = self.cancel_one(&child) {
                debug!("Skipping child {} of cancelled task {}: {}", child, task_id, e);
                continue;
            }
            if let Some(grandchildren) = self.store.get(&child).map(|t| t.child_task_ids) {
                stack.extend(grandchildren);
            }
        }
        Ok(true)
    }

    fn cancel_one(&self, task_id: &TaskId) -> Result<bool> {
        let settled = self.store.update(task_id, |task| {
            if !task.status.is_cancellable() {
                return Ok(None);
            }
            let was_pending = task.status == TaskStatus::Pending;
            task.cancel()?;
            if was_pending {
                // A delayed task is not queued yet; its promotion is suppressed
                self.backend.remove(&task.id);
            }
            Ok(Some(Settled::of(task)))
        })?;

        match settled {
            Some(settled) => {
                self.on_settled(task_id, TaskStatus::Cancelled, &settled);
                info!("Task {} cancelled", task_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        self.store
            .get(task_id)
            .ok_or(TaskError::TaskNotFound(*task_id))
    }

    /// Snapshot of tasks matching `filter`, in admission order
    pub fn list_tasks(&self, filter: impl FnMut(&Task) -> bool) -> Vec<Task> {
        self.store.collect(filter)
    }

    pub fn count_by_status(&self) -> HashMap<TaskStatus, usize> {
        self.store.count_by_status()
    }

    /// Wait up to `timeout` for the task to reach a terminal state.
    ///
    /// Running out of time is not an error: the returned view has
    /// `timed_out` set and the status observed last.
    pub async fn get_result(&self, task_id: &TaskId, timeout: Duration) -> Result<ResultView> {
        let mut rx = self
            .store
            .subscribe(task_id)
            .ok_or(TaskError::TaskNotFound(*task_id))?;

        let finished = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false);

        let task = self.get_task(task_id)?;
        let timed_out = !finished && !task.status.is_terminal();
        Ok(ResultView::from_task(&task, timed_out))
    }

    pub fn get_progress(&self, task_id: &TaskId) -> Result<ProgressView> {
        let task = self.get_task(task_id)?;
        let total = task.child_task_ids.len();

        if total == 0 {
            let progress = match task.status {
                TaskStatus::Pending | TaskStatus::Retrying => 0.0,
                TaskStatus::Running | TaskStatus::Failed => 50.0,
                TaskStatus::Completed | TaskStatus::Dead | TaskStatus::Cancelled => 100.0,
            };
            return Ok(ProgressView {
                task_id: task.id,
                status: task.status,
                progress,
                total_children: 0,
                completed_children: 0,
            });
        }

        let completed = task
            .child_task_ids
            .iter()
            .filter(|id| self.store.status(id) == Some(TaskStatus::Completed))
            .count();
        Ok(ProgressView {
            task_id: task.id,
            status: task.status,
            progress: completed as f64 / total as f64 * 100.0,
            total_children: total,
            completed_children: completed,
        })
    }

    /// Register the handler workers run for tasks named `name`
    pub fn register_handler<H: TaskHandler + 'static>(&self, name: impl Into<String>, handler: H) {
        let name = name.into();
        debug!("Registered handler for '{}'", name);
        self.handlers.register(name, Arc::new(handler));
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn handlers(&self) -> &TaskHandlerRegistry {
        &self.handlers
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerView> {
        self.workers.views()
    }

    pub fn get_queue_stats(&self) -> BTreeMap<QueueName, QueueStats> {
        self.backend.stats()
    }

    /// Free a dedupe key before its task finishes
    pub fn expire_dedupe_key(&self, key: &str) -> bool {
        self.dedup.expire(key)
    }

    pub fn dead_letters(&self) -> Vec<Task> {
        self.store.collect(|t| t.status == TaskStatus::Dead)
    }

    /// Resubmit a dead task as a fresh task with the same definition
    pub fn reprocess_dead(&self, task_id: &TaskId) -> Result<Submission> {
        let dead = self.get_task(task_id)?;
        if dead.status != TaskStatus::Dead {
            return Err(TaskError::validation(format!(
                "task {} is {}, only dead tasks can be reprocessed",
                task_id, dead.status
            )));
        }

        let mut opts = SubmitOptions::new()
            .priority(dead.priority)
            .tags(dead.tags.iter().cloned())
            .max_retries(dead.max_retries)
            .timeout_secs(dead.timeout_secs);
        if let Some(key) = &dead.dedupe_key {
            if self.dedup.holder(key) == Some(dead.id) {
                self.dedup.expire(key);
            }
            opts = opts.dedupe_key(key.clone());
        }

        let submission = self.submit(dead.name.clone(), dead.payload.clone(), opts)?;
        if let Submission::Accepted(new_id) = &submission {
            info!("Reprocessing dead task {} as {}", task_id, new_id);
        }
        Ok(submission)
    }

    // ---------------------------------------------------------------------
    // Sweeps, driven by the monitors
    // ---------------------------------------------------------------------

    /// Remove silent workers and put their tasks back in their queues.
    /// Returns the number of workers removed.
    pub fn reap_dead_workers(&self) -> usize {
        let removed = self.workers.cleanup_dead_workers();
        if removed.is_empty() {
            return 0;
        }

        let dead: HashSet<&str> = removed.iter().map(|w| w.worker_id.as_str()).collect();
        for worker in &removed {
            warn!(
                "{}; last seen {}",
                FailureReason::WorkerHeartbeatTimeout {
                    worker_id: worker.worker_id.clone()
                }
                .as_error(),
                worker.last_heartbeat
            );
            self.metrics.workers_reaped.inc();
        }
        self.release_tasks_of(&dead);
        removed.len()
    }

    /// Remove a worker that is leaving. A task it still holds goes back to
    /// its queue without consuming a retry.
    pub fn deregister_worker(&self, worker_id: &str) -> bool {
        if self.workers.deregister(worker_id).is_none() {
            return false;
        }
        info!("Worker {} deregistered", worker_id);
        self.release_tasks_of(&HashSet::from([worker_id]));
        true
    }

    fn release_tasks_of(&self, dead: &HashSet<&str>) {
        let orphaned = self.store.select(|t| {
            t.status == TaskStatus::Running
                && t.worker_id.as_deref().is_some_and(|w| dead.contains(w))
        });
        for task_id in orphaned {
            let released = self.store.update(&task_id, |task| {
                let owner_dead = task
                    .worker_id
                    .as_deref()
                    .is_some_and(|w| dead.contains(w));
                if task.status != TaskStatus::Running || !owner_dead {
                    return Ok(None);
                }
                task.release()?;
                self.backend.enqueue(&task.queue, queue_entry(task));
                Ok(Some(task.name.clone()))
            });
            match released {
                Ok(Some(name)) => {
                    self.metrics.inc_tasks_total("released", &name);
                    info!("Released task {} back to its queue", task_id);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to release task {}: {}", task_id, e),
            }
        }
    }

    /// Fail Running tasks past their deadline. Returns how many timed out.
    pub fn sweep_timeouts(&self) -> usize {
        let now = Utc::now();
        let expired = self.store.select(|t| t.is_timed_out(now));
        let mut count = 0;

        for task_id in expired {
            let error = FailureReason::TaskExecutionTimeout.as_error();
            let outcome = self.store.update(&task_id, |task| {
                if !task.is_timed_out(now) {
                    return Ok(None);
                }
                let worker = task.worker_id.clone();
                let decision = task.fail(error.clone())?;
                if decision == RetryDecision::Retry {
                    self.schedule_retry(task);
                }
                Ok(Some((worker, decision, task.name.clone(), task.retry_count)))
            });

            match outcome {
                Ok(Some((worker, decision, name, retry_count))) => {
                    if let Some(worker) = worker {
                        self.workers.finish_task(&worker, &task_id, false);
                    }
                    warn!("Task {} exceeded its execution deadline", task_id);
                    self.record_failure(&task_id, &name, decision, retry_count, &error);
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to time out task {}: {}", task_id, e),
            }
        }
        count
    }

    /// Move exhausted failures to Dead. Returns how many moved.
    pub fn sweep_dead_letters(&self) -> usize {
        let exhausted = self
            .store
            .select(|t| t.status == TaskStatus::Failed && !t.can_retry());
        let mut count = 0;

        for task_id in exhausted {
            let settled = self.store.update(&task_id, |task| {
                if task.status != TaskStatus::Failed {
                    return Ok(None);
                }
                task.mark_dead()?;
                Ok(Some(Settled::of(task)))
            });
            match settled {
                Ok(Some(settled)) => {
                    self.on_settled(&task_id, TaskStatus::Dead, &settled);
                    warn!("Task {} moved to dead letter queue", task_id);
                    count += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to dead-letter task {}: {}", task_id, e),
            }
        }
        count
    }

    /// Queue every scheduled task that is due. Returns how many were queued.
    pub fn promote_due_tasks(&self) -> usize {
        let mut promoted = 0;
        for task_id in self.scheduler.pop_due(Utc::now()) {
            let queued = self.store.update(&task_id, |task| match task.status {
                TaskStatus::Pending => {
                    self.backend.enqueue(&task.queue, queue_entry(task));
                    Ok(true)
                }
                TaskStatus::Retrying => {
                    task.requeue()?;
                    self.backend.enqueue(&task.queue, queue_entry(task));
                    Ok(true)
                }
                _ => Ok(false),
            });
            match queued {
                Ok(true) => {
                    debug!("Task {} is due and was queued", task_id);
                    promoted += 1;
                }
                Ok(false) => debug!("Suppressed queue insertion of task {}", task_id),
                Err(e) => debug!("Dropping scheduled task {}: {}", task_id, e),
            }
        }
        promoted
    }

    /// Purge expired dedupe keys, old terminal tasks, compact the journal
    /// and refresh gauges.
    pub fn housekeeping(&self) {
        let keys = self.dedup.purge_expired();
        self.limiter.purge();
        let tasks = self.purge_old_tasks();
        if let Err(e) = self
            .store
            .compact_if_needed(self.config.persistence.compact_after)
        {
            error!("Journal compaction failed: {}", e);
        }
        self.refresh_metrics();
        if keys > 0 || tasks > 0 {
            debug!("Housekeeping purged {} dedupe keys and {} tasks", keys, tasks);
        }
    }

    /// Drop terminal tasks past the retention period. Children go once
    /// their parent is gone.
    fn purge_old_tasks(&self) -> usize {
        let cutoff =
            Utc::now() - chrono::Duration::days(self.config.persistence.completed_task_retention_days);
        let mut candidates = Vec::new();
        for task in self.store.collect(|t| {
            t.status.is_terminal() && t.completed_at.is_some_and(|at| at < cutoff)
        }) {
            candidates.push((task.id, task.parent_task_id));
        }

        let mut purged = 0;
        for (task_id, parent) in candidates {
            if parent.is_some_and(|p| self.store.contains(&p)) {
                continue;
            }
            if self.store.purge(&task_id).is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Cleaned up {} old tasks", purged);
        }
        purged
    }

    pub fn refresh_metrics(&self) {
        let counts = self.store.count_by_status();
        let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0) as i64;
        self.metrics.tasks_pending.set(count(TaskStatus::Pending));
        self.metrics.tasks_in_progress.set(count(TaskStatus::Running));
        self.metrics.tasks_dead.set(count(TaskStatus::Dead));
        self.metrics
            .workers_connected
            .set(self.workers.count_alive() as i64);
        self.metrics.update_queue_depth(&self.backend.stats());
    }

    /// Flush the journal to disk
    pub fn sync(&self) -> Result<()> {
        if let Some(journal) = self.store.journal() {
            journal.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn broker() -> Broker {
        Broker::new(BrokerConfig::default()).unwrap()
    }

    fn submit(broker: &Broker, name: &str, opts: SubmitOptions) -> TaskId {
        broker
            .submit_task(name, json!({}), opts)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_submit_routes_and_queues() {
        let broker = broker();
        let id = submit(&broker, "job", SubmitOptions::new().tag("urgent"));

        let task = broker.get_task(&id).unwrap();
        assert_eq!(task.queue, QueueName::URGENT);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(broker.get_queue_stats()[&QueueName::new("urgent")].pending, 1);
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let broker = broker();
        let err = broker
            .submit("job", json!({}), SubmitOptions::new().parent(uuid::Uuid::new_v4()))
            .unwrap_err();
        assert!(matches!(err, TaskError::Validation(_)));
    }

    #[test]
    fn test_claim_complete_and_stale_report() {
        let broker = broker();
        let id = submit(&broker, "job", SubmitOptions::new());

        let claimed = broker.claim("w1").unwrap();
        assert_eq!(claimed.task.id, id);
        assert_eq!(claimed.lease.attempt, 1);
        // One task per worker at a time
        assert!(broker.claim("w1").is_none());

        assert!(broker.complete(&claimed.lease, json!("ok")).unwrap());
        assert!(!broker.complete(&claimed.lease, json!("again")).unwrap());

        let task = broker.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.result, Some(json!("ok")));
        let worker = &broker.get_worker_stats()[0];
        assert_eq!(worker.tasks_completed, 1);
        assert_eq!(worker.current_task_id, None);
    }

    #[test]
    fn test_fail_requeues_until_exhausted() {
        let broker = broker();
        let id = submit(&broker, "job", SubmitOptions::new().max_retries(2));

        let first = broker.claim("w").unwrap();
        assert!(broker.fail(&first.lease, "boom").unwrap());
        assert_eq!(broker.get_task(&id).unwrap().status, TaskStatus::Pending);

        let second = broker.claim("w").unwrap();
        assert_eq!(second.lease.attempt, 2);
        broker.fail(&second.lease, "boom").unwrap();
        let task = broker.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);

        assert_eq!(broker.sweep_dead_letters(), 1);
        assert_eq!(broker.dead_letters().len(), 1);
        assert!(broker.claim("w").is_none());
    }

    #[test]
    fn test_retry_backoff_goes_through_scheduler() {
        let mut config = BrokerConfig::default();
        config.tasks.retry_backoff = Some(crate::config::BackoffConfig {
            base_delay_ms: 0,
            max_delay_ms: 0,
        });
        let broker = Broker::new(config).unwrap();
        let id = submit(&broker, "job", SubmitOptions::new());

        let claimed = broker.claim("w").unwrap();
        broker.fail(&claimed.lease, "boom").unwrap();
        assert_eq!(broker.get_task(&id).unwrap().status, TaskStatus::Retrying);
        assert!(broker.claim("w").is_none());

        assert_eq!(broker.promote_due_tasks(), 1);
        assert_eq!(broker.get_task(&id).unwrap().status, TaskStatus::Pending);
        assert_eq!(broker.claim("w").unwrap().task.id, id);
    }

    #[test]
    fn test_cancel_running_discards_completion() {
        let broker = broker();
        let id = submit(&broker, "job", SubmitOptions::new());
        let claimed = broker.claim("w").unwrap();

        assert!(broker.cancel(&id).unwrap());
        assert!(!broker.cancel(&id).unwrap());
        assert!(!broker.complete(&claimed.lease, json!(1)).unwrap());
        assert_eq!(broker.get_task(&id).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(
            broker.cancel(&uuid::Uuid::new_v4()),
            Err(TaskError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_cancel_recurses_to_children() {
        let broker = broker();
        let parent = submit(&broker, "parent", SubmitOptions::new());
        let child = submit(&broker, "child", SubmitOptions::new().parent(parent));
        let grandchild = submit(&broker, "child", SubmitOptions::new().parent(child));

        broker.cancel(&parent).unwrap();
        for id in [parent, child, grandchild] {
            assert_eq!(broker.get_task(&id).unwrap().status, TaskStatus::Cancelled);
        }
        assert!(broker.claim("w").is_none());
    }

    #[test]
    fn test_progress() {
        let broker = broker();
        let parent = submit(&broker, "parent", SubmitOptions::new().priority(9));
        assert_eq!(broker.get_progress(&parent).unwrap().progress, 0.0);

        let claimed = broker.claim("w").unwrap();
        assert_eq!(broker.get_progress(&parent).unwrap().progress, 50.0);

        let a = submit(&broker, "child", SubmitOptions::new().parent(parent));
        let _b = submit(&broker, "child", SubmitOptions::new().parent(parent));
        broker.complete(&claimed.lease, json!(null)).unwrap();

        let child = broker.claim("w2").unwrap();
        assert_eq!(child.task.id, a);
        broker.complete(&child.lease, json!(null)).unwrap();

        let progress = broker.get_progress(&parent).unwrap();
        assert_eq!(progress.total_children, 2);
        assert_eq!(progress.completed_children, 1);
        assert_eq!(progress.progress, 50.0);
    }

    #[test]
    fn test_reprocess_dead() {
        let broker = broker();
        let id = submit(
            &broker,
            "job",
            SubmitOptions::new().max_retries(0).dedupe_key("only-once"),
        );
        let claimed = broker.claim("w").unwrap();
        broker.fail(&claimed.lease, "boom").unwrap();
        broker.sweep_dead_letters();

        let again = broker.reprocess_dead(&id).unwrap().task_id().unwrap();
        assert_ne!(again, id);
        let task = broker.get_task(&again).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.dedupe_key.as_deref(), Some("only-once"));

        assert!(matches!(
            broker.reprocess_dead(&again),
            Err(TaskError::Validation(_))
        ));
    }

    #[test]
    fn test_housekeeping_refreshes_gauges() {
        let broker = broker();
        submit(&broker, "job", SubmitOptions::new());
        broker.housekeeping();
        assert_eq!(broker.metrics().tasks_pending.get(), 1);
    }

    #[test]
    fn test_deregister_releases_held_task() {
        let broker = broker();
        let id = submit(&broker, "job", SubmitOptions::new());
        broker.claim("leaving").unwrap();

        assert!(broker.deregister_worker("leaving"));
        assert!(!broker.deregister_worker("leaving"));
        let task = broker.get_task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(broker.get_worker_stats().is_empty());
        assert_eq!(broker.claim("other").unwrap().task.id, id);
    }

    #[test]
    fn test_claim_rotates_across_queues() {
        let broker = broker();
        let batch_low = submit(&broker, "job", SubmitOptions::new().tag("batch").priority(1));
        let default_first = submit(&broker, "job", SubmitOptions::new());
        let urgent_low = submit(&broker, "job", SubmitOptions::new().tag("urgent").priority(2));
        let batch_high = submit(&broker, "job", SubmitOptions::new().tag("batch").priority(4));
        let default_second = submit(&broker, "job", SubmitOptions::new());
        let urgent_high = submit(&broker, "job", SubmitOptions::new().tag("urgent").priority(8));

        let claimed: Vec<(TaskId, QueueName)> = (0..6)
            .map(|i| {
                let claimed = broker.claim(&format!("w{}", i)).unwrap();
                (claimed.task.id, claimed.task.queue)
            })
            .collect();

        // Queues are visited in name order, one per claim; priority then
        // submission order within each
        assert_eq!(
            claimed,
            vec![
                (batch_high, QueueName::new(QueueName::BATCH)),
                (default_first, QueueName::new(QueueName::DEFAULT)),
                (urgent_high, QueueName::new(QueueName::URGENT)),
                (batch_low, QueueName::new(QueueName::BATCH)),
                (default_second, QueueName::new(QueueName::DEFAULT)),
                (urgent_low, QueueName::new(QueueName::URGENT)),
            ]
        );
        assert!(broker.claim("w6").is_none());

        // An empty queue at the cursor falls through to the next one
        let late = submit(&broker, "job", SubmitOptions::new());
        assert_eq!(broker.claim("w7").unwrap().task.id, late);
    }

    #[test]
    fn test_rate_limit_checked_before_dedupe() {
        let mut config = BrokerConfig::default();
        config.admission.rate_limit = 1;
        let broker = Broker::new(config).unwrap();

        let first = submit(&broker, "job", SubmitOptions::new().dedupe_key("k"));
        assert!(matches!(
            broker
                .submit("job", json!({}), SubmitOptions::new().dedupe_key("k"))
                .unwrap(),
            Submission::RateLimited { .. }
        ));
        assert!(matches!(
            broker
                .submit("job", json!({}), SubmitOptions::new().dedupe_key("fresh"))
                .unwrap(),
            Submission::RateLimited { .. }
        ));

        // Every key holder is an admitted task
        match broker
            .submit("other", json!({}), SubmitOptions::new().dedupe_key("k"))
            .unwrap()
        {
            Submission::Duplicate { existing } => {
                assert_eq!(existing, first);
                assert!(broker.get_task(&existing).is_ok());
            }
            other => panic!("Expected Duplicate, got {:?}", other),
        }
        assert!(broker
            .submit_task("another", json!({}), SubmitOptions::new().dedupe_key("fresh"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_out_of_range_delay_and_timeout() {
        let broker = broker();
        for opts in [
            SubmitOptions::new().delay(std::time::Duration::from_millis(9e18 as u64)),
            SubmitOptions::new().timeout_secs(10_000_000_000_000),
        ] {
            assert!(matches!(
                broker.submit("job", json!({}), opts),
                Err(TaskError::Validation(_))
            ));
        }
        assert!(matches!(
            broker.submit("job", json!({"timeout": 1e17}), SubmitOptions::new()),
            Err(TaskError::Validation(_))
        ));
        assert_eq!(
            broker
                .metrics()
                .admission_rejections
                .with_label_values(&["invalid"])
                .get(),
            3
        );

        let id = submit(&broker, "job", SubmitOptions::new().timeout_secs(task_queue_core::MAX_TIMEOUT_SECS));
        broker.claim("w").unwrap();
        assert_eq!(broker.sweep_timeouts(), 0);
        assert_eq!(broker.get_task(&id).unwrap().status, TaskStatus::Running);
    }
}
