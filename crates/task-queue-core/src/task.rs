use crate::{Priority, QueueName, Result, TaskError, MAX_PAYLOAD_SIZE};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task
pub type TaskId = Uuid;

/// Handler key a task is dispatched to (e.g., "send_email", "process_image")
pub type TaskName = String;

/// Default execution deadline for a running task.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Default number of retries granted to a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Payload key that overrides the execution deadline, in seconds.
pub const TIMEOUT_METADATA_KEY: &str = "timeout";

/// Longest execution deadline a task may ask for (30 days).
pub const MAX_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest submission delay (365 days).
pub const MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(365 * 24 * 60 * 60);

const MAX_NAME_LEN: usize = 255;

/// Task status in the queue system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in its queue (or for its delay to elapse)
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Handler returned a result
    Completed,
    /// Last attempt failed; either retrying or waiting for the dead-letter sweep
    Failed,
    /// Failed with retries left, waiting to go back to its queue
    Retrying,
    /// Retries exhausted; only manual reprocessing brings the work back
    Dead,
    /// Cancelled before completion
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Dead => "dead",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "retrying" => Some(TaskStatus::Retrying),
            "dead" => Some(TaskStatus::Dead),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    /// Completed, Dead and Cancelled never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Dead | TaskStatus::Cancelled
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    /// The lifecycle state machine.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                // worker died: released without consuming a retry
                | (Running, Pending)
                | (Failed, Retrying)
                | (Failed, Dead)
                | (Retrying, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to a task after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Status is now Retrying; the task goes back to its queue.
    Retry,
    /// Retries are used up; the task stays Failed until the dead-letter sweep.
    Exhausted,
}

/// Complete task definition with all metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,

    /// Handler key
    pub name: TaskName,

    /// Opaque structured payload handed to the handler
    pub payload: Value,

    /// Routing tags ("urgent", "batch", ...)
    pub tags: BTreeSet<String>,

    /// Higher = more urgent
    pub priority: Priority,

    /// Admission order; breaks priority ties (lower first)
    pub sequence: u64,

    /// Queue chosen at admission, fixed for the task's lifetime
    pub queue: QueueName,

    /// Current status
    pub status: TaskStatus,

    pub created_at: DateTime<Utc>,

    /// When the task may first enter its queue
    pub eligible_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// Start of the current (or last) attempt
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached Completed, Failed, Dead or Cancelled
    pub completed_at: Option<DateTime<Utc>>,

    /// Failures consumed so far; never exceeds `max_retries`
    pub retry_count: u32,

    pub max_retries: u32,

    /// Number of claims; the lease generation of the current attempt
    pub attempts: u32,

    /// Execution deadline in seconds, measured from `started_at`
    pub timeout_secs: u64,

    /// Worker holding the task; set only while Running
    pub worker_id: Option<String>,

    pub result: Option<Value>,

    /// Last failure description
    pub error: Option<String>,

    pub parent_task_id: Option<TaskId>,

    pub child_task_ids: Vec<TaskId>,

    pub dedupe_key: Option<String>,
}

impl Task {
    /// Create a new task builder
    pub fn builder(name: impl Into<TaskName>, payload: Value) -> TaskBuilder {
        TaskBuilder::new(name.into(), payload)
    }

    /// Whether the task is still held back by its delay
    pub fn is_delayed(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.eligible_at > now
    }

    /// Check if a failure would still be retried
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Deadline of the current attempt
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let timeout = i64::try_from(self.timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)?;
        started.checked_add_signed(timeout)
    }

    /// Running past its deadline
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running && self.deadline().is_some_and(|d| d <= now)
    }

    /// Time spent in the last attempt, or so far if still running
    pub fn duration(&self) -> Option<std::time::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - started).to_std().ok()
    }

    fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark task as claimed by a worker
    pub fn claim(&mut self, worker_id: String) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        self.worker_id = Some(worker_id);
        self.started_at = Some(self.updated_at);
        self.completed_at = None;
        self.attempts += 1;
        Ok(())
    }

    /// Mark task as completed successfully
    pub fn complete(&mut self, result: Value) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(self.updated_at);
        self.worker_id = None;
        Ok(())
    }

    /// Record a failed attempt and apply the retry rule.
    ///
    /// A failure consumes one retry while any is left. The task is retried
    /// only if retries remain after that, so `max_retries` failures in a row
    /// exhaust it and `retry_count` never passes `max_retries`.
    pub fn fail(&mut self, error: String) -> Result<RetryDecision> {
        self.transition(TaskStatus::Failed)?;
        self.error = Some(error);
        self.completed_at = Some(self.updated_at);
        self.worker_id = None;

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
        }
        if self.retry_count < self.max_retries {
            self.transition(TaskStatus::Retrying)?;
            Ok(RetryDecision::Retry)
        } else {
            Ok(RetryDecision::Exhausted)
        }
    }

    /// Retrying -> Pending, ready to be queued again
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)?;
        self.completed_at = None;
        Ok(())
    }

    /// Release task back to pending after its worker died; no retry is consumed
    pub fn release(&mut self) -> Result<()> {
        self.transition(TaskStatus::Pending)?;
        self.worker_id = None;
        self.started_at = None;
        Ok(())
    }

    /// Move an exhausted failure to the dead-letter sink
    pub fn mark_dead(&mut self) -> Result<()> {
        if self.retry_count < self.max_retries {
            return Err(TaskError::InvalidTransition {
                task_id: self.id,
                from: self.status,
                to: TaskStatus::Dead,
            });
        }
        self.transition(TaskStatus::Dead)?;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.worker_id = None;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }
}

/// Caller-facing knobs of a submission.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub priority: Priority,
    pub delay: Option<std::time::Duration>,
    pub parent_task_id: Option<TaskId>,
    pub tags: Vec<String>,
    pub dedupe_key: Option<String>,
    pub max_retries: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }
}

/// Builder for creating tasks with custom configuration
pub struct TaskBuilder {
    name: TaskName,
    payload: Value,
    priority: Priority,
    tags: BTreeSet<String>,
    delay: Option<std::time::Duration>,
    parent_task_id: Option<TaskId>,
    dedupe_key: Option<String>,
    max_retries: u32,
    timeout_secs: Option<u64>,
    default_timeout_secs: u64,
    sequence: u64,
    queue: Option<QueueName>,
}

impl TaskBuilder {
    pub fn new(name: TaskName, payload: Value) -> Self {
        TaskBuilder {
            name,
            payload,
            priority: Priority::default(),
            tags: BTreeSet::new(),
            delay: None,
            parent_task_id: None,
            dedupe_key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_secs: None,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
            sequence: 0,
            queue: None,
        }
    }

    /// Copy every caller-supplied option; unset ones keep the builder's value.
    pub fn options(mut self, opts: &SubmitOptions) -> Self {
        self.priority = opts.priority;
        self.tags.extend(opts.tags.iter().cloned());
        self.delay = opts.delay;
        self.parent_task_id = opts.parent_task_id;
        self.dedupe_key = opts.dedupe_key.clone();
        if let Some(max_retries) = opts.max_retries {
            self.max_retries = max_retries;
        }
        if opts.timeout_secs.is_some() {
            self.timeout_secs = opts.timeout_secs;
        }
        self
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Deadline used when neither the options nor the payload set one
    pub fn default_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = secs;
        self
    }

    pub fn sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn queue(mut self, queue: QueueName) -> Self {
        self.queue = Some(queue);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TaskError::validation("task name must not be empty"));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(TaskError::validation(format!(
                "task name longer than {} bytes",
                MAX_NAME_LEN
            )));
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(TaskError::validation("tags must not be empty strings"));
        }
        if self.dedupe_key.as_deref().is_some_and(|k| k.is_empty()) {
            return Err(TaskError::validation("dedupe key must not be empty"));
        }
        if self.timeout_secs.is_some_and(|t| t > MAX_TIMEOUT_SECS) {
            return Err(TaskError::validation(format!(
                "timeout must not exceed {} seconds",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.delay.is_some_and(|d| d > MAX_DELAY) {
            return Err(TaskError::validation(format!(
                "delay must not exceed {} seconds",
                MAX_DELAY.as_secs()
            )));
        }
        let size = serde_json::to_vec(&self.payload)?.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(TaskError::PayloadTooLarge {
                max: MAX_PAYLOAD_SIZE,
                actual: size,
            });
        }
        Ok(())
    }

    fn resolve_timeout(&self) -> Result<u64> {
        if let Some(secs) = self.timeout_secs {
            return Ok(secs);
        }
        match self.payload.get(TIMEOUT_METADATA_KEY) {
            None | Some(Value::Null) => Ok(self.default_timeout_secs),
            Some(value) => value
                .as_u64()
                .or_else(|| {
                    value
                        .as_f64()
                        .filter(|v| (0.0..=MAX_TIMEOUT_SECS as f64).contains(v))
                        .map(|v| v.ceil() as u64)
                })
                .filter(|secs| *secs <= MAX_TIMEOUT_SECS)
                .ok_or_else(|| {
                    TaskError::validation(format!(
                        "payload '{}' must be between 0 and {} seconds",
                        TIMEOUT_METADATA_KEY, MAX_TIMEOUT_SECS
                    ))
                }),
        }
    }

    pub fn build(self) -> Result<Task> {
        self.validate()?;
        let timeout_secs = self.resolve_timeout()?;

        let now = Utc::now();
        let eligible_at = match self.delay {
            Some(delay) => Duration::from_std(delay)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| TaskError::validation("delay out of range"))?,
            None => now,
        };
        let queue = self
            .queue
            .unwrap_or_else(|| crate::routing::route(&self.tags, self.priority));

        Ok(Task {
            id: Uuid::new_v4(),
            name: self.name,
            payload: self.payload,
            tags: self.tags,
            priority: self.priority,
            sequence: self.sequence,
            queue,
            status: TaskStatus::Pending,
            created_at: now,
            eligible_at,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: self.max_retries,
            attempts: 0,
            timeout_secs,
            worker_id: None,
            result: None,
            error: None,
            parent_task_id: self.parent_task_id,
            child_task_ids: Vec::new(),
            dedupe_key: self.dedupe_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task(max_retries: u32) -> Task {
        Task::builder("test", json!({"n": 1}))
            .max_retries(max_retries)
            .build()
            .unwrap()
    }

    #[test]
    fn test_task_creation() {
        let task = task(3);

        assert_eq!(task.name, "test");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.timeout_secs, DEFAULT_TIMEOUT_SECS);
        assert_eq!(task.queue, QueueName::DEFAULT);
        assert!(!task.is_delayed(Utc::now()));
    }

    #[test]
    fn test_task_builder_options() {
        let opts = SubmitOptions::new()
            .priority(9)
            .tag("reports")
            .delay(std::time::Duration::from_secs(60))
            .max_retries(5)
            .timeout_secs(600)
            .dedupe_key("k1");
        let task = Task::builder("test", json!(null))
            .options(&opts)
            .build()
            .unwrap();

        assert_eq!(task.priority, Priority::new(9));
        assert_eq!(task.queue, QueueName::HIGH_PRIORITY);
        assert_eq!(task.max_retries, 5);
        assert_eq!(task.timeout_secs, 600);
        assert_eq!(task.dedupe_key.as_deref(), Some("k1"));
        assert!(task.is_delayed(Utc::now()));
    }

    #[test]
    fn test_timeout_from_payload_metadata() {
        let task = Task::builder("test", json!({"timeout": 12}))
            .build()
            .unwrap();
        assert_eq!(task.timeout_secs, 12);

        let explicit = Task::builder("test", json!({"timeout": 12}))
            .timeout_secs(40)
            .build()
            .unwrap();
        assert_eq!(explicit.timeout_secs, 40);

        let bad = Task::builder("test", json!({"timeout": "soon"})).build();
        assert!(matches!(bad, Err(TaskError::Validation(_))));
    }

    #[test]
    fn test_out_of_range_timeout_and_delay_are_rejected() {
        let huge_payload = Task::builder("test", json!({"timeout": 1e17})).build();
        assert!(matches!(huge_payload, Err(TaskError::Validation(_))));

        let huge_integer = Task::builder("test", json!({"timeout": u64::MAX})).build();
        assert!(matches!(huge_integer, Err(TaskError::Validation(_))));

        let huge_option = Task::builder("test", json!({}))
            .timeout_secs(10_000_000_000_000)
            .build();
        assert!(matches!(huge_option, Err(TaskError::Validation(_))));

        let huge_delay = Task::builder("test", json!({}))
            .options(&SubmitOptions::new().delay(std::time::Duration::from_millis(9e18 as u64)))
            .build();
        assert!(matches!(huge_delay, Err(TaskError::Validation(_))));

        let at_bound = Task::builder("test", json!({}))
            .options(&SubmitOptions::new().delay(MAX_DELAY))
            .timeout_secs(MAX_TIMEOUT_SECS)
            .build()
            .unwrap();
        assert_eq!(at_bound.timeout_secs, MAX_TIMEOUT_SECS);
        assert!(at_bound.is_delayed(Utc::now()));
    }

    #[test]
    fn test_deadline_saturates_on_overflowing_timeout() {
        let mut task = task(3);
        task.claim("w".into()).unwrap();

        task.timeout_secs = 10_000_000_000_000;
        assert!(task.deadline().is_none());
        assert!(!task.is_timed_out(Utc::now()));

        task.timeout_secs = u64::MAX;
        assert!(task.deadline().is_none());
        assert!(!task.is_timed_out(Utc::now()));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            Task::builder("  ", json!({})).build(),
            Err(TaskError::Validation(_))
        ));
        assert!(matches!(
            Task::builder("ok", json!({})).tag("").build(),
            Err(TaskError::Validation(_))
        ));
    }

    #[test]
    fn test_payload_size_limit() {
        let large = Value::String("x".repeat(MAX_PAYLOAD_SIZE + 1));
        match Task::builder("test", large).build() {
            Err(TaskError::PayloadTooLarge { .. }) => {}
            other => panic!("Expected PayloadTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut task = task(3);
        task.claim("worker-1".into()).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
        assert!(task.started_at.is_some());

        task.complete(json!("done")).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.worker_id.is_none());
        assert!(task.status.is_terminal());
        assert!(task.duration().is_some());
    }

    #[test]
    fn test_retry_bound() {
        let mut task = task(3);
        let mut decisions = Vec::new();
        for _ in 0..3 {
            task.claim("w".into()).unwrap();
            let decision = task.fail("boom".into()).unwrap();
            assert!(task.retry_count <= task.max_retries);
            if decision == RetryDecision::Retry {
                assert_eq!(task.status, TaskStatus::Retrying);
                task.requeue().unwrap();
            }
            decisions.push(decision);
        }

        assert_eq!(
            decisions,
            vec![
                RetryDecision::Retry,
                RetryDecision::Retry,
                RetryDecision::Exhausted
            ]
        );
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 3);
        task.mark_dead().unwrap();
        assert_eq!(task.status, TaskStatus::Dead);
    }

    #[test]
    fn test_zero_retries_exhaust_immediately() {
        let mut task = task(0);
        task.claim("w".into()).unwrap();
        assert_eq!(task.fail("boom".into()).unwrap(), RetryDecision::Exhausted);
        assert_eq!(task.retry_count, 0);
    }

    #[test]
    fn test_release_keeps_retry_count() {
        let mut task = task(3);
        task.claim("w".into()).unwrap();
        task.release().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.worker_id.is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut task = task(3);
        assert!(task.complete(json!(1)).is_err());
        task.cancel().unwrap();
        assert!(task.claim("w".into()).is_err());
        assert!(task.cancel().is_err());
    }

    #[test]
    fn test_timed_out() {
        let mut task = task(3);
        task.timeout_secs = 0;
        task.claim("w".into()).unwrap();
        assert!(task.is_timed_out(Utc::now()));
    }

    #[test]
    fn test_status_strings() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Retrying,
            TaskStatus::Dead,
            TaskStatus::Cancelled,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::from_str("in_progress"), None);
    }
}
