use crate::{Task, TaskId, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of a submission that passed validation.
///
/// Duplicates and rate limiting are expected, frequent outcomes and are
/// reported as variants, not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// A new task was created
    Accepted(TaskId),
    /// The dedupe key is still active; no task was created
    Duplicate { existing: TaskId },
    /// The admission window for this task name is full
    RateLimited { retry_after: std::time::Duration },
}

impl Submission {
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Submission::Accepted(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Submission::Duplicate { .. })
    }
}

/// What `get_result` observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time spent in the last attempt, in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// The wait ended before the task reached a terminal state.
    /// This is not a task failure.
    pub timed_out: bool,
}

impl ResultView {
    pub fn from_task(task: &Task, timed_out: bool) -> Self {
        ResultView {
            task_id: task.id,
            status: task.status,
            result: task.result.clone(),
            error: task.error.clone(),
            duration_ms: task.duration().map(|d| d.as_millis() as u64),
            timed_out,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub task_id: TaskId,
    pub status: TaskStatus,
    /// 0-100
    pub progress: f64,
    pub total_children: usize,
    pub completed_children: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerView {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task_id: Option<TaskId>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub cpu_usage_percent: f32,
    pub memory_usage_mb: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    /// Pending count per priority value
    pub priority_breakdown: BTreeMap<i32, usize>,
}
