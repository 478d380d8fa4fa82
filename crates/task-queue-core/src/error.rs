use crate::{TaskId, TaskStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Rate limit exceeded for task '{name}', retry after {retry_after_ms}ms")]
    RateLimitExceeded { name: String, retry_after_ms: u64 },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl TaskError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TaskError::Validation(msg.into())
    }

    /// True for errors the caller caused and can fix or back off from.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            TaskError::Validation(_)
                | TaskError::PayloadTooLarge { .. }
                | TaskError::RateLimitExceeded { .. }
                | TaskError::TaskNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// Why a running task stopped without a handler result.
///
/// These never reach submitters as errors; they end up as the task's
/// recorded failure or drive a release back to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The owning worker missed its heartbeat window.
    WorkerHeartbeatTimeout { worker_id: String },
    /// The task stayed Running past its deadline.
    TaskExecutionTimeout,
    /// The handler returned an error or panicked.
    HandlerException(String),
}

impl FailureReason {
    /// Text stored in `Task::error`.
    pub fn as_error(&self) -> String {
        match self {
            FailureReason::WorkerHeartbeatTimeout { worker_id } => {
                format!("worker {} heartbeat timeout", worker_id)
            }
            FailureReason::TaskExecutionTimeout => "timeout".to_string(),
            FailureReason::HandlerException(msg) => msg.clone(),
        }
    }
}
