mod backend;
mod error;
mod priority;
pub mod routing;
mod task;
mod views;

pub use backend::{QueueBackend, QueueEntry};
pub use error::{FailureReason, Result, TaskError};
pub use priority::Priority;
pub use routing::QueueName;
pub use task::{
    RetryDecision, SubmitOptions, Task, TaskBuilder, TaskId, TaskName, TaskStatus,
    DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_SECS, MAX_DELAY, MAX_TIMEOUT_SECS, TIMEOUT_METADATA_KEY,
};
pub use views::{ProgressView, QueueStats, ResultView, Submission, WorkerStatus, WorkerView};

pub const MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024; // 10MB
