mod journal;

pub use journal::{Journal, JournalEntry, JournalRecord};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Journal error: {0}")]
    JournalError(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl From<PersistenceError> for task_queue_core::TaskError {
    fn from(err: PersistenceError) -> Self {
        task_queue_core::TaskError::Persistence(err.to_string())
    }
}
