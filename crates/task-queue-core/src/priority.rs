use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Priority of a task.
/// Higher numerical values indicate higher priority; negative values are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(i32);

impl Priority {
    /// Priorities strictly above this value are routed to the high priority queue.
    pub const HIGH_THRESHOLD: i32 = 5;

    /// Create a new priority value
    pub fn new(value: i32) -> Self {
        Priority(value)
    }

    /// Get the raw priority value
    pub fn value(&self) -> i32 {
        self.0
    }

    /// Check if this priority qualifies for the high priority queue
    pub fn is_high(&self) -> bool {
        self.0 > Self::HIGH_THRESHOLD
    }
}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority(0)
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        Priority(value)
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
