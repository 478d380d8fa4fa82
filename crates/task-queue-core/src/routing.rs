//! Queue routing.
//!
//! Every admitted task is assigned to exactly one named queue. The rule is
//! evaluated once, first match wins:
//!
//! 1. tag `urgent`      -> `urgent`
//! 2. tag `batch`       -> `batch`
//! 3. priority > 5      -> `high_priority`
//! 4. anything else     -> `default`
//!
//! Retries and releases after a worker failure reuse the stored queue.

use crate::Priority;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

/// Name of a logical queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub const URGENT: &'static str = "urgent";
    pub const BATCH: &'static str = "batch";
    pub const HIGH_PRIORITY: &'static str = "high_priority";
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        QueueName(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(name: &str) -> Self {
        QueueName(name.to_string())
    }
}

impl From<String> for QueueName {
    fn from(name: String) -> Self {
        QueueName(name)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for QueueName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for QueueName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for QueueName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Pick the queue for a task
pub fn route(tags: &BTreeSet<String>, priority: Priority) -> QueueName {
    let name = if tags.contains(QueueName::URGENT) {
        QueueName::URGENT
    } else if tags.contains(QueueName::BATCH) {
        QueueName::BATCH
    } else if priority.is_high() {
        QueueName::HIGH_PRIORITY
    } else {
        QueueName::DEFAULT
    };
    QueueName::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_matching_rule_wins() {
        assert_eq!(route(&tags(&["batch", "urgent"]), Priority::new(0)), QueueName::URGENT);
        assert_eq!(route(&tags(&["batch"]), Priority::new(10)), QueueName::BATCH);
        assert_eq!(route(&tags(&["reports"]), Priority::new(6)), QueueName::HIGH_PRIORITY);
        assert_eq!(route(&tags(&[]), Priority::new(5)), QueueName::DEFAULT);
        assert_eq!(route(&tags(&[]), Priority::new(-4)), QueueName::DEFAULT);
    }

    #[test]
    fn test_queue_name_comparisons() {
        let name = QueueName::from("batch");
        assert_eq!(name, "batch");
        assert_eq!(name.as_str(), QueueName::BATCH);
        assert_eq!(name.to_string(), "batch");
    }
}
