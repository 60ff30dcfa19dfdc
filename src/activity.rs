//! Activity log
//!
//! Bounded ring buffer of recent bridge events for diagnostics. It has no
//! effect on protocol behavior; entries are mirrored to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{error, info};

/// Category of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    /// Lifecycle and administrative events
    Info,
    /// Frame sent to the external process
    Sent,
    /// Frame received from the external process
    Received,
    /// Any failure
    Error,
}

/// One diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Utc>,
    /// Entry text
    pub message: String,
    /// Entry category
    pub category: LogCategory,
}

/// Fixed-capacity ring buffer, most recent first
#[derive(Debug, Clone)]
pub struct ActivityLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl ActivityLog {
    /// Create a log holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest when full
    pub fn record(&mut self, category: LogCategory, message: impl Into<String>) {
        let message = message.into();
        match category {
            LogCategory::Error => error!(category = "error", "{}", message),
            LogCategory::Sent => info!(category = "sent", "{}", message),
            LogCategory::Received => info!(category = "received", "{}", message),
            LogCategory::Info => info!(category = "info", "{}", message),
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_back();
        }
        self.entries.push_front(LogEntry {
            timestamp: Utc::now(),
            message,
            category,
        });
    }

    /// Shorthand for an `Info` entry
    pub fn info(&mut self, message: impl Into<String>) {
        self.record(LogCategory::Info, message);
    }

    /// Shorthand for an `Error` entry
    pub fn error(&mut self, message: impl Into<String>) {
        self.record(LogCategory::Error, message);
    }

    /// Up to `limit` most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().take(limit).cloned().collect()
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_recent_first() {
        let mut log = ActivityLog::new(10);
        log.info("first");
        log.record(LogCategory::Sent, "second");

        let entries = log.recent(10);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "second");
        assert_eq!(entries[0].category, LogCategory::Sent);
        assert_eq!(entries[1].message, "first");
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut log = ActivityLog::new(3);
        for i in 0..5 {
            log.info(format!("entry {}", i));
        }

        assert_eq!(log.len(), 3);
        let messages: Vec<_> = log.recent(10).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["entry 4", "entry 3", "entry 2"]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut log = ActivityLog::new(0);
        assert_eq!(log.capacity(), 1);
        log.error("boom");
        log.error("bang");
        assert_eq!(log.recent(5)[0].message, "bang");
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_category_serialization() {
        assert_eq!(
            serde_json::to_string(&LogCategory::Received).unwrap(),
            r#""received""#
        );
    }
}
