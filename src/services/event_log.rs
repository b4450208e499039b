//! User-visible scheduler log.
//!
//! Every state transition and failure decision appends a timestamped entry
//! here, in addition to the structured `tracing` output. The log is shared
//! with whatever front-end hosts the scheduler, so it sits behind a lock.

use std::sync::Arc;

use parking_lot::RwLock;

/// A single log entry with timestamp and message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Append-only in-memory log, cheap to clone and share.
#[derive(Clone, Default)]
pub struct EventLog {
    entries: Arc<RwLock<Vec<LogEntry>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        self.entries.write().push(LogEntry {
            timestamp: chrono::Utc::now(),
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    /// Highlighted entry for milestones the operator watches for, like a job
    /// or a whole session finishing.
    pub fn success(&self, message: impl Into<String>) {
        self.append(LogLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.append(LogLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().clone()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// True when any entry contains the given fragment. Test helper, but
    /// also used by front-ends for simple filtering.
    pub fn contains(&self, fragment: &str) -> bool {
        self.entries
            .read()
            .iter()
            .any(|e| e.message.contains(fragment))
    }
}
