//! Job event streaming via Server-Sent Events (SSE).
//!
//! Pipeline runs publish their state transitions and batch flushes here.
//! Every entry is also emitted as a `tracing` event.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Severity of a job event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// A single job event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub job_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(job_id: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Global log broadcaster
pub static LOG_BROADCASTER: Lazy<LogBroadcaster> = Lazy::new(LogBroadcaster::new);

/// Fans job events out to every connected SSE client.
pub struct LogBroadcaster {
    sender: broadcast::Sender<LogEntry>,
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self { sender }
    }

    /// Trace the entry and send it to all subscribers.
    pub fn log(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Info | LogLevel::Success => {
                tracing::info!(job_id = %entry.job_id, "{}", entry.message)
            }
            LogLevel::Warning => tracing::warn!(job_id = %entry.job_id, "{}", entry.message),
            LogLevel::Error => tracing::error!(job_id = %entry.job_id, "{}", entry.message),
        }

        // no receivers is fine
        let _ = self.sender.send(entry);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.sender.subscribe()
    }
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub fn log_info(job_id: &str, msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::new(job_id, LogLevel::Info, msg));
}

pub fn log_success(job_id: &str, msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::new(job_id, LogLevel::Success, msg));
}

pub fn log_warning(job_id: &str, msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::new(job_id, LogLevel::Warning, msg));
}

pub fn log_error(job_id: &str, msg: impl Into<String>) {
    LOG_BROADCASTER.log(LogEntry::new(job_id, LogLevel::Error, msg));
}
