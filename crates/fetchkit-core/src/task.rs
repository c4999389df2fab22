//! Task records and their state machine vocabulary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::verify::HashAlgorithm;

/// Task identifier (row id in the store).
pub type TaskId = i64;

/// Lifecycle state of a task, stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Downloading,
    Paused,
    Stopped,
    Verifying,
    Completed,
    Error,
    NeedsAuth,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Verifying => "verifying",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
            TaskStatus::NeedsAuth => "needs_auth",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "scheduled" => TaskStatus::Scheduled,
            "downloading" => TaskStatus::Downloading,
            "paused" => TaskStatus::Paused,
            "stopped" => TaskStatus::Stopped,
            "verifying" => TaskStatus::Verifying,
            "completed" => TaskStatus::Completed,
            "needs_auth" => TaskStatus::NeedsAuth,
            _ => TaskStatus::Error,
        }
    }

    /// States from which `resume` may re-queue the task.
    pub fn is_resumable(self) -> bool {
        matches!(
            self,
            TaskStatus::Paused | TaskStatus::Stopped | TaskStatus::Error | TaskStatus::NeedsAuth
        )
    }

    /// States that sit in the waiting queue.
    pub fn is_queued(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }
}

/// Scheduling priority. Affects the bandwidth shaper only; queue position is
/// governed by `queue_order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "low" => Priority::Low,
            "high" => Priority::High,
            _ => Priority::Normal,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Durable task record plus live gauges.
///
/// `progress`, `speed_bps` and `eta_secs` are derived at read time (and, for
/// active tasks, overlaid with the running executor's counters); the rest is
/// the persisted record.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Pre-joined `Cookie:` header value, if any.
    pub cookie: Option<String>,
    /// Directory the destination is placed under (category subdir included
    /// at resolve time).
    pub dest_dir: String,
    /// Final absolute path. Empty until the first probe resolves a filename.
    pub save_path: String,
    pub filename: String,
    pub category: String,
    pub status: TaskStatus,
    pub priority: Priority,
    /// Position among queued tasks; compacted to 1..N after any reorder.
    pub queue_order: i64,
    pub total_size: i64,
    pub downloaded: i64,
    /// Opaque resume blob (see `resume::ResumeState`).
    pub meta: Option<Vec<u8>>,
    pub expected_hash: Option<String>,
    pub hash_algorithm: Option<HashAlgorithm>,
    /// RFC3339 instant; a future value keeps the task in `scheduled`.
    pub start_time: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,

    pub progress: f64,
    pub speed_bps: u64,
    pub eta_secs: Option<u64>,
}

impl Task {
    /// Fraction complete in [0.0, 1.0] from the durable counters.
    pub fn fraction(&self) -> f64 {
        if self.total_size <= 0 {
            return if self.status == TaskStatus::Completed {
                1.0
            } else {
                0.0
            };
        }
        (self.downloaded as f64 / self.total_size as f64).min(1.0)
    }
}

/// Fields supplied when enqueuing a new task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookie: Option<String>,
    pub dest_dir: String,
    pub filename: Option<String>,
    pub category: String,
    pub priority: Priority,
    pub expected_hash: Option<String>,
    pub hash_algorithm: Option<HashAlgorithm>,
    pub start_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            TaskStatus::Pending,
            TaskStatus::Scheduled,
            TaskStatus::Downloading,
            TaskStatus::Paused,
            TaskStatus::Stopped,
            TaskStatus::Verifying,
            TaskStatus::Completed,
            TaskStatus::Error,
            TaskStatus::NeedsAuth,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), s);
        }
    }

    #[test]
    fn unknown_status_maps_to_error() {
        assert_eq!(TaskStatus::from_str("bogus"), TaskStatus::Error);
    }

    #[test]
    fn resumable_states() {
        assert!(TaskStatus::Paused.is_resumable());
        assert!(TaskStatus::NeedsAuth.is_resumable());
        assert!(!TaskStatus::Downloading.is_resumable());
        assert!(!TaskStatus::Completed.is_resumable());
    }

    #[test]
    fn priority_roundtrip_and_default() {
        assert_eq!(Priority::from_str("low"), Priority::Low);
        assert_eq!(Priority::from_str("high"), Priority::High);
        assert_eq!(Priority::from_str("anything"), Priority::Normal);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
