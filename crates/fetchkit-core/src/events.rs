//! Engine events. Best-effort fan-out; subscribers may lag or ignore.

use serde::Serialize;

use crate::task::TaskId;

/// One engine event. Every task event carries the task id; progress carries
/// the live gauges as well.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Progress {
        id: TaskId,
        progress: f64,
        speed_bps: u64,
        eta_secs: Option<u64>,
        downloaded: u64,
        total: u64,
    },
    Paused { id: TaskId },
    Stopped { id: TaskId },
    Completed { id: TaskId },
    Error { id: TaskId, message: String },
    Verifying { id: TaskId },
    UrlUpdated { id: TaskId },
    NeedsAuth { id: TaskId },
    Deleted { id: TaskId },
    QueueReordered,
}

impl Event {
    /// Wire name, `download:*` / `queue:*` style.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Progress { .. } => "download:progress",
            Event::Paused { .. } => "download:paused",
            Event::Stopped { .. } => "download:stopped",
            Event::Completed { .. } => "download:completed",
            Event::Error { .. } => "download:error",
            Event::Verifying { .. } => "download:verifying",
            Event::UrlUpdated { .. } => "download:url_updated",
            Event::NeedsAuth { .. } => "download:needs_auth",
            Event::Deleted { .. } => "download:deleted",
            Event::QueueReordered => "queue:reordered",
        }
    }

    /// Task id, when the event concerns a single task.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::Progress { id, .. }
            | Event::Paused { id }
            | Event::Stopped { id }
            | Event::Completed { id }
            | Event::Error { id, .. }
            | Event::Verifying { id }
            | Event::UrlUpdated { id }
            | Event::NeedsAuth { id }
            | Event::Deleted { id } => Some(*id),
            Event::QueueReordered => None,
        }
    }
}
