//! Events emitted by schedulers for logging, metrics and UI subscribers.

use serde::{Deserialize, Serialize};

use crate::id::TaskId;
use crate::scheduler::priority::Priority;

/// Task and scheduler lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Enqueued { id: TaskId, priority: Priority },
    Started { id: TaskId, attempt: u32 },
    Completed { id: TaskId, result: String, duration_ms: u64 },
    Failed { id: TaskId, error: String, attempts: u32 },
    Retrying { id: TaskId, attempt: u32, delay_ms: u64, error: String },
    Cancelled { id: TaskId },
    Paused,
    Resumed,
}

impl SchedulerEvent {
    /// Task this event concerns, if any
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            SchedulerEvent::Enqueued { id, .. }
            | SchedulerEvent::Started { id, .. }
            | SchedulerEvent::Completed { id, .. }
            | SchedulerEvent::Failed { id, .. }
            | SchedulerEvent::Retrying { id, .. }
            | SchedulerEvent::Cancelled { id } => Some(*id),
            SchedulerEvent::Paused | SchedulerEvent::Resumed => None,
        }
    }

    /// Completed, failed and cancelled tasks free a slot for good
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::Completed { .. } | SchedulerEvent::Failed { .. } | SchedulerEvent::Cancelled { .. }
        )
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::Enqueued { .. } => "enqueued",
            SchedulerEvent::Started { .. } => "started",
            SchedulerEvent::Completed { .. } => "completed",
            SchedulerEvent::Failed { .. } => "failed",
            SchedulerEvent::Retrying { .. } => "retrying",
            SchedulerEvent::Cancelled { .. } => "cancelled",
            SchedulerEvent::Paused => "paused",
            SchedulerEvent::Resumed => "resumed",
        }
    }
}
