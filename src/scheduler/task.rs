//! Task record and related types

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::handler::{Metadata, SharedHandler};
use crate::id::{TaskId, now_ms};
use crate::scheduler::priority::Priority;

/// Status of a task's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,
    /// Handler attempt in flight
    Running,
    /// Handler returned a result
    Completed,
    /// Retries exhausted
    Failed,
    /// Cancelled by the caller
    Cancelled,
    /// Waiting out a backoff before going back to the queue
    Retrying,
}

impl TaskStatus {
    /// Returns true if the task will never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

/// One schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload: String,
    pub priority: Priority,
    pub target_model: String,
    pub metadata: Metadata,
    pub status: TaskStatus,
    /// Attempts started so far
    pub attempts: u32,
    pub max_retries: u32,
    /// Per-attempt timeout; 0 disables it
    pub timeout_ms: u64,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub result: Option<String>,
    pub error: Option<String>,
}

impl Task {
    /// Build a Pending task, filling unset fields from scheduler defaults
    pub fn from_spec(
        id: TaskId,
        spec: TaskSpec,
        default_model: &str,
        default_max_retries: u32,
        default_timeout_ms: u64,
    ) -> Self {
        Self {
            id,
            payload: spec.payload,
            priority: spec.priority,
            target_model: spec.target_model.unwrap_or_else(|| default_model.to_string()),
            metadata: spec.metadata,
            status: TaskStatus::Pending,
            attempts: 0,
            max_retries: spec.max_retries.unwrap_or(default_max_retries),
            timeout_ms: spec.timeout_ms.unwrap_or(default_timeout_ms),
            created_at: now_ms(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Whether another attempt is allowed after the current one failed
    pub fn can_retry(&self) -> bool {
        self.attempts <= self.max_retries
    }

    /// Wall time of the latest attempt, if it has finished
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end.saturating_sub(start)),
            _ => None,
        }
    }
}

/// What a caller submits; everything but the payload is optional.
#[derive(Clone, Default)]
pub struct TaskSpec {
    pub payload: String,
    pub priority: Priority,
    /// Defaults to the channel's bound model
    pub target_model: Option<String>,
    pub metadata: Metadata,
    pub max_retries: Option<u32>,
    pub timeout_ms: Option<u64>,
    /// Overrides the scheduler's handler for this task only
    pub handler: Option<SharedHandler>,
}

impl TaskSpec {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn target_model(mut self, model: impl Into<String>) -> Self {
        self.target_model = Some(model.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Detach the handler override before the request becomes a Task
    pub fn take_handler(&mut self) -> Option<SharedHandler> {
        self.handler.take()
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("payload", &self.payload)
            .field("priority", &self.priority)
            .field("target_model", &self.target_model)
            .field("metadata", &self.metadata)
            .field("max_retries", &self.max_retries)
            .field("timeout_ms", &self.timeout_ms)
            .field("handler", &self.handler.is_some())
            .finish()
    }
}
