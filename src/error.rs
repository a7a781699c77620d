//! Error types for promptfleet
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::channel::ChannelState;
use crate::id::TaskId;

/// All error types that can occur while scheduling or routing tasks
#[derive(Debug, Error)]
pub enum FleetError {
    /// No Active channel could take the task
    #[error("No active channel available")]
    NoChannelAvailable,

    /// An explicitly requested channel does not exist
    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    /// An explicitly requested channel exists but refuses new work
    #[error("Channel {channel} is not accepting work ({state})")]
    ChannelUnavailable { channel: String, state: ChannelState },

    /// The execution handler returned an error
    #[error("Handler error: {0}")]
    Handler(String),

    /// The execution handler did not finish in time
    #[error("Task timed out after {0}ms")]
    Timeout(u64),

    /// Retries are exhausted
    #[error("Task {id} failed after {attempts} attempts: {error}")]
    TerminalFailure { id: TaskId, attempts: u32, error: String },

    /// The task was cancelled before it produced a result
    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    /// No scheduler knows this task id
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// A wait gave up before the awaited tasks finished
    #[error("Timed out waiting for {0}")]
    WaitTimeout(String),

    /// A lifecycle command that the channel's current state does not allow
    #[error("Invalid transition for channel {channel}: {from} -> {to}")]
    InvalidTransition {
        channel: String,
        from: ChannelState,
        to: ChannelState,
    },

    /// Configuration rejected at construction
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Token request the limiter can never satisfy
    #[error("Rate limit error: {0}")]
    RateLimit(String),

    /// The scheduler or fleet was shut down
    #[error("{0} has been shut down")]
    ShutDown(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether this error was raised at admission, before anything was queued
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            FleetError::NoChannelAvailable | FleetError::UnknownChannel(_) | FleetError::ChannelUnavailable { .. }
        )
    }
}

/// Result type alias for promptfleet operations
pub type Result<T> = std::result::Result<T, FleetError>;
