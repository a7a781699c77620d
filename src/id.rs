//! ID generation utilities for promptfleet
//!
//! Task ids come from a counter that every channel of one fleet shares, so an
//! id identifies a task fleet-wide and can be persisted in checkpoints.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identifier of one scheduled task.
///
/// Serialized as a bare number; displayed as `task-{n}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Monotonic task id source.
#[derive(Debug)]
pub struct TaskIdGenerator {
    next: AtomicU64,
}

impl TaskIdGenerator {
    /// Create a generator whose first id is 1
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next),
        }
    }

    /// Hand out the next id
    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// The id the next call to `next_id` will return
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    /// Make sure ids below `next` are never handed out again (checkpoint restore)
    pub fn advance_to(&self, next: u64) {
        self.next.fetch_max(next, Ordering::Relaxed);
    }
}

impl Default for TaskIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        // Should be after 2020-01-01 and before 2100-01-01
        assert!(ts > 1577836800000);
        assert!(ts < 4102444800000);
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId::new(42).to_string(), "task-42");
    }

    #[test]
    fn test_task_id_serializes_as_number() {
        let json = serde_json::to_string(&TaskId::new(9)).unwrap();
        assert_eq!(json, "9");
        let id: TaskId = serde_json::from_str("13").unwrap();
        assert_eq!(id.value(), 13);
    }

    #[test]
    fn test_generator_is_monotonic() {
        let ids = TaskIdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
        assert_eq!(ids.peek(), 3);
    }

    #[test]
    fn test_advance_to_never_moves_backwards() {
        let ids = TaskIdGenerator::starting_at(10);
        ids.advance_to(5);
        assert_eq!(ids.peek(), 10);
        ids.advance_to(20);
        assert_eq!(ids.next_id().value(), 20);
    }
}
