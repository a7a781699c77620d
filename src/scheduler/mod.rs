//! Single-channel scheduling.
//!
//! This module provides:
//! - **Priority queue**: binary min-heap ordered by priority, then age.
//! - **Rate limiting**: token bucket throttling how fast tasks start.
//! - **Scheduler**: the task state machine (retry, timeout, cancel) with
//!   bounded concurrency and optional checkpointing.
//!
//! # Example
//!
//! ```ignore
//! use promptfleet::handler::{TaskRequest, handler_fn};
//! use promptfleet::scheduler::{Scheduler, SchedulerConfig, TaskSpec, Priority};
//!
//! let handler = handler_fn(|req: TaskRequest| async move { Ok(req.payload) });
//! let scheduler = Scheduler::new("default", SchedulerConfig::default(), handler)?;
//! let id = scheduler.enqueue(TaskSpec::new("hello").priority(Priority::High))?;
//! let answer = scheduler.wait_for_result(id, None).await?;
//! ```

pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod events;
pub mod priority;
pub mod rate_limit;
pub mod task;

pub use checkpoint::{Checkpoint, CheckpointTask};
pub use config::{SchedulerConfig, backoff_delay_ms};
pub use engine::{Scheduler, SchedulerBuilder, SchedulerStats, SchedulerStatus, terminal_result};
pub use events::SchedulerEvent;
pub use priority::{Priority, PriorityQueue};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use task::{Task, TaskSpec, TaskStatus};
