//! promptfleet - priority scheduling of prompt jobs across a fleet of model channels
//!
//! Jobs are queued per channel with priority ordering, bounded concurrency,
//! token-bucket rate limiting and retry with backoff. A fleet manager routes
//! each job to one channel using a pluggable strategy and fans lifecycle
//! commands out to every channel.

pub mod channel;
pub mod error;
pub mod fleet;
pub mod handler;
pub mod id;
pub mod scheduler;

pub use error::{FleetError, Result};
pub use fleet::{FleetConfig, FleetManager, RouteHint, Routed, RoutingStrategy};
pub use handler::{SharedHandler, TaskHandler, TaskRequest, handler_fn};
pub use id::TaskId;
pub use scheduler::{Priority, Scheduler, SchedulerConfig, Task, TaskSpec, TaskStatus};
