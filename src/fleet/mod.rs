//! Fleet management: a fixed set of channels behind one enqueue.

pub mod config;
pub mod manager;
pub mod metrics;
pub mod strategy;

pub use config::FleetConfig;
pub use manager::{ChannelStatus, FleetEvent, FleetManager, FleetStatus, RouteHint, Routed};
pub use metrics::FleetMetrics;
pub use strategy::{Candidate, Router, RoutingStrategy};
