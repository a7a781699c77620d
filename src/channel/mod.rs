//! Channels: named schedulers bound to one model, with lifecycle and metrics.

mod worker;
pub mod metrics;
pub mod state;

pub use worker::{Channel, ChannelConfig};
pub use metrics::{ChannelMetrics, Health};
pub use state::ChannelState;
