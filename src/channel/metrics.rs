//! Per-channel metrics.
//!
//! Counters come from the channel's scheduler; success rate, throughput and
//! health are derived when a snapshot is taken rather than stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::state::ChannelState;

/// Coarse health grade shown in status output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Degraded,
    Unhealthy,
}

impl Health {
    /// Offline is always unhealthy; otherwise grade by success rate.
    pub fn assess(state: ChannelState, success_rate: f64) -> Self {
        if state == ChannelState::Offline {
            return Health::Unhealthy;
        }
        if success_rate >= 90.0 {
            Health::Healthy
        } else if success_rate >= 50.0 {
            Health::Degraded
        } else {
            Health::Unhealthy
        }
    }
}

/// Snapshot of one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub name: String,
    pub model: String,
    pub role: Option<String>,
    pub state: ChannelState,
    pub weight: f64,
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    pub average_response_time_ms: f64,
    pub last_response_time_ms: Option<u64>,
    pub queued: usize,
    pub running: usize,
    pub concurrency_limit: usize,
    pub current_load: f64,
    pub peak_load: f64,
    pub success_rate: f64,
    pub throughput_per_min: f64,
    pub start_time: DateTime<Utc>,
    pub uptime_ms: u64,
    pub health: Health,
}

/// completed / (completed + failed) as a percentage; 100 before anything finished
pub fn success_rate(completed: u64, failed: u64) -> f64 {
    let total = completed + failed;
    if total == 0 {
        return 100.0;
    }
    completed as f64 / total as f64 * 100.0
}

/// Completions per minute of uptime
pub fn throughput_per_min(completed: u64, uptime_ms: u64) -> f64 {
    if uptime_ms == 0 {
        return 0.0;
    }
    completed as f64 / (uptime_ms as f64 / 60000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        assert_eq!(success_rate(0, 0), 100.0);
        assert_eq!(success_rate(3, 1), 75.0);
        assert_eq!(success_rate(0, 4), 0.0);
    }

    #[test]
    fn test_throughput() {
        assert_eq!(throughput_per_min(10, 0), 0.0);
        assert_eq!(throughput_per_min(10, 60000), 10.0);
        assert_eq!(throughput_per_min(10, 120000), 5.0);
    }

    #[test]
    fn test_health_grades() {
        assert_eq!(Health::assess(ChannelState::Active, 100.0), Health::Healthy);
        assert_eq!(Health::assess(ChannelState::Paused, 75.0), Health::Degraded);
        assert_eq!(Health::assess(ChannelState::Active, 10.0), Health::Unhealthy);
        assert_eq!(Health::assess(ChannelState::Offline, 100.0), Health::Unhealthy);
    }
}
