//! Fleet-wide metrics aggregated from channel snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::metrics::success_rate;
use crate::channel::{ChannelMetrics, ChannelState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetMetrics {
    pub total_channels: usize,
    pub active_channels: usize,
    pub total_routed: u64,
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    /// Tasks waiting in channel queues right now
    pub queued: usize,
    pub running: usize,
    /// Mean response time over all completions
    pub average_response_time_ms: f64,
    /// Mean of channel loads
    pub average_load: f64,
    pub success_rate: f64,
    pub throughput_per_min: f64,
    pub collected_at: DateTime<Utc>,
    pub channels: Vec<ChannelMetrics>,
}

impl FleetMetrics {
    pub fn aggregate(channels: Vec<ChannelMetrics>, total_routed: u64) -> Self {
        let sum_u64 = |f: fn(&ChannelMetrics) -> u64| channels.iter().map(f).sum::<u64>();
        let total_completed = sum_u64(|c| c.total_completed);
        let total_failed = sum_u64(|c| c.total_failed);

        let weighted_response: f64 = channels
            .iter()
            .map(|c| c.average_response_time_ms * c.total_completed as f64)
            .sum();
        let average_response_time_ms = if total_completed == 0 {
            0.0
        } else {
            weighted_response / total_completed as f64
        };
        let average_load = if channels.is_empty() {
            0.0
        } else {
            channels.iter().map(|c| c.current_load).sum::<f64>() / channels.len() as f64
        };

        Self {
            total_channels: channels.len(),
            active_channels: channels.iter().filter(|c| c.state == ChannelState::Active).count(),
            total_routed,
            total_queued: sum_u64(|c| c.total_queued),
            total_completed,
            total_failed,
            total_cancelled: sum_u64(|c| c.total_cancelled),
            total_retries: sum_u64(|c| c.total_retries),
            queued: channels.iter().map(|c| c.queued).sum(),
            running: channels.iter().map(|c| c.running).sum(),
            average_response_time_ms,
            average_load,
            success_rate: success_rate(total_completed, total_failed),
            throughput_per_min: channels.iter().map(|c| c.throughput_per_min).sum(),
            collected_at: Utc::now(),
            channels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Health;

    fn channel(name: &str, completed: u64, failed: u64, avg: f64, load: f64, state: ChannelState) -> ChannelMetrics {
        ChannelMetrics {
            name: name.to_string(),
            model: "m".to_string(),
            role: None,
            state,
            weight: 1.0,
            total_queued: completed + failed,
            total_completed: completed,
            total_failed: failed,
            total_cancelled: 0,
            total_retries: failed,
            average_response_time_ms: avg,
            last_response_time_ms: None,
            queued: 1,
            running: 2,
            concurrency_limit: 4,
            current_load: load,
            peak_load: load,
            success_rate: success_rate(completed, failed),
            throughput_per_min: completed as f64,
            start_time: Utc::now(),
            uptime_ms: 60000,
            health: Health::Healthy,
        }
    }

    #[test]
    fn test_aggregate() {
        let metrics = FleetMetrics::aggregate(
            vec![
                channel("a", 3, 1, 100.0, 0.5, ChannelState::Active),
                channel("b", 1, 0, 500.0, 0.25, ChannelState::Paused),
            ],
            9,
        );
        assert_eq!(metrics.total_channels, 2);
        assert_eq!(metrics.active_channels, 1);
        assert_eq!(metrics.total_routed, 9);
        assert_eq!(metrics.total_completed, 4);
        assert_eq!(metrics.total_failed, 1);
        assert_eq!(metrics.success_rate, 80.0);
        assert_eq!(metrics.average_response_time_ms, 200.0);
        assert_eq!(metrics.average_load, 0.375);
        assert_eq!(metrics.running, 4);
        assert_eq!(metrics.queued, 2);
    }

    #[test]
    fn test_aggregate_empty() {
        let metrics = FleetMetrics::aggregate(vec![], 0);
        assert_eq!(metrics.success_rate, 100.0);
        assert_eq!(metrics.average_load, 0.0);
        assert_eq!(metrics.average_response_time_ms, 0.0);
    }
}
