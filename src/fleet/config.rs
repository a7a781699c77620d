//! Fleet configuration.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelConfig;
use crate::error::{FleetError, Result};
use crate::fleet::strategy::RoutingStrategy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetConfig {
    pub strategy: RoutingStrategy,
    /// How often to snapshot and log fleet metrics; 0 disables the timer
    pub metrics_interval_ms: u64,
    /// Fleet event broadcast buffer size
    pub event_capacity: usize,
    /// Seed for weighted and random routing
    pub seed: Option<u64>,
    /// Gives each channel `<dir>/<name>.json` unless it sets its own path
    pub checkpoint_dir: Option<PathBuf>,
    pub channels: Vec<ChannelConfig>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::default(),
            metrics_interval_ms: 30000,
            event_capacity: 1024,
            seed: None,
            checkpoint_dir: None,
            channels: vec![ChannelConfig::default()],
        }
    }
}

impl FleetConfig {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            channels,
            ..Default::default()
        }
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_metrics_interval_ms(mut self, interval_ms: u64) -> Self {
        self.metrics_interval_ms = interval_ms;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(FleetError::InvalidConfig("fleet needs at least one channel".into()));
        }
        if self.event_capacity == 0 {
            return Err(FleetError::InvalidConfig("event_capacity must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            channel.validate()?;
            if !seen.insert(channel.name.as_str()) {
                return Err(FleetError::InvalidConfig(format!("duplicate channel name: {}", channel.name)));
            }
        }
        Ok(())
    }

    /// Channel configs with `checkpoint_dir` applied
    pub fn resolved_channels(&self) -> Vec<ChannelConfig> {
        self.channels
            .iter()
            .cloned()
            .map(|mut channel| {
                if channel.scheduler.checkpoint_path.is_none()
                    && let Some(dir) = &self.checkpoint_dir
                {
                    channel.scheduler.checkpoint_path = Some(dir.join(format!("{}.json", channel.name)));
                }
                channel
            })
            .collect()
    }
}
