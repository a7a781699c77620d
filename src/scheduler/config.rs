//! Scheduler configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::scheduler::rate_limit::RateLimitConfig;

/// Configuration for one scheduler (one channel).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum tasks in flight at once.
    pub max_concurrent: usize,
    /// Retries after the first attempt; a task runs at most `max_retries + 1` times.
    pub max_retries: u32,
    /// Backoff before the first retry (ms); doubles per attempt.
    pub retry_delay_base_ms: u64,
    /// Backoff ceiling (ms).
    pub retry_delay_max_ms: u64,
    /// Per-attempt handler timeout (ms); 0 disables it.
    pub timeout_ms: u64,
    /// Start-rate token bucket.
    pub rate_limit: RateLimitConfig,
    /// Where to persist the pending set (disabled when unset).
    pub checkpoint_path: Option<PathBuf>,
    /// Flush interval (ms); unset means write on every pending-set change.
    ///
    /// Eager writes (create, fsync, rename) run inline on the caller of
    /// `enqueue` and on the scheduler's pump, blocking that runtime worker for
    /// the duration of the write. Set an interval for high enqueue rates.
    pub checkpoint_interval_ms: Option<u64>,
    /// How many finished tasks to keep for result lookup.
    pub max_retained: usize,
    /// Event broadcast buffer size.
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            retry_delay_base_ms: 1000,
            retry_delay_max_ms: 30000,
            timeout_ms: 120000,
            rate_limit: RateLimitConfig::default(),
            checkpoint_path: None,
            checkpoint_interval_ms: None,
            max_retained: 1000,
            event_capacity: 256,
        }
    }
}

impl SchedulerConfig {
    /// Set the concurrency cap.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set retry count and backoff bounds.
    pub fn with_retries(mut self, max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay_base_ms = base_ms;
        self.retry_delay_max_ms = max_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(FleetError::InvalidConfig("max_concurrent must be at least 1".into()));
        }
        if self.retry_delay_base_ms > self.retry_delay_max_ms {
            return Err(FleetError::InvalidConfig(format!(
                "retry_delay_base_ms ({}) exceeds retry_delay_max_ms ({})",
                self.retry_delay_base_ms, self.retry_delay_max_ms
            )));
        }
        if self.max_retained == 0 {
            return Err(FleetError::InvalidConfig("max_retained must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(FleetError::InvalidConfig("event_capacity must be at least 1".into()));
        }
        if self.checkpoint_interval_ms == Some(0) {
            return Err(FleetError::InvalidConfig("checkpoint_interval_ms must be positive".into()));
        }
        self.rate_limit.validate()
    }
}

/// Backoff before the retry that follows attempt number `attempts`.
///
/// `min(base * 2^(attempts - 1), max)`, no jitter.
pub fn backoff_delay_ms(attempts: u32, base_ms: u64, max_ms: u64) -> u64 {
    let factor = 2u64.checked_pow(attempts.saturating_sub(1)).unwrap_or(u64::MAX);
    base_ms.saturating_mul(factor).min(max_ms)
}
