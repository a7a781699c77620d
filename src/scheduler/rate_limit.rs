//! Token-bucket rate limiting for task starts.
//!
//! Each scheduler owns one bucket. The pump takes one token before starting a
//! task, so the bucket bounds the start rate independently of the concurrency
//! cap.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{FleetError, Result};

/// Rate limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket size: the largest burst admitted at once.
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 2.0,
        }
    }
}

impl RateLimitConfig {
    /// Create config with custom values.
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(FleetError::InvalidConfig("rate_limit.capacity must be at least 1".into()));
        }
        if !(self.refill_per_sec.is_finite() && self.refill_per_sec > 0.0) {
            return Err(FleetError::InvalidConfig("rate_limit.refill_per_sec must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    granted: u64,
}

impl Bucket {
    fn refill(&mut self, capacity: f64, rate: f64) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket.
///
/// `acquire` callers queue on a fair async mutex, so waiters are admitted in
/// arrival order and refill-check-deduct happens as one critical section per
/// caller. `try_acquire` takes the bucket lock directly and never waits.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    turnstile: tokio::sync::Mutex<()>,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(config: &RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let capacity = f64::from(config.capacity);
        Ok(Self {
            capacity,
            refill_per_sec: config.refill_per_sec,
            turnstile: tokio::sync::Mutex::new(()),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
                granted: 0,
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Wait until `n` tokens are available, then take them.
    pub async fn acquire(&self, n: u32) -> Result<()> {
        let wanted = f64::from(n);
        if wanted > self.capacity {
            return Err(FleetError::RateLimit(format!(
                "requested {} tokens but bucket capacity is {}",
                n, self.capacity
            )));
        }

        let _turn = self.turnstile.lock().await;
        loop {
            let wait = {
                let mut bucket = self.bucket();
                bucket.refill(self.capacity, self.refill_per_sec);
                if bucket.tokens >= wanted {
                    bucket.tokens -= wanted;
                    bucket.granted += u64::from(n);
                    return Ok(());
                }
                refill_wait(wanted - bucket.tokens, self.refill_per_sec)
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, tokens = n, "Rate limiter waiting for refill");
            tokio::time::sleep(wait).await;
        }
    }

    /// Take `n` tokens if they are available right now.
    pub fn try_acquire(&self, n: u32) -> bool {
        let wanted = f64::from(n);
        let mut bucket = self.bucket();
        bucket.refill(self.capacity, self.refill_per_sec);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            bucket.granted += u64::from(n);
            true
        } else {
            false
        }
    }

    /// Tokens available right now.
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket();
        bucket.refill(self.capacity, self.refill_per_sec);
        bucket.tokens
    }

    /// Total tokens handed out since creation.
    pub fn granted(&self) -> u64 {
        self.bucket().granted
    }

    fn bucket(&self) -> std::sync::MutexGuard<'_, Bucket> {
        self.bucket.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Time until `deficit` tokens accrue at `rate` per second.
///
/// Floored at 1ms so float rounding never yields a zero-length spin, and
/// saturated at `Duration::MAX` for rates too small to represent.
fn refill_wait(deficit: f64, rate: f64) -> Duration {
    Duration::try_from_secs_f64(deficit / rate)
        .unwrap_or(Duration::MAX)
        .max(Duration::from_millis(1))
}
