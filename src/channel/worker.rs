//! A named scheduler bound to one model, with a lifecycle.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::metrics::{ChannelMetrics, Health, success_rate, throughput_per_min};
use crate::channel::state::ChannelState;
use crate::error::{FleetError, Result};
use crate::handler::SharedHandler;
use crate::id::{TaskId, TaskIdGenerator};
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerEvent, TaskSpec};

/// Static definition of one channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    /// Model used for tasks that do not name one
    pub model: String,
    /// Routing role, e.g. "code" or "summarize"
    pub role: Option<String>,
    /// Relative share under the weighted strategy
    pub weight: f64,
    pub scheduler: SchedulerConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            model: "default".to_string(),
            role: None,
            weight: 1.0,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FleetError::InvalidConfig("channel name must not be empty".into()));
        }
        if !self.weight.is_finite() || self.weight < 0.0 {
            return Err(FleetError::InvalidConfig(format!(
                "channel {}: weight must be a finite non-negative number",
                self.name
            )));
        }
        self.scheduler
            .validate()
            .map_err(|e| FleetError::InvalidConfig(format!("channel {}: {}", self.name, e)))
    }
}

/// One worker identity: a scheduler plus routing attributes and lifecycle.
pub struct Channel {
    name: String,
    model: String,
    role: Option<String>,
    weight: f64,
    scheduler: Scheduler,
    state: RwLock<ChannelState>,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("role", &self.role)
            .field("weight", &self.weight)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// Build a channel and its scheduler. Must run inside a Tokio runtime.
    pub fn new(config: ChannelConfig, handler: SharedHandler, ids: Arc<TaskIdGenerator>) -> Result<Self> {
        config.validate()?;
        let scheduler = Scheduler::builder(config.name.clone(), handler)
            .config(config.scheduler)
            .model(config.model.clone())
            .ids(ids)
            .build()?;

        tracing::info!(channel = %config.name, model = %config.model, "Channel started");
        Ok(Self {
            name: config.name,
            model: config.model,
            role: config.role,
            weight: config.weight,
            scheduler,
            state: RwLock::new(ChannelState::Active),
            started_at: Utc::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> ChannelState {
        *self.read_state()
    }

    pub fn concurrency_limit(&self) -> usize {
        self.scheduler.config().max_concurrent
    }

    /// Active with a free slot
    pub fn can_accept_work(&self) -> bool {
        self.state() == ChannelState::Active && self.scheduler.running_count() < self.concurrency_limit()
    }

    pub fn is_routable(&self) -> bool {
        self.state().is_routable()
    }

    /// running / concurrency_limit
    pub fn current_load(&self) -> f64 {
        self.scheduler.load()
    }

    /// Queue work on this channel. Draining and Offline channels refuse it.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<TaskId> {
        let state = self.read_state();
        if !state.accepts_enqueue() {
            return Err(FleetError::ChannelUnavailable {
                channel: self.name.clone(),
                state: *state,
            });
        }
        self.scheduler.enqueue(spec)
    }

    pub fn pause(&self) -> Result<()> {
        self.transition(ChannelState::Paused, |s| s.pause())
    }

    pub fn resume(&self) -> Result<()> {
        self.transition(ChannelState::Active, |s| s.resume())
    }

    /// Leave routing for good; queued work still runs, so a paused channel resumes.
    pub fn drain(&self) -> Result<()> {
        self.transition(ChannelState::Draining, |s| s.resume())
    }

    /// Hard stop. Queued work stays queued and is not cancelled.
    pub fn offline(&self) -> Result<()> {
        self.transition(ChannelState::Offline, |s| s.pause())
    }

    fn transition(&self, to: ChannelState, apply: impl FnOnce(&Scheduler)) -> Result<()> {
        let mut state = self.write_state();
        let from = *state;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(FleetError::InvalidTransition {
                channel: self.name.clone(),
                from,
                to,
            });
        }
        *state = to;
        apply(&self.scheduler);
        tracing::info!(channel = %self.name, from = %from, to = %to, "Channel state changed");
        Ok(())
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn cancel_pending(&self) -> usize {
        self.scheduler.cancel_pending()
    }

    pub fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SchedulerEvent> {
        self.scheduler.subscribe()
    }

    pub fn metrics(&self) -> ChannelMetrics {
        let status = self.scheduler.status();
        let state = self.state();
        let stats = status.stats;
        let uptime_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
        let success_rate = success_rate(stats.total_completed, stats.total_failed);

        ChannelMetrics {
            name: self.name.clone(),
            model: self.model.clone(),
            role: self.role.clone(),
            state,
            weight: self.weight,
            total_queued: stats.total_queued,
            total_completed: stats.total_completed,
            total_failed: stats.total_failed,
            total_cancelled: stats.total_cancelled,
            total_retries: stats.total_retries,
            average_response_time_ms: stats.average_response_time_ms,
            last_response_time_ms: stats.last_response_time_ms,
            queued: status.queued,
            running: status.running,
            concurrency_limit: status.max_concurrent,
            current_load: status.load,
            peak_load: stats.peak_load,
            success_rate,
            throughput_per_min: throughput_per_min(stats.total_completed, uptime_ms),
            start_time: self.started_at,
            uptime_ms,
            health: Health::assess(state, success_rate),
        }
    }

    /// Cancel everything and close the scheduler.
    pub fn shutdown(&self) -> usize {
        self.scheduler.shutdown()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChannelState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChannelState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
