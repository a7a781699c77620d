//! Fleet manager: routes work to channels and fans out lifecycle commands.
//!
//! The manager runs no pump of its own. Each channel's scheduler pumps
//! itself; the manager makes the routing decision, forwards channel events
//! onto one fleet stream, and re-kicks every channel whenever a task
//! finishes somewhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::channel::{Channel, ChannelState};
use crate::error::{FleetError, Result};
use crate::fleet::config::FleetConfig;
use crate::fleet::metrics::FleetMetrics;
use crate::fleet::strategy::{Candidate, Router, RoutingStrategy};
use crate::handler::SharedHandler;
use crate::id::{TaskId, TaskIdGenerator};
use crate::scheduler::{SchedulerEvent, SchedulerStatus, Task, TaskSpec, terminal_result};

/// Optional routing hints for one enqueue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteHint {
    /// Send to this channel, bypassing the strategy
    pub channel: Option<String>,
    /// Prefer channels with this role
    pub role: Option<String>,
}

impl RouteHint {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel(name: impl Into<String>) -> Self {
        Self {
            channel: Some(name.into()),
            role: None,
        }
    }

    pub fn role(role: impl Into<String>) -> Self {
        Self {
            channel: None,
            role: Some(role.into()),
        }
    }
}

/// Where a task went
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Routed {
    pub task_id: TaskId,
    pub channel: String,
}

/// A scheduler event tagged with its channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetEvent {
    pub channel: String,
    #[serde(flatten)]
    pub event: SchedulerEvent,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub model: String,
    pub role: Option<String>,
    #[serde(flatten)]
    pub scheduler: SchedulerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    pub strategy: RoutingStrategy,
    pub shut_down: bool,
    pub total_routed: u64,
    pub channels: Vec<ChannelStatus>,
}

struct FleetInner {
    channels: Vec<Arc<Channel>>,
    index: HashMap<String, usize>,
    router: Router,
    total_routed: AtomicU64,
    events: broadcast::Sender<FleetEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
    latest_metrics: Mutex<Option<FleetMetrics>>,
    shut_down: AtomicBool,
}

impl FleetInner {
    fn metrics(&self) -> FleetMetrics {
        FleetMetrics::aggregate(
            self.channels.iter().map(|c| c.metrics()).collect(),
            self.total_routed.load(Ordering::Relaxed),
        )
    }

    fn stop_background(&self) {
        for handle in lock(&self.background).drain(..) {
            handle.abort();
        }
    }
}

impl Drop for FleetInner {
    fn drop(&mut self) {
        self.stop_background();
    }
}

/// Owns a fixed set of channels and routes work across them.
#[derive(Clone)]
pub struct FleetManager {
    inner: Arc<FleetInner>,
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("strategy", &self.inner.router.strategy())
            .field("channels", &self.inner.channels)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl FleetManager {
    /// Build every configured channel around `handler` and start listening.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: FleetConfig, handler: SharedHandler) -> Result<Self> {
        config.validate()?;
        let ids = Arc::new(TaskIdGenerator::new());

        let mut channels = Vec::with_capacity(config.channels.len());
        let mut index = HashMap::new();
        for channel_config in config.resolved_channels() {
            let channel = Channel::new(channel_config, Arc::clone(&handler), Arc::clone(&ids))?;
            index.insert(channel.name().to_string(), channels.len());
            channels.push(Arc::new(channel));
        }

        let (events, _) = broadcast::channel(config.event_capacity);
        let listeners: Vec<JoinHandle<()>> = channels
            .iter()
            .map(|channel| spawn_listener(channel, channels.clone(), events.clone()))
            .collect();

        let inner = Arc::new(FleetInner {
            channels,
            index,
            router: Router::new(config.strategy, config.seed),
            total_routed: AtomicU64::new(0),
            events,
            background: Mutex::new(listeners),
            latest_metrics: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });
        if config.metrics_interval_ms > 0 {
            let timer = spawn_metrics_timer(
                Arc::downgrade(&inner),
                Duration::from_millis(config.metrics_interval_ms),
            );
            lock(&inner.background).push(timer);
        }

        tracing::info!(
            channels = inner.channels.len(),
            strategy = %config.strategy,
            "Fleet started"
        );
        Ok(Self { inner })
    }

    pub fn strategy(&self) -> RoutingStrategy {
        self.inner.router.strategy()
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.inner.channels
    }

    pub fn channel(&self, name: &str) -> Result<&Arc<Channel>> {
        self.inner
            .index
            .get(name)
            .map(|&i| &self.inner.channels[i])
            .ok_or_else(|| FleetError::UnknownChannel(name.to_string()))
    }

    /// Channels currently eligible for routing, in fleet order
    pub fn active_channels(&self) -> Vec<&Arc<Channel>> {
        self.inner.channels.iter().filter(|c| c.is_routable()).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Route a task and queue it on the chosen channel.
    ///
    /// Order: explicit channel, then role, then the default strategy.
    pub fn enqueue(&self, spec: TaskSpec, hint: RouteHint) -> Result<Routed> {
        self.ensure_open()?;
        let channel = self.resolve(&hint)?;
        let task_id = channel.enqueue(spec)?;
        Ok(self.routed(channel, task_id))
    }

    /// Enqueue each spec, applying routing per item.
    ///
    /// Stops at the first admission error; earlier items stay queued.
    pub fn enqueue_batch(&self, specs: Vec<TaskSpec>, hint: RouteHint) -> Result<Vec<Routed>> {
        specs.into_iter().map(|spec| self.enqueue(spec, hint.clone())).collect()
    }

    /// Spread specs round-robin over the channels Active at call time,
    /// ignoring load.
    pub fn enqueue_batch_distributed(&self, specs: Vec<TaskSpec>) -> Result<Vec<Routed>> {
        self.ensure_open()?;
        let active = self.active_channels();
        if active.is_empty() {
            return Err(FleetError::NoChannelAvailable);
        }
        specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| -> Result<Routed> {
                let channel = active[i % active.len()];
                let task_id = channel.enqueue(spec)?;
                Ok(self.routed(channel, task_id))
            })
            .collect()
    }

    fn routed(&self, channel: &Channel, task_id: TaskId) -> Routed {
        self.inner.total_routed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(task_id = %task_id, channel = %channel.name(), "Task routed");
        Routed {
            task_id,
            channel: channel.name().to_string(),
        }
    }

    fn resolve(&self, hint: &RouteHint) -> Result<&Arc<Channel>> {
        if let Some(name) = &hint.channel {
            return self.channel(name);
        }

        let active = self.active_channels();
        let candidates: Vec<Candidate<'_>> = active
            .iter()
            .map(|c| Candidate {
                name: c.name(),
                load: c.current_load(),
                weight: c.weight(),
                role: c.role(),
            })
            .collect();

        self.inner
            .router
            .select(&candidates, hint.role.as_deref())
            .map(|i| active[i])
            .ok_or(FleetError::NoChannelAvailable)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(FleetError::ShutDown("fleet".to_string()));
        }
        Ok(())
    }

    fn owner(&self, id: TaskId) -> Result<&Arc<Channel>> {
        self.inner
            .channels
            .iter()
            .find(|c| c.scheduler().owns(id))
            .ok_or(FleetError::TaskNotFound(id))
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner.channels.iter().find_map(|c| c.scheduler().get_task(id))
    }

    pub async fn wait_for(&self, id: TaskId, timeout: Option<Duration>) -> Result<Task> {
        self.owner(id)?.scheduler().wait_for(id, timeout).await
    }

    pub async fn wait_for_result(&self, id: TaskId, timeout: Option<Duration>) -> Result<String> {
        terminal_result(self.wait_for(id, timeout).await?)
    }

    /// Wait until every channel is idle.
    pub async fn wait_for_all(&self, timeout: Option<Duration>) -> Result<Vec<Task>> {
        let all = async {
            let results = futures::future::join_all(
                self.inner
                    .channels
                    .iter()
                    .map(|c| c.scheduler().wait_for_all(None)),
            )
            .await;
            let mut done = Vec::new();
            for result in results {
                done.extend(result?);
            }
            Ok::<_, FleetError>(done)
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, all)
                .await
                .map_err(|_| FleetError::WaitTimeout("all fleet tasks".to_string()))?,
            None => all.await,
        }
    }

    /// Pause every Active channel. Returns how many were paused.
    pub fn pause_all(&self) -> usize {
        self.inner
            .channels
            .iter()
            .filter(|c| c.state() == ChannelState::Active && c.pause().is_ok())
            .count()
    }

    /// Resume every Paused channel. Returns how many were resumed.
    pub fn resume_all(&self) -> usize {
        self.inner
            .channels
            .iter()
            .filter(|c| c.state() == ChannelState::Paused && c.resume().is_ok())
            .count()
    }

    pub fn pause(&self, name: &str) -> Result<()> {
        self.channel(name)?.pause()
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        self.channel(name)?.resume()
    }

    pub fn drain(&self, name: &str) -> Result<()> {
        self.channel(name)?.drain()
    }

    pub fn offline(&self, name: &str) -> Result<()> {
        self.channel(name)?.offline()
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        self.inner.channels.iter().any(|c| c.cancel(id))
    }

    /// Cancel a channel's queued and retrying tasks; running ones continue.
    pub fn cancel_channel(&self, name: &str) -> Result<usize> {
        Ok(self.channel(name)?.cancel_pending())
    }

    pub fn cancel_all(&self) -> usize {
        self.inner.channels.iter().map(|c| c.cancel_all()).sum()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> FleetMetrics {
        self.inner.metrics()
    }

    /// Last snapshot taken by the metrics timer
    pub fn latest_metrics(&self) -> Option<FleetMetrics> {
        lock(&self.inner.latest_metrics).clone()
    }

    pub fn status(&self) -> FleetStatus {
        FleetStatus {
            strategy: self.strategy(),
            shut_down: self.is_shut_down(),
            total_routed: self.inner.total_routed.load(Ordering::Relaxed),
            channels: self
                .inner
                .channels
                .iter()
                .map(|c| ChannelStatus {
                    state: c.state(),
                    model: c.model().to_string(),
                    role: c.role().map(str::to_string),
                    scheduler: c.scheduler().status(),
                })
                .collect(),
        }
    }

    /// Cancel all work, stop listeners and the metrics timer, and close
    /// every channel. The fleet cannot be used afterwards.
    pub fn shutdown(&self) -> usize {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return 0;
        }
        self.inner.stop_background();
        let cancelled = self.inner.channels.iter().map(|c| c.shutdown()).sum();
        tracing::info!(cancelled, "Fleet shut down");
        cancelled
    }
}

fn spawn_listener(
    channel: &Arc<Channel>,
    all: Vec<Arc<Channel>>,
    events: broadcast::Sender<FleetEvent>,
) -> JoinHandle<()> {
    let mut rx = channel.subscribe();
    let name = channel.name().to_string();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    tracing::trace!(channel = %name, event = event.kind(), task_id = ?event.task_id(), "Forwarding event");
                    let terminal = event.is_terminal();
                    let _ = events.send(FleetEvent {
                        channel: name.clone(),
                        event,
                    });
                    if terminal {
                        for channel in &all {
                            channel.scheduler().kick();
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(channel = %name, skipped, "Fleet listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn spawn_metrics_timer(fleet: Weak<FleetInner>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = fleet.upgrade() else {
                break;
            };
            let metrics = inner.metrics();
            tracing::info!(
                routed = metrics.total_routed,
                completed = metrics.total_completed,
                failed = metrics.total_failed,
                running = metrics.running,
                queued = metrics.queued,
                success_rate = metrics.success_rate,
                "Fleet metrics"
            );
            *lock(&inner.latest_metrics) = Some(metrics);
        }
    })
}
