//! Single-channel scheduling engine.
//!
//! A [`Scheduler`] owns one priority queue, one rate limiter and a bounded
//! running set. Enqueue is synchronous; a pump task started on demand pulls
//! work off the queue, throttles it through the limiter, and spawns each
//! attempt without waiting for it. Attempt outcomes drive the task state
//! machine: completion, retry after backoff, terminal failure, or a discarded
//! result when the task was cancelled while running.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{FleetError, Result};
use crate::handler::{SharedHandler, TaskRequest};
use crate::id::{TaskId, TaskIdGenerator, now_ms};
use crate::scheduler::checkpoint::{Checkpoint, CheckpointTask};
use crate::scheduler::config::{SchedulerConfig, backoff_delay_ms};
use crate::scheduler::events::SchedulerEvent;
use crate::scheduler::priority::PriorityQueue;
use crate::scheduler::rate_limit::RateLimiter;
use crate::scheduler::task::{Task, TaskSpec, TaskStatus};

/// Running counters for one scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_queued: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_retries: u64,
    pub average_response_time_ms: f64,
    pub last_response_time_ms: Option<u64>,
    /// Highest running / max_concurrent ratio observed
    pub peak_load: f64,
    #[serde(skip)]
    total_response_ms: u64,
}

impl SchedulerStats {
    fn record_completion(&mut self, duration_ms: u64) {
        self.total_completed += 1;
        self.total_response_ms = self.total_response_ms.saturating_add(duration_ms);
        self.last_response_time_ms = Some(duration_ms);
        self.average_response_time_ms = self.total_response_ms as f64 / self.total_completed as f64;
    }
}

/// Point-in-time view of a scheduler, safe to serialize.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub name: String,
    pub paused: bool,
    pub closed: bool,
    pub queued: usize,
    pub running: usize,
    pub retrying: usize,
    pub finished: usize,
    pub max_concurrent: usize,
    pub load: f64,
    pub available_tokens: f64,
    /// Task the pump would start next
    pub next: Option<TaskId>,
    pub stats: SchedulerStats,
}

/// Snapshot of the pending set, tagged with the mutation it reflects
struct PendingSnapshot {
    version: u64,
    checkpoint: Checkpoint,
}

#[derive(Default)]
struct State {
    queue: PriorityQueue,
    running: HashMap<TaskId, Task>,
    retrying: HashMap<TaskId, Task>,
    finished: HashMap<TaskId, Task>,
    finished_order: VecDeque<TaskId>,
    handlers: HashMap<TaskId, SharedHandler>,
    waiters: HashMap<TaskId, Vec<oneshot::Sender<Task>>>,
    stats: SchedulerStats,
    paused: bool,
    closed: bool,
    pumping: bool,
    checkpoint_version: u64,
    checkpoint_dirty: bool,
}

impl State {
    fn is_live(&self, id: TaskId) -> bool {
        self.queue.contains(id) || self.running.contains_key(&id) || self.retrying.contains_key(&id)
    }

    fn live_ids(&self) -> Vec<TaskId> {
        self.queue
            .iter()
            .map(|t| t.id)
            .chain(self.running.keys().copied())
            .chain(self.retrying.keys().copied())
            .collect()
    }
}

struct Inner {
    name: String,
    model: String,
    config: SchedulerConfig,
    handler: SharedHandler,
    ids: Arc<TaskIdGenerator>,
    limiter: RateLimiter,
    state: Mutex<State>,
    slot_freed: Notify,
    events: broadcast::Sender<SchedulerEvent>,
    /// Version of the last checkpoint written to disk
    checkpoint_written: Mutex<u64>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    name: String,
    handler: SharedHandler,
    config: SchedulerConfig,
    model: Option<String>,
    ids: Option<Arc<TaskIdGenerator>>,
    paused: bool,
}

impl SchedulerBuilder {
    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Model used for tasks that do not name one. Defaults to the scheduler name.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Share an id counter with other schedulers.
    pub fn ids(mut self, ids: Arc<TaskIdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Start paused: restored and newly enqueued work waits for `resume`.
    pub fn paused(mut self) -> Self {
        self.paused = true;
        self
    }

    /// Validate the configuration, restore any checkpoint, and start.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;
        let limiter = RateLimiter::new(&self.config.rate_limit)?;
        let ids = self.ids.unwrap_or_default();
        let (events, _) = broadcast::channel(self.config.event_capacity);

        let mut state = State {
            paused: self.paused,
            ..Default::default()
        };
        if let Some(path) = &self.config.checkpoint_path {
            match Checkpoint::load(path) {
                Ok(Some(checkpoint)) => {
                    ids.advance_to(checkpoint.next_id);
                    for entry in checkpoint.queued {
                        ids.advance_to(entry.id.value() + 1);
                        state.queue.push(entry.into_task());
                        state.stats.total_queued += 1;
                    }
                    tracing::info!(
                        scheduler = %self.name,
                        path = %path.display(),
                        restored = state.queue.len(),
                        "Restored pending tasks from checkpoint"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        scheduler = %self.name,
                        path = %path.display(),
                        error = %e,
                        "Ignoring unreadable checkpoint"
                    );
                }
            }
        }

        let inner = Arc::new(Inner {
            model: self.model.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            config: self.config,
            handler: self.handler,
            ids,
            limiter,
            state: Mutex::new(state),
            slot_freed: Notify::new(),
            events,
            checkpoint_written: Mutex::new(0),
            flusher: Mutex::new(None),
        });

        if inner.config.checkpoint_path.is_some()
            && let Some(every) = inner.config.checkpoint_interval_ms
        {
            let handle = spawn_flusher(&inner, Duration::from_millis(every));
            *lock(&inner.flusher) = Some(handle);
        }

        inner.ensure_pump();
        Ok(Scheduler { inner })
    }
}

/// Handle to a scheduler; clones share the same engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("model", &self.inner.model)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn builder(name: impl Into<String>, handler: SharedHandler) -> SchedulerBuilder {
        SchedulerBuilder {
            name: name.into(),
            handler,
            config: SchedulerConfig::default(),
            model: None,
            ids: None,
            paused: false,
        }
    }

    /// Build a scheduler with its own id counter.
    pub fn new(name: impl Into<String>, config: SchedulerConfig, handler: SharedHandler) -> Result<Self> {
        Self::builder(name, handler).config(config).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn model(&self) -> &str {
        &self.inner.model
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn ids(&self) -> &Arc<TaskIdGenerator> {
        &self.inner.ids
    }

    /// Queue a task and return its id without waiting for it to run.
    pub fn enqueue(&self, mut spec: TaskSpec) -> Result<TaskId> {
        let inner = &self.inner;
        let handler = spec.take_handler();
        let (id, snapshot) = {
            let mut guard = inner.state();
            let st = &mut *guard;
            if st.closed {
                return Err(FleetError::ShutDown(format!("scheduler {}", inner.name)));
            }
            let id = inner.ids.next_id();
            let task = Task::from_spec(
                id,
                spec,
                &inner.model,
                inner.config.max_retries,
                inner.config.timeout_ms,
            );
            let priority = task.priority;
            if let Some(handler) = handler {
                st.handlers.insert(id, handler);
            }
            st.queue.push(task);
            st.stats.total_queued += 1;
            inner.emit(SchedulerEvent::Enqueued { id, priority });
            tracing::debug!(scheduler = %inner.name, task_id = %id, priority = %priority, "Task enqueued");
            (id, inner.pending_changed(st))
        };
        inner.persist(snapshot);
        inner.ensure_pump();
        Ok(id)
    }

    /// Cancel a pending, retrying or running task.
    ///
    /// Returns false for unknown or already finished ids.
    pub fn cancel(&self, id: TaskId) -> bool {
        let inner = &self.inner;
        let (was_running, snapshot) = {
            let mut guard = inner.state();
            let st = &mut *guard;
            let (task, was_running) = if let Some(task) = st.queue.remove(id) {
                (task, false)
            } else if let Some(task) = st.retrying.remove(&id) {
                (task, false)
            } else if let Some(task) = st.running.remove(&id) {
                (task, true)
            } else {
                return false;
            };
            inner.mark_cancelled(st, task);
            let snapshot = if was_running { None } else { inner.pending_changed(st) };
            (was_running, snapshot)
        };
        if was_running {
            inner.slot_freed.notify_one();
        }
        inner.persist(snapshot);
        true
    }

    /// Cancel everything not yet running. Returns how many tasks were cancelled.
    pub fn cancel_pending(&self) -> usize {
        self.inner.cancel_where(false)
    }

    /// Cancel pending and running tasks alike.
    pub fn cancel_all(&self) -> usize {
        self.inner.cancel_where(true)
    }

    /// Stop starting new work. In-flight attempts run to completion.
    pub fn pause(&self) {
        let mut st = self.inner.state();
        if !st.paused {
            st.paused = true;
            self.inner.emit(SchedulerEvent::Paused);
            tracing::info!(scheduler = %self.inner.name, "Scheduler paused");
        }
    }

    pub fn resume(&self) {
        {
            let mut st = self.inner.state();
            if st.closed || !st.paused {
                return;
            }
            st.paused = false;
            self.inner.emit(SchedulerEvent::Resumed);
            tracing::info!(scheduler = %self.inner.name, "Scheduler resumed");
        }
        self.inner.ensure_pump();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state().paused
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Start the pump if there is work and it is idle.
    pub fn kick(&self) {
        self.inner.ensure_pump();
    }

    /// Look a task up in any of the scheduler's sets.
    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        let st = self.inner.state();
        st.queue
            .get(id)
            .or_else(|| st.running.get(&id))
            .or_else(|| st.retrying.get(&id))
            .or_else(|| st.finished.get(&id))
            .cloned()
    }

    /// Whether this scheduler currently holds or remembers the task
    pub fn owns(&self, id: TaskId) -> bool {
        let st = self.inner.state();
        st.is_live(id) || st.finished.contains_key(&id)
    }

    /// Queued tasks in start order.
    pub fn queue_snapshot(&self) -> Vec<Task> {
        self.inner.state().queue.snapshot()
    }

    pub fn running_tasks(&self) -> Vec<Task> {
        self.inner.state().running.values().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.state().running.len()
    }

    pub fn retrying_count(&self) -> usize {
        self.inner.state().retrying.len()
    }

    /// running / max_concurrent
    pub fn load(&self) -> f64 {
        self.running_count() as f64 / self.inner.config.max_concurrent as f64
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.state().stats.clone()
    }

    pub fn status(&self) -> SchedulerStatus {
        let available_tokens = self.inner.limiter.available();
        let st = self.inner.state();
        SchedulerStatus {
            name: self.inner.name.clone(),
            paused: st.paused,
            closed: st.closed,
            queued: st.queue.len(),
            running: st.running.len(),
            retrying: st.retrying.len(),
            finished: st.finished.len(),
            max_concurrent: self.inner.config.max_concurrent,
            load: st.running.len() as f64 / self.inner.config.max_concurrent as f64,
            available_tokens,
            next: st.queue.peek().map(|t| t.id),
            stats: st.stats.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the task reaches a terminal status.
    pub async fn wait_for(&self, id: TaskId, timeout: Option<Duration>) -> Result<Task> {
        let rx = {
            let mut st = self.inner.state();
            if let Some(task) = st.finished.get(&id) {
                return Ok(task.clone());
            }
            if !st.is_live(id) {
                return Err(FleetError::TaskNotFound(id));
            }
            let (tx, rx) = oneshot::channel();
            let waiters = st.waiters.entry(id).or_default();
            // Drop senders left behind by waits that timed out
            waiters.retain(|tx| !tx.is_closed());
            waiters.push(tx);
            rx
        };

        let name = &self.inner.name;
        let recv = async move { rx.await.map_err(|_| FleetError::ShutDown(format!("scheduler {}", name))) };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, recv)
                .await
                .map_err(|_| FleetError::WaitTimeout(id.to_string()))?,
            None => recv.await,
        }
    }

    /// Wait for a task and turn its terminal status into a result.
    pub async fn wait_for_result(&self, id: TaskId, timeout: Option<Duration>) -> Result<String> {
        terminal_result(self.wait_for(id, timeout).await?)
    }

    /// Wait until nothing is queued, running or retrying.
    ///
    /// Returns the tasks that finished while waiting.
    pub async fn wait_for_all(&self, timeout: Option<Duration>) -> Result<Vec<Task>> {
        let drain = async {
            let mut done = Vec::new();
            loop {
                let ids = self.inner.state().live_ids();
                if ids.is_empty() {
                    return Ok(done);
                }
                let results = futures::future::join_all(ids.into_iter().map(|id| self.wait_for(id, None))).await;
                for result in results {
                    match result {
                        Ok(task) => done.push(task),
                        // finished and already evicted
                        Err(FleetError::TaskNotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, drain)
                .await
                .map_err(|_| FleetError::WaitTimeout(format!("all tasks on {}", self.inner.name)))?,
            None => drain.await,
        }
    }

    /// Forget finished tasks. Returns how many were dropped.
    pub fn clear_finished(&self) -> usize {
        let mut st = self.inner.state();
        let count = st.finished.len();
        st.finished.clear();
        st.finished_order.clear();
        count
    }

    /// Write the checkpoint now if it is behind the in-memory pending set.
    pub fn flush_checkpoint(&self) {
        self.inner.flush_checkpoint();
    }

    /// Cancel everything and refuse further work. Returns the cancelled count.
    pub fn shutdown(&self) -> usize {
        {
            let mut st = self.inner.state();
            if st.closed {
                return 0;
            }
            st.closed = true;
        }
        let cancelled = self.inner.cancel_where(true);
        if let Some(handle) = lock(&self.inner.flusher).take() {
            handle.abort();
        }
        self.inner.flush_checkpoint();
        self.inner.slot_freed.notify_one();
        tracing::info!(scheduler = %self.inner.name, cancelled, "Scheduler shut down");
        cancelled
    }
}

/// Completed → result, Failed → `TerminalFailure`, Cancelled → `Cancelled`.
pub fn terminal_result(task: Task) -> Result<String> {
    match task.status {
        TaskStatus::Completed => Ok(task.result.unwrap_or_default()),
        TaskStatus::Cancelled => Err(FleetError::Cancelled(task.id)),
        _ => Err(FleetError::TerminalFailure {
            id: task.id,
            attempts: task.attempts,
            error: task.error.unwrap_or_default(),
        }),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn spawn_flusher(inner: &Arc<Inner>, every: Duration) -> JoinHandle<()> {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.state().checkpoint_dirty {
                inner.flush_checkpoint();
            }
        }
    })
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn emit(&self, event: SchedulerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn ensure_pump(self: &Arc<Self>) {
        {
            let mut st = self.state();
            if st.pumping || st.paused || st.closed || st.queue.is_empty() {
                return;
            }
            st.pumping = true;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.pump().await });
    }

    async fn pump(self: Arc<Self>) {
        tracing::trace!(scheduler = %self.name, "Pump started");
        loop {
            let at_capacity = {
                let mut st = self.state();
                if st.paused || st.closed || st.queue.is_empty() {
                    st.pumping = false;
                    tracing::trace!(scheduler = %self.name, "Pump idle");
                    return;
                }
                st.running.len() >= self.config.max_concurrent
            };
            if at_capacity {
                self.slot_freed.notified().await;
                continue;
            }

            if let Err(e) = self.limiter.acquire(1).await {
                tracing::error!(scheduler = %self.name, error = %e, "Rate limiter refused the pump");
                self.state().pumping = false;
                return;
            }

            // The world may have changed while waiting for the token; if so the
            // token is forfeited and the loop re-checks.
            let started = {
                let mut guard = self.state();
                let st = &mut *guard;
                if st.paused || st.closed || st.running.len() >= self.config.max_concurrent {
                    None
                } else {
                    st.queue.pop().map(|task| self.start(st, task))
                }
            };

            if let Some((task, handler, snapshot)) = started {
                self.persist(snapshot);
                let inner = Arc::clone(&self);
                tokio::spawn(async move { inner.run_attempt(task, handler).await });
            }
        }
    }

    fn start(&self, st: &mut State, mut task: Task) -> (Task, SharedHandler, Option<PendingSnapshot>) {
        task.status = TaskStatus::Running;
        task.attempts += 1;
        task.started_at = Some(now_ms());
        task.completed_at = None;
        let id = task.id;
        let attempt = task.attempts;

        st.running.insert(id, task.clone());
        let load = st.running.len() as f64 / self.config.max_concurrent as f64;
        if load > st.stats.peak_load {
            st.stats.peak_load = load;
        }

        let handler = st.handlers.get(&id).cloned().unwrap_or_else(|| Arc::clone(&self.handler));
        self.emit(SchedulerEvent::Started { id, attempt });
        tracing::debug!(scheduler = %self.name, task_id = %id, attempt, "Task started");
        let snapshot = self.pending_changed(st);
        (task, handler, snapshot)
    }

    async fn run_attempt(self: Arc<Self>, task: Task, handler: SharedHandler) {
        let request = TaskRequest {
            task_id: task.id,
            payload: task.payload,
            target_model: task.target_model,
            metadata: task.metadata,
            attempt: task.attempts,
        };
        let started = Instant::now();
        let call = AssertUnwindSafe(handler.handle(request)).catch_unwind();

        let outcome = if task.timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(task.timeout_ms), call).await {
                Ok(result) => flatten(result),
                Err(_) => Err(FleetError::Timeout(task.timeout_ms)),
            }
        } else {
            flatten(call.await)
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        self.finish_attempt(task.id, outcome, duration_ms);
    }

    fn finish_attempt(self: &Arc<Self>, id: TaskId, outcome: Result<String>, duration_ms: u64) {
        let (retry, snapshot) = {
            let mut guard = self.state();
            let st = &mut *guard;
            let Some(mut task) = st.running.remove(&id) else {
                tracing::debug!(scheduler = %self.name, task_id = %id, "Discarding outcome of cancelled task");
                return;
            };

            match outcome {
                Ok(result) => {
                    task.status = TaskStatus::Completed;
                    task.completed_at = Some(now_ms());
                    task.result = Some(result.clone());
                    task.error = None;
                    st.stats.record_completion(duration_ms);
                    self.emit(SchedulerEvent::Completed { id, result, duration_ms });
                    tracing::info!(scheduler = %self.name, task_id = %id, duration_ms, "Task completed");
                    self.finalize(st, task);
                    (None, None)
                }
                Err(e) => {
                    let error = e.to_string();
                    task.error = Some(error.clone());
                    if task.can_retry() {
                        let delay_ms = backoff_delay_ms(
                            task.attempts,
                            self.config.retry_delay_base_ms,
                            self.config.retry_delay_max_ms,
                        );
                        task.status = TaskStatus::Retrying;
                        st.stats.total_retries += 1;
                        self.emit(SchedulerEvent::Retrying {
                            id,
                            attempt: task.attempts,
                            delay_ms,
                            error: error.clone(),
                        });
                        tracing::warn!(
                            scheduler = %self.name,
                            task_id = %id,
                            attempt = task.attempts,
                            delay_ms,
                            error = %error,
                            "Task failed, retrying"
                        );
                        st.retrying.insert(id, task);
                        (Some(delay_ms), self.pending_changed(st))
                    } else {
                        task.status = TaskStatus::Failed;
                        task.completed_at = Some(now_ms());
                        st.stats.total_failed += 1;
                        self.emit(SchedulerEvent::Failed {
                            id,
                            error: error.clone(),
                            attempts: task.attempts,
                        });
                        tracing::error!(
                            scheduler = %self.name,
                            task_id = %id,
                            attempts = task.attempts,
                            error = %error,
                            "Task failed"
                        );
                        self.finalize(st, task);
                        (None, None)
                    }
                }
            }
        };

        self.slot_freed.notify_one();
        self.persist(snapshot);

        if let Some(delay_ms) = retry {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                inner.requeue(id);
            });
        }
    }

    /// Move a task whose backoff elapsed back into the queue.
    fn requeue(self: &Arc<Self>, id: TaskId) {
        let snapshot = {
            let mut guard = self.state();
            let st = &mut *guard;
            // Gone means it was cancelled during the backoff
            let Some(mut task) = st.retrying.remove(&id) else {
                return;
            };
            task.status = TaskStatus::Pending;
            st.queue.push(task);
            self.pending_changed(st)
        };
        self.persist(snapshot);
        self.ensure_pump();
    }

    fn cancel_where(&self, include_running: bool) -> usize {
        let (count, freed, snapshot) = {
            let mut guard = self.state();
            let st = &mut *guard;
            let mut victims = st.queue.drain();
            victims.extend(st.retrying.drain().map(|(_, task)| task));
            let pending_changed = !victims.is_empty();
            let mut freed = false;
            if include_running && !st.running.is_empty() {
                victims.extend(st.running.drain().map(|(_, task)| task));
                freed = true;
            }
            let count = victims.len();
            for task in victims {
                self.mark_cancelled(st, task);
            }
            let snapshot = if pending_changed { self.pending_changed(st) } else { None };
            (count, freed, snapshot)
        };
        if freed {
            self.slot_freed.notify_one();
        }
        self.persist(snapshot);
        if count > 0 {
            tracing::info!(scheduler = %self.name, count, include_running, "Cancelled tasks");
        }
        count
    }

    fn mark_cancelled(&self, st: &mut State, mut task: Task) {
        let id = task.id;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(now_ms());
        st.stats.total_cancelled += 1;
        self.emit(SchedulerEvent::Cancelled { id });
        tracing::debug!(scheduler = %self.name, task_id = %id, "Task cancelled");
        self.finalize(st, task);
    }

    /// Record a terminal task, wake its waiters, and enforce retention.
    fn finalize(&self, st: &mut State, task: Task) {
        let id = task.id;
        st.handlers.remove(&id);
        if let Some(waiters) = st.waiters.remove(&id) {
            for waiter in waiters {
                let _ = waiter.send(task.clone());
            }
        }
        st.finished.insert(id, task);
        st.finished_order.push_back(id);
        while st.finished.len() > self.config.max_retained {
            match st.finished_order.pop_front() {
                Some(old) => {
                    st.finished.remove(&old);
                }
                None => break,
            }
        }
    }

    /// Note a change to the pending set; returns a snapshot to write when
    /// checkpoints are written eagerly.
    fn pending_changed(&self, st: &mut State) -> Option<PendingSnapshot> {
        self.config.checkpoint_path.as_ref()?;
        st.checkpoint_version += 1;
        if self.config.checkpoint_interval_ms.is_some() {
            st.checkpoint_dirty = true;
            return None;
        }
        Some(self.snapshot(st))
    }

    fn snapshot(&self, st: &State) -> PendingSnapshot {
        let queued = st
            .queue
            .iter()
            .chain(st.retrying.values())
            .map(CheckpointTask::from)
            .collect();
        PendingSnapshot {
            version: st.checkpoint_version,
            checkpoint: Checkpoint::new(queued, self.ids.peek()),
        }
    }

    fn flush_checkpoint(&self) {
        if self.config.checkpoint_path.is_none() {
            return;
        }
        let snapshot = {
            let mut st = self.state();
            st.checkpoint_dirty = false;
            self.snapshot(&st)
        };
        self.persist(Some(snapshot));
    }

    /// Write a snapshot unless a newer one is already on disk. Failures are
    /// logged and dropped.
    fn persist(&self, snapshot: Option<PendingSnapshot>) {
        let (Some(snapshot), Some(path)) = (snapshot, self.config.checkpoint_path.as_ref()) else {
            return;
        };
        let mut written = lock(&self.checkpoint_written);
        if snapshot.version <= *written {
            return;
        }
        match snapshot.checkpoint.save(path) {
            Ok(()) => {
                *written = snapshot.version;
                tracing::trace!(
                    scheduler = %self.name,
                    version = snapshot.version,
                    queued = snapshot.checkpoint.queued.len(),
                    "Checkpoint written"
                );
            }
            Err(e) => {
                tracing::warn!(scheduler = %self.name, path = %path.display(), error = %e, "Checkpoint write failed");
            }
        }
    }
}

fn flatten(outcome: std::result::Result<eyre::Result<String>, Box<dyn std::any::Any + Send>>) -> Result<String> {
    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(FleetError::Handler(format!("{:#}", e))),
        Err(_) => Err(FleetError::Handler("handler panicked".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use crate::scheduler::priority::Priority;
    use crate::scheduler::rate_limit::RateLimitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    fn echo() -> SharedHandler {
        handler_fn(|req: TaskRequest| async move { Ok(format!("echo:{}", req.payload)) })
    }

    fn never() -> SharedHandler {
        handler_fn(|_req: TaskRequest| futures::future::pending::<eyre::Result<String>>())
    }

    fn quick_config() -> SchedulerConfig {
        SchedulerConfig::default().with_timeout_ms(0).with_retries(0, 10, 10)
    }

    async fn next_started(rx: &mut broadcast::Receiver<SchedulerEvent>) -> TaskId {
        loop {
            if let SchedulerEvent::Started { id, .. } = rx.recv().await.unwrap() {
                return id;
            }
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_complete() {
        let scheduler = Scheduler::new("fast", quick_config(), echo()).unwrap();
        let id = scheduler.enqueue(TaskSpec::new("hello")).unwrap();

        let result = scheduler.wait_for_result(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(result, "echo:hello");

        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 1);
        assert_eq!(task.target_model, "fast");
        assert_eq!(scheduler.stats().total_completed, 1);
    }

    #[tokio::test]
    async fn test_start_order_follows_priority_then_fifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let handler = handler_fn(move |req: TaskRequest| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push(req.payload.clone());
                Ok(req.payload)
            }
        });
        let scheduler = Scheduler::builder("ordered", handler)
            .config(quick_config().with_max_concurrent(1))
            .paused()
            .build()
            .unwrap();

        for (payload, priority) in [
            ("low", Priority::Low),
            ("urgent", Priority::Urgent),
            ("normal-1", Priority::Normal),
            ("normal-2", Priority::Normal),
            ("high", Priority::High),
            ("background", Priority::Background),
        ] {
            scheduler.enqueue(TaskSpec::new(payload).priority(priority)).unwrap();
        }
        scheduler.resume();
        scheduler.wait_for_all(Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(
            *order.lock().unwrap(),
            vec!["urgent", "high", "normal-1", "normal-2", "low", "background"]
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_holds_extra_task() {
        let scheduler = Scheduler::new("cap", quick_config().with_max_concurrent(2), never()).unwrap();
        let mut rx = scheduler.subscribe();

        let a = scheduler.enqueue(TaskSpec::new("a")).unwrap();
        let b = scheduler.enqueue(TaskSpec::new("b")).unwrap();
        let c = scheduler.enqueue(TaskSpec::new("c")).unwrap();

        assert_eq!(next_started(&mut rx).await, a);
        assert_eq!(next_started(&mut rx).await, b);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(scheduler.running_count(), 2);
        assert_eq!(scheduler.queue_len(), 1);
        assert_eq!(scheduler.get_task(c).unwrap().status, TaskStatus::Pending);

        assert!(scheduler.cancel(a));
        assert_eq!(next_started(&mut rx).await, c);
        assert_eq!(scheduler.running_count(), 2);
        assert_eq!(scheduler.status().stats.peak_load, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_handler_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_req: TaskRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(eyre::eyre!("backend down")) }
        });
        let config = quick_config().with_retries(3, 100, 300);
        let scheduler = Scheduler::new("flaky", config, handler).unwrap();
        let mut rx = scheduler.subscribe();

        let id = scheduler.enqueue(TaskSpec::new("doomed")).unwrap();
        let err = scheduler.wait_for_result(id, None).await.unwrap_err();
        match err {
            FleetError::TerminalFailure { attempts, error, .. } => {
                assert_eq!(attempts, 4);
                assert!(error.contains("backend down"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let mut delays = Vec::new();
        let mut failed = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                SchedulerEvent::Retrying { delay_ms, .. } => delays.push(delay_ms),
                SchedulerEvent::Failed { attempts, .. } => {
                    assert_eq!(attempts, 4);
                    failed += 1;
                }
                _ => {}
            }
        }
        assert_eq!(delays, vec![100, 200, 300]);
        assert_eq!(failed, 1);

        let stats = scheduler.stats();
        assert_eq!(stats.total_retries, 3);
        assert_eq!(stats.total_failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_abandons_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_req: TaskRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(eyre::eyre!("rate limited upstream")) }
        });
        let scheduler = Scheduler::new("backoff", quick_config().with_retries(3, 1000, 1000), handler).unwrap();
        let mut rx = scheduler.subscribe();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        loop {
            if let SchedulerEvent::Retrying { id: retrying, .. } = rx.recv().await.unwrap() {
                assert_eq!(retrying, id);
                break;
            }
        }
        assert_eq!(scheduler.retrying_count(), 1);
        assert!(scheduler.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.retrying_count(), 0);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(scheduler.get_task(id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(scheduler.stats().total_cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_are_throttled_by_rate_limit() {
        let config = quick_config()
            .with_max_concurrent(50)
            .with_rate_limit(RateLimitConfig::new(2, 1.0));
        let scheduler = Scheduler::new("throttled", config, echo()).unwrap();
        let mut rx = scheduler.subscribe();

        let start = Instant::now();
        for i in 0..5 {
            scheduler.enqueue(TaskSpec::new(format!("p{}", i))).unwrap();
        }
        let mut offsets = Vec::new();
        for _ in 0..5 {
            next_started(&mut rx).await;
            offsets.push(start.elapsed());
        }

        // Burst of two, then one start per refilled token
        assert!(offsets[1] < Duration::from_millis(10), "offsets {:?}", offsets);
        for pair in offsets[1..].windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= Duration::from_millis(990), "offsets {:?}", offsets);
            assert!(gap <= Duration::from_millis(1010), "offsets {:?}", offsets);
        }
        assert!(offsets[4] >= Duration::from_millis(2990));
        scheduler.wait_for_all(None).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success_keeps_id() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |req: TaskRequest| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(eyre::eyre!("transient"))
                } else {
                    Ok(format!("ok on attempt {}", req.attempt))
                }
            }
        });
        let scheduler = Scheduler::new("retry", quick_config().with_retries(2, 50, 50), handler).unwrap();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        let result = scheduler.wait_for_result(id, None).await.unwrap();
        assert_eq!(result, "ok on attempt 2");
        assert_eq!(scheduler.get_task(id).unwrap().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let handler = handler_fn(|_req: TaskRequest| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok("too late".to_string())
        });
        let scheduler = Scheduler::new("slow", quick_config().with_timeout_ms(50), handler).unwrap();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        let task = scheduler.wait_for(id, None).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("Task timed out after 50ms"));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_failure() {
        let handler = handler_fn(|req: TaskRequest| async move {
            if req.attempt > 0 {
                panic!("boom");
            }
            Ok(String::new())
        });
        let scheduler = Scheduler::new("panics", quick_config(), handler).unwrap();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        let task = scheduler.wait_for(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_cancel_pending_never_invokes_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let handler = handler_fn(move |_req: TaskRequest| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(String::new()) }
        });
        let scheduler = Scheduler::builder("cancel", handler)
            .config(quick_config())
            .paused()
            .build()
            .unwrap();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        assert!(!scheduler.cancel(TaskId::new(999)));

        scheduler.resume();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.get_task(id).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(
            scheduler.wait_for_result(id, None).await,
            Err(FleetError::Cancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_running_discards_result() {
        let gate = Arc::new(Notify::new());
        let release = Arc::clone(&gate);
        let handler = handler_fn(move |_req: TaskRequest| {
            let gate = Arc::clone(&release);
            async move {
                gate.notified().await;
                Ok("late".to_string())
            }
        });
        let scheduler = Scheduler::new("discard", quick_config(), handler).unwrap();
        let mut rx = scheduler.subscribe();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        assert_eq!(next_started(&mut rx).await, id);
        assert!(scheduler.cancel(id));
        assert_eq!(scheduler.running_count(), 0);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());
        assert_eq!(scheduler.stats().total_completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_queue_while_running_drains() {
        let handler = handler_fn(|req: TaskRequest| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(req.payload)
        });
        let scheduler = Scheduler::new("pausable", quick_config().with_max_concurrent(2), handler).unwrap();
        let mut rx = scheduler.subscribe();

        let ids: Vec<TaskId> = (0..4)
            .map(|i| scheduler.enqueue(TaskSpec::new(format!("p{}", i))).unwrap())
            .collect();
        next_started(&mut rx).await;
        next_started(&mut rx).await;

        scheduler.pause();
        assert!(scheduler.is_paused());
        assert_eq!(scheduler.queue_len(), 2);

        scheduler.wait_for(ids[0], None).await.unwrap();
        scheduler.wait_for(ids[1], None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(scheduler.running_count(), 0);
        assert_eq!(scheduler.queue_len(), 2);

        scheduler.resume();
        let done = scheduler.wait_for_all(None).await.unwrap();
        assert_eq!(done.len(), 2);
        assert_eq!(scheduler.stats().total_completed, 4);
    }

    #[tokio::test]
    async fn test_task_handler_override() {
        let scheduler = Scheduler::new("override", quick_config(), echo()).unwrap();
        let custom = handler_fn(|_req: TaskRequest| async move { Ok("custom".to_string()) });

        let id = scheduler.enqueue(TaskSpec::new("x").handler(custom)).unwrap();
        let other = scheduler.enqueue(TaskSpec::new("y")).unwrap();

        assert_eq!(scheduler.wait_for_result(id, None).await.unwrap(), "custom");
        assert_eq!(scheduler.wait_for_result(other, None).await.unwrap(), "echo:y");
    }

    #[tokio::test]
    async fn test_wait_for_unknown_and_timeout() {
        let scheduler = Scheduler::new("waits", quick_config(), never()).unwrap();
        assert!(matches!(
            scheduler.wait_for(TaskId::new(42), None).await,
            Err(FleetError::TaskNotFound(_))
        ));

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        let err = scheduler.wait_for(id, Some(Duration::from_millis(20))).await.unwrap_err();
        assert!(matches!(err, FleetError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn test_timed_out_waiters_do_not_accumulate() {
        let scheduler = Scheduler::builder("held", echo())
            .config(quick_config())
            .paused()
            .build()
            .unwrap();
        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();

        for _ in 0..5 {
            let err = scheduler.wait_for(id, Some(Duration::from_millis(5))).await.unwrap_err();
            assert!(matches!(err, FleetError::WaitTimeout(_)));
        }
        assert_eq!(scheduler.inner.state().waiters[&id].len(), 1);

        scheduler.resume();
        let task = scheduler.wait_for(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(scheduler.inner.state().waiters.is_empty());
    }

    #[tokio::test]
    async fn test_finished_retention_evicts_oldest() {
        let config = SchedulerConfig {
            max_retained: 2,
            ..quick_config()
        };
        let scheduler = Scheduler::new("retain", config, echo()).unwrap();
        let first = scheduler.enqueue(TaskSpec::new("1")).unwrap();
        scheduler.wait_for(first, None).await.unwrap();
        for payload in ["2", "3"] {
            let id = scheduler.enqueue(TaskSpec::new(payload)).unwrap();
            scheduler.wait_for(id, None).await.unwrap();
        }

        assert!(scheduler.get_task(first).is_none());
        assert_eq!(scheduler.status().finished, 2);
        assert_eq!(scheduler.clear_finished(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_and_refuses_work() {
        let scheduler = Scheduler::builder("closing", echo())
            .config(quick_config())
            .paused()
            .build()
            .unwrap();
        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();

        assert_eq!(scheduler.shutdown(), 1);
        assert!(scheduler.is_closed());
        assert_eq!(scheduler.get_task(id).unwrap().status, TaskStatus::Cancelled);
        assert!(matches!(
            scheduler.enqueue(TaskSpec::new("y")),
            Err(FleetError::ShutDown(_))
        ));
        assert_eq!(scheduler.shutdown(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cp.json");
        let config = quick_config().with_checkpoint(&path);

        let first = Scheduler::builder("persist", echo())
            .config(config.clone())
            .paused()
            .build()
            .unwrap();
        first.enqueue(TaskSpec::new("one").priority(Priority::Low)).unwrap();
        first.enqueue(TaskSpec::new("two").priority(Priority::Urgent)).unwrap();
        first.enqueue(TaskSpec::new("three")).unwrap();
        drop(first);

        let restored = Scheduler::builder("persist", echo())
            .config(config)
            .paused()
            .build()
            .unwrap();
        let queued = restored.queue_snapshot();
        let summary: Vec<(&str, Priority, TaskStatus)> = queued
            .iter()
            .map(|t| (t.payload.as_str(), t.priority, t.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("two", Priority::Urgent, TaskStatus::Pending),
                ("three", Priority::Normal, TaskStatus::Pending),
                ("one", Priority::Low, TaskStatus::Pending),
            ]
        );

        let next = restored.enqueue(TaskSpec::new("four")).unwrap();
        assert_eq!(next, TaskId::new(4));
    }

    #[tokio::test]
    async fn test_checkpoint_restores_attempts() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cp.json");
        let mut task = Task::from_spec(TaskId::new(7), TaskSpec::new("again"), "m", 3, 0);
        task.attempts = 2;
        Checkpoint::new(vec![CheckpointTask::from(&task)], 8).save(&path).unwrap();

        let scheduler = Scheduler::builder("restore", echo())
            .config(quick_config().with_checkpoint(&path))
            .paused()
            .build()
            .unwrap();
        let restored = scheduler.get_task(TaskId::new(7)).unwrap();
        assert_eq!(restored.attempts, 2);
        assert_eq!(restored.status, TaskStatus::Pending);
        assert_eq!(scheduler.ids().peek(), 8);
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_is_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cp.json");
        std::fs::write(&path, "{ definitely not json").unwrap();

        let scheduler = Scheduler::new("corrupt", quick_config().with_checkpoint(&path), echo()).unwrap();
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_drops_finished_work() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cp.json");
        let scheduler = Scheduler::new("drop", quick_config().with_checkpoint(&path), echo()).unwrap();

        let id = scheduler.enqueue(TaskSpec::new("x")).unwrap();
        scheduler.wait_for(id, None).await.unwrap();

        let checkpoint = Checkpoint::load(&path).unwrap().unwrap();
        assert!(checkpoint.queued.is_empty());
        assert_eq!(checkpoint.next_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_checkpoint_flushes_later() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cp.json");
        let config = SchedulerConfig {
            checkpoint_interval_ms: Some(100),
            ..quick_config().with_checkpoint(&path)
        };
        let scheduler = Scheduler::builder("lazy", echo()).config(config).paused().build().unwrap();

        scheduler.enqueue(TaskSpec::new("x")).unwrap();
        assert!(!path.exists());

        tokio::time::sleep(Duration::from_millis(250)).await;
        let checkpoint = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(checkpoint.queued.len(), 1);
    }
}
