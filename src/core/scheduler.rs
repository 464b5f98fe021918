//! Task scheduler.
//!
//! A scheduler owns up to three lanes, depending on its [`ExecutionMode`]:
//!
//! - a **serial lane**: a single-concurrency queue (serial and mixed modes)
//! - an **executor pool** sized to `max_concurrency` (parallel and mixed)
//! - a priority **overflow queue** holding pool tasks while every executor
//!   is busy; idle executors always take its highest-priority task first
//!
//! Mixed mode routes by priority: `>= 8` goes to the pool, `<= 2` to the
//! serial lane, anything in between to the pool while utilization is below
//! 0.7 and to the serial lane otherwise.
//!
//! Task failures never surface as errors from the scheduler. Only
//! [`schedule`](TaskScheduler::schedule) returns errors, for rate-limit,
//! configuration and admission rejections (a task id already in flight or a
//! task that is no longer pending); execution results travel over the
//! [`EventBus`] and the task's callbacks.

use crate::config::{ExecutionMode, ExecutorConfig, QueueConfig, QueueKind, SchedulerConfig};
use crate::core::concurrency::ConcurrencyTarget;
use crate::core::executor::{ExecutionOutcome, TaskExecutor};
use crate::error::{FailureKind, LaunchError, LaunchResult, RejectReason};
use crate::events::{DeadLetterEvent, Event, EventBus, RetryEvent, SchedulerEvent, next_event};
use crate::queue::{CancelOutcome, OutcomeSink, QueueFactory, TaskQueue};
use crate::task::{Task, TaskId, TaskState, meta};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RESPONSE_WINDOW: usize = 1000;
const RESPONSE_KEEP: usize = 500;
const HIGH_PRIORITY: i32 = 8;
const LOW_PRIORITY: i32 = 2;
const MIXED_UTILIZATION_LIMIT: f64 = 0.7;

/// Where a scheduled task was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionPath {
    /// The serial lane
    Serial,
    /// Straight to an idle pool executor
    Parallel,
    /// The overflow queue, waiting for a pool executor
    Queued,
}

/// Scheduler statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    /// Tasks accepted, resubmissions included
    pub total_scheduled: u64,
    /// Tasks currently executing
    pub current_running: usize,
    /// Tasks waiting in a lane
    pub pending: usize,
    /// Tasks completed successfully
    pub completed: u64,
    /// Tasks cancelled
    pub cancelled: u64,
    /// Tasks that failed or timed out
    pub failed: u64,
    /// Schedule calls refused by the rate limiter
    pub rejected: u64,
    /// Average time from acceptance to completion
    pub average_response_time: Duration,
    /// Completed tasks per second since creation
    pub throughput: f64,
    /// Running tasks over capacity
    pub queue_utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lane {
    Serial,
    Pool,
}

struct InFlight {
    lane: Lane,
    attempt: u32,
    generation: u64,
    scheduled_at: Instant,
    token: Option<CancellationToken>,
}

struct Lanes {
    mode: ExecutionMode,
    generation: u64,
    serial: Option<Arc<dyn TaskQueue>>,
    overflow: Option<Arc<dyn TaskQueue>>,
    pool: Vec<Arc<TaskExecutor>>,
    pool_running: usize,
    concurrency: usize,
}

#[derive(Default)]
struct StatsState {
    stats: SchedulerStats,
    response_times: VecDeque<Duration>,
}

struct RateWindow {
    started: Instant,
    count: u32,
}

struct SchedulerInner {
    id: String,
    bus: EventBus,
    executor_config: ExecutorConfig,
    config: RwLock<SchedulerConfig>,
    lanes: Mutex<Lanes>,
    inflight: Mutex<HashMap<TaskId, InFlight>>,
    stats: Mutex<StatsState>,
    rate: parking_lot::Mutex<Option<RateWindow>>,
    outcome_tx: OutcomeSink,
    /// Pool executions that ended without an outcome
    released_tx: mpsc::UnboundedSender<TaskId>,
    running: AtomicBool,
    destroyed: AtomicBool,
    created_at: Instant,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a scheduler. Cloning shares the same scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Create a stopped scheduler.
    pub async fn new(
        id: impl Into<String>,
        config: SchedulerConfig,
        executor_config: ExecutorConfig,
        bus: EventBus,
    ) -> LaunchResult<Self> {
        config
            .validate()
            .map_err(|errors| LaunchError::config(errors.join("; ")))?;

        let id = id.into();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (released_tx, released_rx) = mpsc::unbounded_channel();
        let lanes = build_lanes(&id, &config, &executor_config, &bus, &outcome_tx, 0).await?;
        let mode = config.mode;

        let inner = Arc::new(SchedulerInner {
            id: id.clone(),
            bus: bus.clone(),
            executor_config,
            config: RwLock::new(config),
            lanes: Mutex::new(lanes),
            inflight: Mutex::new(HashMap::new()),
            stats: Mutex::new(StatsState::default()),
            rate: parking_lot::Mutex::new(None),
            outcome_tx,
            released_tx,
            running: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            created_at: Instant::now(),
            background: parking_lot::Mutex::new(Vec::new()),
        });

        let outcome_loop = tokio::spawn(outcome_loop(Arc::downgrade(&inner), outcome_rx, released_rx));
        let resubmit_loop = tokio::spawn(resubmit_loop(Arc::downgrade(&inner), bus.subscribe()));
        inner.background.lock().extend([outcome_loop, resubmit_loop]);

        bus.publish(Event::Scheduler(SchedulerEvent::Initialized {
            scheduler_id: id.clone(),
            mode,
        }));
        tracing::info!("🗓️ Scheduler {} initialized in {} mode", id, mode.as_str());

        Ok(Self { inner })
    }

    /// Scheduler identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether the scheduler is dispatching.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Current execution mode.
    pub async fn mode(&self) -> ExecutionMode {
        self.inner.lanes.lock().await.mode
    }

    /// Copy of the current configuration.
    pub async fn config(&self) -> SchedulerConfig {
        self.inner.config.read().await.clone()
    }

    /// Accept a task.
    ///
    /// Fails synchronously when the scheduler is destroyed, its configuration
    /// does not validate, the task is not pending, its id is already in
    /// flight, or the rate-limit window is full. A rejected task never enters
    /// a lane.
    pub async fn schedule(&self, task: Task) -> LaunchResult<TaskId> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::rejected(
                RejectReason::NotAccepting,
                format!("scheduler {} is destroyed", inner.id),
            ));
        }

        let config = inner.config.read().await.clone();
        if let Err(errors) = config.validate() {
            return Err(LaunchError::rejected(
                RejectReason::InvalidConfig,
                errors.join("; "),
            ));
        }

        inner.check_admissible(&task).await?;

        if let Some(limit) = &config.rate_limit {
            let admitted = {
                let mut rate = inner.rate.lock();
                let now = Instant::now();
                let window = rate.get_or_insert(RateWindow {
                    started: now,
                    count: 0,
                });
                if now >= window.started + limit.window() {
                    window.started = now;
                    window.count = 0;
                }
                if window.count >= limit.max_tasks {
                    false
                } else {
                    window.count += 1;
                    true
                }
            };

            if !admitted {
                inner.stats.lock().await.stats.rejected += 1;
                inner
                    .bus
                    .publish(Event::Scheduler(SchedulerEvent::RateLimitExceeded {
                        scheduler_id: inner.id.clone(),
                        max_tasks: limit.max_tasks,
                        window_ms: limit.window_ms,
                    }));
                tracing::warn!(
                    "🗓️ Scheduler {} rate limit exceeded ({} tasks per {}ms)",
                    inner.id,
                    limit.max_tasks,
                    limit.window_ms
                );
                return Err(LaunchError::rejected(
                    RejectReason::RateLimited,
                    format!("{} tasks per {}ms", limit.max_tasks, limit.window_ms),
                ));
            }
        }

        inner.submit(task).await
    }

    /// Start dispatching.
    pub async fn start(&self) -> LaunchResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        if inner.running.swap(true, Ordering::AcqRel) {
            return Err(LaunchError::AlreadyRunning);
        }

        let serial = inner.lanes.lock().await.serial.clone();
        if let Some(serial) = serial {
            serial.start().await?;
        }
        inner.fill_pool().await;

        inner.bus.publish(Event::Scheduler(SchedulerEvent::Started {
            scheduler_id: inner.id.clone(),
        }));
        tracing::info!("🗓️ Scheduler {} started", inner.id);
        Ok(())
    }

    /// Stop dispatching. Running tasks finish; pending tasks stay queued.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let serial = inner.lanes.lock().await.serial.clone();
        if let Some(serial) = serial {
            serial.stop().await;
        }

        inner.bus.publish(Event::Scheduler(SchedulerEvent::Stopped {
            scheduler_id: inner.id.clone(),
        }));
        tracing::info!("🗓️ Scheduler {} stopped", inner.id);
    }

    /// Cancel one task. Pending tasks are removed; running tasks get their
    /// cancellation token triggered. Returns whether the task was found.
    pub async fn cancel(&self, task_id: &str) -> LaunchResult<bool> {
        if !self.inner.config.read().await.enable_cancellation {
            return Err(LaunchError::config("Cancellation is disabled"));
        }
        Ok(self.inner.cancel_task(task_id).await)
    }

    /// Cancel every task the scheduler is tracking. Returns how many were
    /// found.
    pub async fn cancel_all(&self) -> LaunchResult<usize> {
        if !self.inner.config.read().await.enable_cancellation {
            return Err(LaunchError::config("Cancellation is disabled"));
        }
        let count = self.inner.cancel_everything().await;

        self.inner
            .bus
            .publish(Event::Scheduler(SchedulerEvent::AllTasksCancelled {
                scheduler_id: self.inner.id.clone(),
                count,
            }));
        tracing::info!("🗓️ Scheduler {} cancelled {} tasks", self.inner.id, count);
        Ok(count)
    }

    /// Switch execution mode.
    ///
    /// Stops the scheduler, cancels running work when cancellation is
    /// enabled, tears the lanes down and rebuilds them for the new mode.
    /// Pending tasks are carried over and re-routed. The scheduler restarts
    /// if it was running.
    pub async fn switch_mode(&self, mode: ExecutionMode) -> LaunchResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }

        let from = inner.lanes.lock().await.mode;
        if from == mode {
            return Ok(());
        }

        self.config()
            .await
            .with_mode(mode)
            .validate()
            .map_err(|errors| LaunchError::config(errors.join("; ")))?;

        let was_running = self.is_running();
        self.stop().await;

        let config = {
            let mut config = inner.config.write().await;
            config.mode = mode;
            config.clone()
        };

        if config.enable_cancellation {
            inner.cancel_running().await;
        }

        let mut leftovers = Vec::new();
        {
            let mut lanes = inner.lanes.lock().await;
            for queue in [lanes.serial.take(), lanes.overflow.take()].into_iter().flatten() {
                leftovers.extend(queue.drain().await);
                if config.enable_cancellation {
                    queue.destroy().await;
                }
            }

            let generation = lanes.generation + 1;
            *lanes = build_lanes(
                &inner.id,
                &config,
                &inner.executor_config,
                &inner.bus,
                &inner.outcome_tx,
                generation,
            )
            .await?;
        }

        tracing::info!(
            "🗓️ Scheduler {} switching {} -> {}, re-routing {} pending tasks",
            inner.id,
            from.as_str(),
            mode.as_str(),
            leftovers.len()
        );
        for mut task in leftovers {
            task.metadata.insert(meta::MODE.into(), mode.as_str().into());
            inner.inflight.lock().await.remove(&task.id);
            inner.route(task).await?;
        }

        if was_running {
            self.start().await?;
        }

        inner.bus.publish(Event::Scheduler(SchedulerEvent::ModeChanged {
            scheduler_id: inner.id.clone(),
            from,
            to: mode,
        }));
        Ok(())
    }

    /// Resize the executor pool.
    pub async fn set_max_concurrency(&self, max_concurrency: usize) -> LaunchResult<()> {
        if max_concurrency == 0 {
            return Err(LaunchError::config(
                "Scheduler max concurrency must be greater than 0",
            ));
        }
        let inner = &self.inner;
        inner.config.write().await.max_concurrency = max_concurrency;

        {
            let mut lanes = inner.lanes.lock().await;
            lanes.concurrency = max_concurrency;
            if lanes.mode != ExecutionMode::Serial {
                let source = parallel_lane_id(&inner.id);
                while lanes.pool.len() < max_concurrency {
                    let index = lanes.pool.len();
                    lanes.pool.push(pool_executor(
                        &source,
                        index,
                        &inner.executor_config,
                        &inner.bus,
                    ));
                }
                lanes.pool.truncate(max_concurrency);
            }
        }

        tracing::debug!(
            "🗓️ Scheduler {} max concurrency set to {}",
            inner.id,
            max_concurrency
        );
        inner.fill_pool().await;
        Ok(())
    }

    /// Apply a partial configuration update.
    pub async fn update_config(
        &self,
        update: impl FnOnce(&mut SchedulerConfig),
    ) -> LaunchResult<()> {
        let current = self.config().await;
        let mut next = current.clone();
        update(&mut next);
        next.validate()
            .map_err(|errors| LaunchError::config(errors.join("; ")))?;

        {
            let mut config = self.inner.config.write().await;
            let mode = config.mode;
            *config = next.clone();
            config.mode = mode;
        }
        if next.rate_limit.as_ref().map(|l| (l.window_ms, l.max_tasks))
            != current.rate_limit.as_ref().map(|l| (l.window_ms, l.max_tasks))
        {
            *self.inner.rate.lock() = None;
        }
        if next.max_concurrency != current.max_concurrency {
            self.set_max_concurrency(next.max_concurrency).await?;
        }
        if next.mode != current.mode {
            self.switch_mode(next.mode).await?;
        }

        self.inner
            .bus
            .publish(Event::Scheduler(SchedulerEvent::ConfigUpdated {
                scheduler_id: self.inner.id.clone(),
            }));
        Ok(())
    }

    /// Current statistics.
    pub async fn stats(&self) -> SchedulerStats {
        self.inner.current_stats().await
    }

    /// Stop, cancel everything and release the lanes and background tasks.
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        self.stop().await;
        if inner.config.read().await.enable_cancellation {
            inner.cancel_everything().await;
        }
        inner.destroyed.store(true, Ordering::Release);

        {
            let mut lanes = inner.lanes.lock().await;
            for queue in [lanes.serial.take(), lanes.overflow.take()].into_iter().flatten() {
                queue.destroy().await;
            }
            for executor in lanes.pool.drain(..) {
                executor.destroy();
            }
        }
        for handle in inner.background.lock().drain(..) {
            handle.abort();
        }

        inner.bus.publish(Event::Scheduler(SchedulerEvent::Destroyed {
            scheduler_id: inner.id.clone(),
        }));
        tracing::info!("🗓️ Scheduler {} destroyed", inner.id);
    }
}

#[async_trait]
impl ConcurrencyTarget for TaskScheduler {
    fn target_id(&self) -> &str {
        self.id()
    }

    async fn active_tasks(&self) -> usize {
        self.inner.current_stats().await.current_running
    }

    async fn capacity(&self) -> usize {
        self.inner.lanes.lock().await.concurrency
    }

    async fn apply_concurrency(&self, concurrency: usize) -> LaunchResult<()> {
        self.set_max_concurrency(concurrency).await
    }
}

fn serial_lane_id(scheduler_id: &str) -> String {
    format!("{}:serial", scheduler_id)
}

fn parallel_lane_id(scheduler_id: &str) -> String {
    format!("{}:parallel", scheduler_id)
}

fn pool_executor(
    source: &str,
    index: usize,
    config: &ExecutorConfig,
    bus: &EventBus,
) -> Arc<TaskExecutor> {
    Arc::new(TaskExecutor::new(
        format!("{}#{}", source, index),
        source,
        config.clone(),
        bus.clone(),
    ))
}

async fn build_lanes(
    id: &str,
    config: &SchedulerConfig,
    executor_config: &ExecutorConfig,
    bus: &EventBus,
    sink: &OutcomeSink,
    generation: u64,
) -> LaunchResult<Lanes> {
    let executor_config = executor_config
        .clone()
        .with_default_timeout(config.queue.timeout_ms);
    let mut lanes = Lanes {
        mode: config.mode,
        generation,
        serial: None,
        overflow: None,
        pool: Vec::new(),
        pool_running: 0,
        concurrency: config.max_concurrency,
    };

    if config.mode != ExecutionMode::Parallel {
        let serial_config = QueueConfig {
            concurrency: 1,
            autostart: false,
            ..config.queue.clone()
        };
        lanes.serial = Some(
            QueueFactory::build(
                serial_lane_id(id),
                &serial_config,
                bus.clone(),
                executor_config.clone(),
                Some(sink.clone()),
            )
            .await?,
        );
    }

    if config.mode != ExecutionMode::Serial {
        let overflow_config = QueueConfig {
            kind: QueueKind::Priority,
            concurrency: 1,
            autostart: false,
            ..config.queue.clone()
        };
        let source = parallel_lane_id(id);
        lanes.overflow = Some(
            QueueFactory::build(
                source.clone(),
                &overflow_config,
                bus.clone(),
                executor_config.clone(),
                None,
            )
            .await?,
        );
        lanes.pool = (0..config.max_concurrency)
            .map(|i| pool_executor(&source, i, &executor_config, bus))
            .collect();
    }

    Ok(lanes)
}

impl SchedulerInner {
    fn publish(&self, event: SchedulerEvent) {
        self.bus.publish(Event::Scheduler(event));
    }

    /// Enrich, track and route a task that passed admission.
    async fn submit(self: &Arc<Self>, mut task: Task) -> LaunchResult<TaskId> {
        if task.state() != TaskState::Pending {
            return Err(LaunchError::rejected(
                RejectReason::NotPending,
                format!("task {} is {:?}", task.id, task.state()),
            ));
        }
        let mode = self.lanes.lock().await.mode;
        task.metadata
            .insert(meta::SCHEDULER_ID.into(), self.id.clone().into());
        task.metadata.insert(meta::MODE.into(), mode.as_str().into());
        task.metadata
            .insert(meta::SCHEDULED_AT.into(), Utc::now().into());

        let task_id = task.id.clone();
        let priority = task.priority;
        let path = self.route(task).await?;
        self.stats.lock().await.stats.total_scheduled += 1;
        self.publish(SchedulerEvent::TaskScheduled {
            scheduler_id: self.id.clone(),
            task_id: task_id.clone(),
            priority,
            path,
        });
        tracing::debug!(
            "🗓️ Scheduler {} accepted task {} (priority {}, {:?})",
            self.id,
            task_id,
            priority,
            path
        );
        Ok(task_id)
    }

    /// Put a task into the lane its mode and priority call for.
    async fn route(self: &Arc<Self>, task: Task) -> LaunchResult<ExecutionPath> {
        let lane = {
            let lanes = self.lanes.lock().await;
            match lanes.mode {
                ExecutionMode::Serial => Lane::Serial,
                ExecutionMode::Parallel => Lane::Pool,
                ExecutionMode::Mixed if task.priority >= HIGH_PRIORITY => Lane::Pool,
                ExecutionMode::Mixed if task.priority <= LOW_PRIORITY => Lane::Serial,
                ExecutionMode::Mixed => {
                    let utilization = lanes.pool_running as f64 / lanes.concurrency.max(1) as f64;
                    if utilization < MIXED_UTILIZATION_LIMIT {
                        Lane::Pool
                    } else {
                        Lane::Serial
                    }
                }
            }
        };

        let task_id = task.id.clone();
        let (queue, generation) = {
            let lanes = self.lanes.lock().await;
            let queue = match lane {
                Lane::Serial => lanes.serial.clone(),
                Lane::Pool => lanes.overflow.clone(),
            };
            (queue, lanes.generation)
        };
        let queue = queue.ok_or(LaunchError::Destroyed)?;

        {
            let mut inflight = self.inflight.lock().await;
            if inflight.contains_key(&task_id) {
                return Err(duplicate(&task_id));
            }
            inflight.insert(
                task_id.clone(),
                InFlight {
                    lane,
                    attempt: task.attempt(),
                    generation,
                    scheduled_at: Instant::now(),
                    token: None,
                },
            );
        }

        if let Err(e) = queue.push(task).await {
            self.inflight.lock().await.remove(&task_id);
            return Err(e);
        }

        match lane {
            Lane::Serial => Ok(ExecutionPath::Serial),
            Lane::Pool => {
                let dispatched = self.fill_pool().await;
                if dispatched.contains(&task_id) {
                    Ok(ExecutionPath::Parallel)
                } else {
                    Ok(ExecutionPath::Queued)
                }
            }
        }
    }

    /// Move overflow tasks onto idle pool executors. Returns the ids started.
    async fn fill_pool(self: &Arc<Self>) -> Vec<TaskId> {
        let mut dispatched = Vec::new();
        if !self.running.load(Ordering::Acquire) || self.destroyed.load(Ordering::Acquire) {
            return dispatched;
        }

        let mut lanes = self.lanes.lock().await;
        let Some(overflow) = lanes.overflow.clone() else {
            return dispatched;
        };

        while lanes.pool_running < lanes.concurrency {
            let Some(slot) = lanes.pool.iter().find_map(|e| e.try_claim()) else {
                break;
            };
            let Some(task) = overflow.pop().await else {
                break;
            };

            let token = CancellationToken::new();
            if let Some(entry) = self.inflight.lock().await.get_mut(&task.id) {
                entry.token = Some(token.clone());
            }
            lanes.pool_running += 1;
            dispatched.push(task.id.clone());

            let sink = self.outcome_tx.clone();
            let released = self.released_tx.clone();
            let scheduler_id = self.id.clone();
            tokio::spawn(async move {
                let task_id = task.id.clone();
                match slot.execute(task, token).await {
                    Ok(outcome) => {
                        let _ = sink.send(outcome);
                    }
                    Err(e) => {
                        tracing::warn!("🗓️ Scheduler {} pool execution lost: {}", scheduler_id, e);
                        let _ = released.send(task_id);
                    }
                }
            });
        }

        dispatched
    }

    async fn handle_outcome(self: &Arc<Self>, outcome: ExecutionOutcome) {
        let task_id = outcome.task.id.clone();
        let entry = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&task_id) {
                Some(entry) if entry.attempt == outcome.task.attempt() => inflight.remove(&task_id),
                _ => None,
            }
        };

        if let Some(entry) = &entry {
            if entry.lane == Lane::Pool {
                let mut lanes = self.lanes.lock().await;
                if lanes.generation == entry.generation {
                    lanes.pool_running = lanes.pool_running.saturating_sub(1);
                }
            }
        }

        {
            let mut state = self.stats.lock().await;
            match &outcome.result {
                Ok(_) => {
                    state.stats.completed += 1;
                    if let Some(entry) = &entry {
                        let response = entry.scheduled_at.elapsed();
                        state.response_times.push_back(response);
                        if state.response_times.len() > RESPONSE_WINDOW {
                            let excess = state.response_times.len() - RESPONSE_KEEP;
                            state.response_times.drain(..excess);
                        }
                    }
                }
                Err(f) if f.kind == FailureKind::Cancelled => state.stats.cancelled += 1,
                Err(_) => state.stats.failed += 1,
            }
        }

        match outcome.result {
            Ok(_) => self.publish(SchedulerEvent::TaskCompleted {
                scheduler_id: self.id.clone(),
                task_id,
                duration: outcome.duration,
            }),
            Err(failure) if failure.kind == FailureKind::Cancelled => {
                self.publish(SchedulerEvent::TaskCancelled {
                    scheduler_id: self.id.clone(),
                    task_id,
                })
            }
            Err(failure) => self.publish(SchedulerEvent::TaskFailed {
                scheduler_id: self.id.clone(),
                task_id,
                failure,
            }),
        }

        self.fill_pool().await;
    }

    /// Refuse tasks that already ran or whose id is still in flight.
    async fn check_admissible(&self, task: &Task) -> LaunchResult<()> {
        if task.state() != TaskState::Pending {
            return Err(LaunchError::rejected(
                RejectReason::NotPending,
                format!("task {} is {:?}", task.id, task.state()),
            ));
        }
        if self.inflight.lock().await.contains_key(&task.id) {
            return Err(duplicate(&task.id));
        }
        Ok(())
    }

    /// Give back the pool slot of an execution that produced no outcome.
    async fn handle_released(self: &Arc<Self>, task_id: TaskId) {
        let entry = self.inflight.lock().await.remove(&task_id);
        if let Some(entry) = entry {
            if entry.lane == Lane::Pool {
                let mut lanes = self.lanes.lock().await;
                if lanes.generation == entry.generation {
                    lanes.pool_running = lanes.pool_running.saturating_sub(1);
                }
            }
        }
        self.fill_pool().await;
    }

    async fn cancel_task(&self, task_id: &str) -> bool {
        let lanes = self.lanes.lock().await;
        let (lane, token) = {
            let inflight = self.inflight.lock().await;
            match inflight.get(task_id) {
                Some(entry) => (entry.lane, entry.token.clone()),
                None => return false,
            }
        };

        if let Some(token) = token {
            token.cancel();
            return true;
        }

        let queue = match lane {
            Lane::Serial => lanes.serial.clone(),
            Lane::Pool => lanes.overflow.clone(),
        };
        drop(lanes);
        let Some(queue) = queue else { return false };

        match queue.cancel(task_id).await {
            CancelOutcome::Removed => {
                self.inflight.lock().await.remove(task_id);
                self.stats.lock().await.stats.cancelled += 1;
                self.publish(SchedulerEvent::TaskCancelled {
                    scheduler_id: self.id.clone(),
                    task_id: task_id.to_string(),
                });
                true
            }
            CancelOutcome::Signalled => true,
            CancelOutcome::NotFound => false,
        }
    }

    async fn cancel_everything(&self) -> usize {
        let ids: Vec<TaskId> = self.inflight.lock().await.keys().cloned().collect();
        let mut count = 0;
        for id in ids {
            if self.cancel_task(&id).await {
                count += 1;
            }
        }
        count
    }

    /// Signal every running pool task. Serial-lane work is signalled when
    /// its queue is destroyed.
    async fn cancel_running(&self) {
        for entry in self.inflight.lock().await.values() {
            if let Some(token) = &entry.token {
                token.cancel();
            }
        }
    }

    async fn current_stats(&self) -> SchedulerStats {
        let (serial, overflow, pool_running, capacity) = {
            let lanes = self.lanes.lock().await;
            let capacity = match lanes.mode {
                ExecutionMode::Serial => 1,
                _ => lanes.concurrency.max(1),
            };
            (
                lanes.serial.clone(),
                lanes.overflow.clone(),
                lanes.pool_running,
                capacity,
            )
        };

        let mut running = pool_running;
        let mut pending = 0;
        if let Some(serial) = serial {
            let stats = serial.stats().await;
            running += stats.running as usize;
            pending += (stats.pending + stats.delayed) as usize;
        }
        if let Some(overflow) = overflow {
            let stats = overflow.stats().await;
            pending += (stats.pending + stats.delayed) as usize;
        }

        let mut state = self.stats.lock().await;
        let stats = &mut state.stats;
        stats.current_running = running;
        stats.pending = pending;
        stats.queue_utilization = running as f64 / capacity as f64;
        let elapsed = self.created_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            stats.throughput = stats.completed as f64 / elapsed;
        }
        if !state.response_times.is_empty() {
            let total: Duration = state.response_times.iter().sum();
            state.stats.average_response_time = total / state.response_times.len() as u32;
        }
        state.stats.clone()
    }
}

fn duplicate(task_id: &str) -> LaunchError {
    LaunchError::rejected(
        RejectReason::Duplicate,
        format!("task {} is already queued or running", task_id),
    )
}

async fn outcome_loop(
    inner: Weak<SchedulerInner>,
    mut outcomes: mpsc::UnboundedReceiver<ExecutionOutcome>,
    mut released: mpsc::UnboundedReceiver<TaskId>,
) {
    loop {
        tokio::select! {
            outcome = outcomes.recv() => {
                let Some(outcome) = outcome else { break };
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_outcome(outcome).await;
            }
            Some(task_id) = released.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_released(task_id).await;
            }
        }
    }
}

/// Picks up retried and reprocessed tasks addressed to this scheduler.
/// Resubmissions bypass the rate limiter.
async fn resubmit_loop(
    inner: Weak<SchedulerInner>,
    mut events: tokio::sync::broadcast::Receiver<Event>,
) {
    while let Some(event) = next_event(&mut events).await {
        let task = match event {
            Event::Retry(RetryEvent::TaskStarted { task, .. }) => task,
            Event::DeadLetter(DeadLetterEvent::TaskReprocessed { task, .. }) => task,
            _ => continue,
        };
        let Some(inner) = inner.upgrade() else { break };
        if task.scheduler_id() != Some(inner.id.as_str())
            || inner.destroyed.load(Ordering::Acquire)
        {
            continue;
        }

        let task_id = task.id.clone();
        if let Err(e) = inner.submit(task).await {
            tracing::error!(
                "🗓️ Scheduler {} could not resubmit task {}: {}",
                inner.id,
                task_id,
                e
            );
        }
    }
}
