//! In-memory queue implementation.
//!
//! One [`InMemoryQueue`] type serves every [`QueueKind`]; the kind only
//! changes where a pushed task is inserted and whether it waits on a timer
//! first. A dispatcher task wakes up on every push and every finished
//! execution and hands pending tasks to idle executors.

use super::{CancelOutcome, OutcomeSink, QueueStats, TaskQueue};
use crate::config::{ExecutorConfig, QueueConfig, QueueKind};
use crate::core::executor::{ExecutionOutcome, TaskExecutor};
use crate::error::{LaunchError, LaunchResult};
use crate::events::{Event, EventBus, QueueEvent};
use crate::task::{Task, TaskId, TaskSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const DURATION_WINDOW: usize = 100;
const FINISHED_WINDOW: usize = 100;

struct RunningEntry {
    token: CancellationToken,
    snapshot: TaskSnapshot,
}

struct QueueState {
    pending: VecDeque<Task>,
    delayed: HashMap<TaskId, (Task, JoinHandle<()>)>,
    running: HashMap<TaskId, RunningEntry>,
    finished: VecDeque<TaskSnapshot>,
    executors: Vec<Arc<TaskExecutor>>,
    concurrency: usize,
    capacity: usize,
    stats: QueueStats,
    recent: VecDeque<Duration>,
}

impl QueueState {
    fn refresh_counts(&mut self) {
        self.stats.pending = self.pending.len() as u64;
        self.stats.delayed = self.delayed.len() as u64;
        self.stats.running = self.running.len() as u64;
    }

    fn remember(&mut self, snapshot: TaskSnapshot) {
        if self.finished.len() == FINISHED_WINDOW {
            self.finished.pop_front();
        }
        self.finished.push_back(snapshot);
    }
}

struct QueueInner {
    id: String,
    kind: QueueKind,
    bus: EventBus,
    executor_config: ExecutorConfig,
    sink: Option<OutcomeSink>,
    state: Mutex<QueueState>,
    notify: Notify,
    running: AtomicBool,
    destroyed: AtomicBool,
    created_at: Instant,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// Queue holding tasks in memory and running them on its own executors.
pub struct InMemoryQueue {
    inner: Arc<QueueInner>,
}

impl InMemoryQueue {
    /// Create a stopped queue.
    ///
    /// Executors created for the queue default to the queue's timeout and
    /// report under the queue id. When `sink` is set, every outcome is also
    /// forwarded there.
    pub fn new(
        id: impl Into<String>,
        config: &QueueConfig,
        bus: EventBus,
        executor_config: ExecutorConfig,
        sink: Option<OutcomeSink>,
    ) -> Self {
        let id = id.into();
        let executor_config = executor_config.with_default_timeout(config.timeout_ms);
        let concurrency = config.concurrency.max(1);
        let executors = (0..concurrency)
            .map(|i| new_executor(&id, i, &executor_config, &bus))
            .collect();

        Self {
            inner: Arc::new(QueueInner {
                id,
                kind: config.kind,
                bus,
                executor_config,
                sink,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    delayed: HashMap::new(),
                    running: HashMap::new(),
                    finished: VecDeque::new(),
                    executors,
                    concurrency,
                    capacity: config.capacity.max(1),
                    stats: QueueStats::default(),
                    recent: VecDeque::new(),
                }),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                created_at: Instant::now(),
                dispatcher: parking_lot::Mutex::new(None),
            }),
        }
    }
}

fn new_executor(
    queue_id: &str,
    index: usize,
    config: &ExecutorConfig,
    bus: &EventBus,
) -> Arc<TaskExecutor> {
    Arc::new(TaskExecutor::new(
        format!("{}#{}", queue_id, index),
        queue_id,
        config.clone(),
        bus.clone(),
    ))
}

impl QueueInner {
    fn publish(&self, event: QueueEvent) {
        self.bus.publish(Event::Queue(event));
    }

    fn cancelled(&self, state: &mut QueueState, mut task: Task) {
        if task.mark_cancelled().is_ok() {
            state.stats.cancelled += 1;
            let task_id = task.id.clone();
            state.remember(task.snapshot());
            self.publish(QueueEvent::TaskCancelled {
                source: self.id.clone(),
                task_id,
                was_started: false,
            });
        }
    }

    /// Make a task visible according to the queue kind.
    async fn admit(self: &Arc<Self>, task: Task) {
        let mut state = self.state.lock().await;
        let task_id = task.id.clone();
        let priority = task.priority;

        match self.kind {
            QueueKind::Priority => {
                let index = state
                    .pending
                    .iter()
                    .position(|t| t.priority < priority)
                    .unwrap_or(state.pending.len());
                state.pending.insert(index, task);
            }
            QueueKind::Circular => {
                while state.pending.len() >= state.capacity {
                    if let Some(evicted) = state.pending.pop_front() {
                        tracing::warn!(
                            "📦 Queue {} full, evicting oldest task {}",
                            self.id,
                            evicted.id
                        );
                        self.cancelled(&mut state, evicted);
                    }
                }
                state.pending.push_back(task);
            }
            QueueKind::Fifo | QueueKind::Delayed => state.pending.push_back(task),
        }
        state.refresh_counts();
        drop(state);

        self.publish(QueueEvent::TaskAdded {
            queue_id: self.id.clone(),
            task_id,
            priority,
        });
        self.notify.notify_one();
    }

    /// Hand pending tasks to idle executors.
    async fn dispatch_ready(self: &Arc<Self>) {
        if !self.running.load(Ordering::Acquire) || self.destroyed.load(Ordering::Acquire) {
            return;
        }

        let mut state = self.state.lock().await;
        while !state.pending.is_empty() {
            let slot = state
                .executors
                .iter()
                .take(state.concurrency)
                .find_map(|executor| executor.try_claim());
            let Some(slot) = slot else { break };
            let Some(task) = state.pending.pop_front() else { break };

            let token = CancellationToken::new();
            state.running.insert(
                task.id.clone(),
                RunningEntry {
                    token: token.clone(),
                    snapshot: task.snapshot(),
                },
            );

            let inner = Arc::clone(self);
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let result = slot.execute(task, token).await;
                inner.finish(&task_id, result).await;
                inner.notify.notify_one();
            });
        }
        state.refresh_counts();
    }

    async fn finish(&self, task_id: &str, result: LaunchResult<ExecutionOutcome>) {
        let mut state = self.state.lock().await;
        state.running.remove(task_id);

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("📦 Queue {} lost task {}: {}", self.id, task_id, e);
                state.refresh_counts();
                return;
            }
        };

        match &outcome.result {
            Ok(_) => state.stats.completed += 1,
            Err(_) if outcome.is_cancelled() => state.stats.cancelled += 1,
            Err(_) => state.stats.failed += 1,
        }
        if state.recent.len() == DURATION_WINDOW {
            state.recent.pop_front();
        }
        state.recent.push_back(outcome.duration);
        let total: Duration = state.recent.iter().sum();
        state.stats.average_execution_time = total / state.recent.len() as u32;

        let elapsed = self.created_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            state.stats.throughput = (state.stats.completed + state.stats.failed) as f64 / elapsed;
        }

        state.remember(outcome.task.snapshot());
        state.refresh_counts();
        drop(state);

        if let Some(sink) = &self.sink {
            if sink.send(outcome).is_err() {
                tracing::debug!("📦 Queue {} outcome receiver dropped", self.id);
            }
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            return;
        }
        let inner = Arc::clone(self);
        *dispatcher = Some(tokio::spawn(async move {
            loop {
                inner.dispatch_ready().await;
                inner.notify.notified().await;
            }
        }));
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn kind(&self) -> QueueKind {
        self.inner.kind
    }

    async fn push(&self, task: Task) -> LaunchResult<TaskId> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }

        let task_id = task.id.clone();
        let delay = match inner.kind {
            QueueKind::Delayed => task.delay(),
            _ => None,
        };

        match delay {
            Some(delay) => {
                let mut state = inner.state.lock().await;
                state.stats.total += 1;
                let timer_inner = Arc::clone(inner);
                let timer_id = task_id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let entry = timer_inner.state.lock().await.delayed.remove(&timer_id);
                    if let Some((task, _)) = entry {
                        timer_inner.admit(task).await;
                    }
                });
                state.delayed.insert(task_id.clone(), (task, timer));
                state.refresh_counts();
                tracing::debug!(
                    "📦 Queue {} holding task {} for {:?}",
                    inner.id,
                    task_id,
                    delay
                );
            }
            None => {
                inner.state.lock().await.stats.total += 1;
                inner.admit(task).await;
            }
        }

        Ok(task_id)
    }

    async fn start(&self) -> LaunchResult<()> {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        if inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        inner.spawn_dispatcher();
        inner.publish(QueueEvent::StateChanged {
            queue_id: inner.id.clone(),
            running: true,
        });
        inner.notify.notify_one();
        tracing::debug!("📦 Queue {} started", inner.id);
        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;
        if inner.running.swap(false, Ordering::AcqRel) {
            inner.publish(QueueEvent::StateChanged {
                queue_id: inner.id.clone(),
                running: false,
            });
            tracing::debug!("📦 Queue {} stopped", inner.id);
        }
    }

    fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    async fn cancel(&self, task_id: &str) -> CancelOutcome {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        if let Some((task, timer)) = state.delayed.remove(task_id) {
            timer.abort();
            inner.cancelled(&mut state, task);
            state.refresh_counts();
            return CancelOutcome::Removed;
        }

        if let Some(index) = state.pending.iter().position(|t| t.id == task_id) {
            if let Some(task) = state.pending.remove(index) {
                inner.cancelled(&mut state, task);
            }
            state.refresh_counts();
            return CancelOutcome::Removed;
        }

        match state.running.get(task_id) {
            Some(entry) => {
                entry.token.cancel();
                CancelOutcome::Signalled
            }
            None => CancelOutcome::NotFound,
        }
    }

    async fn pop(&self) -> Option<Task> {
        let mut state = self.inner.state.lock().await;
        let task = state.pending.pop_front();
        state.refresh_counts();
        task
    }

    async fn drain(&self) -> Vec<Task> {
        let mut state = self.inner.state.lock().await;
        let mut tasks: Vec<Task> = state.pending.drain(..).collect();
        for (_, (task, timer)) in state.delayed.drain() {
            timer.abort();
            tasks.push(task);
        }
        state.refresh_counts();
        tasks
    }

    async fn clear(&self) -> usize {
        let tasks = self.drain().await;
        let count = tasks.len();
        let mut state = self.inner.state.lock().await;
        for task in tasks {
            self.inner.cancelled(&mut state, task);
        }
        count
    }

    async fn get_task(&self, task_id: &str) -> Option<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        if let Some(task) = state.pending.iter().find(|t| t.id == task_id) {
            return Some(task.snapshot());
        }
        if let Some((task, _)) = state.delayed.get(task_id) {
            return Some(task.snapshot());
        }
        if let Some(entry) = state.running.get(task_id) {
            return Some(entry.snapshot.clone());
        }
        state.finished.iter().rev().find(|s| s.id == task_id).cloned()
    }

    async fn tasks(&self) -> Vec<TaskSnapshot> {
        let state = self.inner.state.lock().await;
        state.pending.iter().map(Task::snapshot).collect()
    }

    async fn len(&self) -> usize {
        self.inner.state.lock().await.pending.len()
    }

    async fn stats(&self) -> QueueStats {
        self.inner.state.lock().await.stats.clone()
    }

    async fn utilization(&self) -> f64 {
        let state = self.inner.state.lock().await;
        match self.inner.kind {
            QueueKind::Circular => state.pending.len() as f64 / state.capacity as f64,
            _ => state.running.len() as f64 / state.concurrency as f64,
        }
    }

    async fn set_concurrency(&self, concurrency: usize) -> LaunchResult<()> {
        if concurrency == 0 {
            return Err(LaunchError::config("Queue concurrency must be greater than 0"));
        }
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        while state.executors.len() < concurrency {
            let index = state.executors.len();
            let executor = new_executor(&inner.id, index, &inner.executor_config, &inner.bus);
            state.executors.push(executor);
        }
        state.executors.truncate(concurrency);
        state.concurrency = concurrency;
        drop(state);

        tracing::debug!("📦 Queue {} concurrency set to {}", inner.id, concurrency);
        inner.notify.notify_one();
        Ok(())
    }

    async fn set_capacity(&self, capacity: usize) -> LaunchResult<()> {
        let inner = &self.inner;
        if inner.kind != QueueKind::Circular {
            return Err(LaunchError::config(format!(
                "Queue {} is not circular",
                inner.id
            )));
        }
        if capacity == 0 {
            return Err(LaunchError::config(
                "Circular queue capacity must be greater than 0",
            ));
        }

        let mut state = inner.state.lock().await;
        state.capacity = capacity;
        while state.pending.len() > capacity {
            if let Some(evicted) = state.pending.pop_front() {
                inner.cancelled(&mut state, evicted);
            }
        }
        state.refresh_counts();
        Ok(())
    }

    async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop().await;
        self.clear().await;

        let mut state = inner.state.lock().await;
        for entry in state.running.values() {
            entry.token.cancel();
        }
        for executor in &state.executors {
            executor.destroy();
        }
        state.refresh_counts();
        drop(state);

        if let Some(handle) = inner.dispatcher.lock().take() {
            handle.abort();
        }
        tracing::debug!("📦 Queue {} destroyed", inner.id);
    }
}

impl Drop for InMemoryQueue {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            handle.abort();
        }
    }
}
