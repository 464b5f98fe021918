//! Task executor.
//!
//! An executor runs exactly one task at a time. The task's operation is
//! spawned onto the runtime and raced against a deadline taken from the task
//! (or the executor default); a panic inside the operation is caught through
//! the join handle and reported as an execution failure.

use crate::config::ExecutorConfig;
use crate::error::{FailureKind, LaunchError, LaunchResult, TaskFailure};
use crate::events::{Event, EventBus, QueueEvent};
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;

const DURATION_WINDOW: usize = 100;

/// Result of running one task.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// The task in its terminal state
    pub task: Task,
    /// Operation result or failure
    pub result: Result<Value, TaskFailure>,
    /// Wall time spent in the executor
    pub duration: Duration,
}

impl ExecutionOutcome {
    /// Whether the task completed successfully.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Whether the task ended cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(&self.result, Err(f) if f.kind == FailureKind::Cancelled)
    }
}

/// Result of [`TaskExecutor::execute_batch`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Outcomes of tasks that completed
    pub succeeded: Vec<ExecutionOutcome>,
    /// Outcomes of tasks that failed, timed out or were cancelled
    pub failed: Vec<ExecutionOutcome>,
}

/// Execution statistics of one executor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutorStats {
    /// Executions attempted, cancelled ones included
    pub total_executions: u64,
    /// Executions that completed
    pub successful: u64,
    /// Executions that failed, timeouts included
    pub failed: u64,
    /// Executions that hit the deadline
    pub timeouts: u64,
    /// Executions that ended cancelled
    pub cancelled: u64,
    /// Rolling average over the last 100 executions
    pub average_execution_time: Duration,
    /// Payload bytes of the task currently running
    pub current_memory_bytes: u64,
    /// Largest payload seen
    pub peak_memory_bytes: u64,
    /// When the last execution finished
    pub last_execution_at: Option<DateTime<Utc>>,
}

impl ExecutorStats {
    /// Failed executions over all executions.
    pub fn failure_rate(&self) -> f64 {
        if self.total_executions == 0 {
            0.0
        } else {
            self.failed as f64 / self.total_executions as f64
        }
    }
}

#[derive(Default)]
struct ExecutorState {
    stats: ExecutorStats,
    recent: VecDeque<Duration>,
}

impl ExecutorState {
    fn record(&mut self, result: &Result<Value, TaskFailure>, duration: Duration) {
        let stats = &mut self.stats;
        stats.total_executions += 1;
        match result {
            Ok(_) => stats.successful += 1,
            Err(f) if f.kind == FailureKind::Cancelled => stats.cancelled += 1,
            Err(f) => {
                stats.failed += 1;
                if f.kind == FailureKind::Timeout {
                    stats.timeouts += 1;
                }
            }
        }
        stats.last_execution_at = Some(Utc::now());

        if self.recent.len() == DURATION_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(duration);
        let total: Duration = self.recent.iter().sum();
        stats.average_execution_time = total / self.recent.len() as u32;
    }
}

/// Runs one task at a time under a timeout guard.
pub struct TaskExecutor {
    id: String,
    source: String,
    config: RwLock<ExecutorConfig>,
    bus: EventBus,
    run_lock: Arc<Mutex<()>>,
    state: Mutex<ExecutorState>,
    destroyed: AtomicBool,
}

/// Exclusive claim on an idle executor.
pub struct ExecutorSlot {
    executor: Arc<TaskExecutor>,
    _guard: OwnedMutexGuard<()>,
}

impl ExecutorSlot {
    /// The claimed executor.
    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    /// Run a task on the claimed executor, releasing the claim afterwards.
    pub async fn execute(
        self,
        task: Task,
        cancel: CancellationToken,
    ) -> LaunchResult<ExecutionOutcome> {
        self.executor.run(task, cancel).await
    }
}

impl TaskExecutor {
    /// Create an executor. `source` names the queue or pool it belongs to in
    /// published events.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        config: ExecutorConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            config: RwLock::new(config),
            bus,
            run_lock: Arc::new(Mutex::new(())),
            state: Mutex::new(ExecutorState::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Executor identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Event source name.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Whether a task is currently running.
    pub fn is_busy(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Claim the executor if it is idle.
    pub fn try_claim(self: &Arc<Self>) -> Option<ExecutorSlot> {
        let guard = Arc::clone(&self.run_lock).try_lock_owned().ok()?;
        Some(ExecutorSlot {
            executor: Arc::clone(self),
            _guard: guard,
        })
    }

    /// Run a task, waiting for any execution in progress to finish first.
    ///
    /// Task-level failures are reported in the outcome; `Err` is only
    /// returned for executor problems such as use after destroy.
    pub async fn execute(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> LaunchResult<ExecutionOutcome> {
        let _guard = self.run_lock.lock().await;
        self.run(task, cancel).await
    }

    async fn run(&self, mut task: Task, cancel: CancellationToken) -> LaunchResult<ExecutionOutcome> {
        if self.is_destroyed() {
            return Err(LaunchError::Destroyed);
        }

        let started = Instant::now();

        if cancel.is_cancelled() {
            tracing::debug!("⚙️ Executor {} skipping cancelled task {}", self.id, task.id);
            task.mark_cancelled()?;
            let failure = TaskFailure::cancelled(&task.id);
            let result = Err(failure);
            self.state.lock().await.record(&result, Duration::ZERO);
            self.bus.publish(Event::Queue(QueueEvent::TaskCancelled {
                source: self.source.clone(),
                task_id: task.id.clone(),
                was_started: false,
            }));
            return Ok(ExecutionOutcome {
                task,
                result,
                duration: Duration::ZERO,
            });
        }

        let config = self.config.read().await.clone();
        let deadline = task.timeout.unwrap_or_else(|| config.default_timeout());
        let memory = if config.enable_resource_monitoring {
            task.memory_estimate()
        } else {
            0
        };

        task.mark_running()?;
        {
            let mut state = self.state.lock().await;
            state.stats.current_memory_bytes = memory;
            state.stats.peak_memory_bytes = state.stats.peak_memory_bytes.max(memory);
        }
        self.bus.publish(Event::Queue(QueueEvent::TaskStarted {
            source: self.source.clone(),
            task_id: task.id.clone(),
        }));
        tracing::debug!(
            "⚙️ Executor {} running task {} (priority {}, timeout {:?})",
            self.id,
            task.id,
            task.priority,
            deadline
        );

        let operation = task.operation();
        let ctx = task.context(cancel.clone());
        let mut handle = tokio::spawn(async move { operation.run(ctx).await });

        let result = match timeout(deadline, &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(error))) => Err(TaskFailure::from(&error)),
            Ok(Err(join_error)) => Err(TaskFailure::execution(format!(
                "Task panicked: {}",
                join_error
            ))),
            Err(_) => {
                handle.abort();
                Err(TaskFailure::timeout(deadline.as_millis() as u64))
            }
        };
        let result = match result {
            Err(_) if cancel.is_cancelled() => Err(TaskFailure::cancelled(&task.id)),
            other => other,
        };
        let duration = started.elapsed();

        {
            let mut state = self.state.lock().await;
            state.stats.current_memory_bytes = 0;
            state.record(&result, duration);
        }

        match &result {
            Ok(value) => {
                task.mark_completed(value.clone())?;
                task.notify_success(value);
                tracing::debug!(
                    "⚙️ Executor {} completed task {} in {:?}",
                    self.id,
                    task.id,
                    duration
                );
                self.bus.publish(Event::Queue(QueueEvent::TaskCompleted {
                    source: self.source.clone(),
                    task_id: task.id.clone(),
                    result: value.clone(),
                    duration,
                }));
            }
            Err(failure) if failure.kind == FailureKind::Cancelled => {
                task.mark_cancelled()?;
                task.notify_error(failure);
                tracing::debug!("⚙️ Executor {} task {} cancelled", self.id, task.id);
                self.bus.publish(Event::Queue(QueueEvent::TaskCancelled {
                    source: self.source.clone(),
                    task_id: task.id.clone(),
                    was_started: true,
                }));
            }
            Err(failure) => {
                task.mark_failed(failure.clone())?;
                task.notify_error(failure);
                tracing::warn!(
                    "⚙️ Executor {} task {} failed after {:?}: {}",
                    self.id,
                    task.id,
                    duration,
                    failure
                );
                self.bus.publish(Event::Queue(QueueEvent::TaskFailed {
                    source: self.source.clone(),
                    task: task.clone(),
                    failure: failure.clone(),
                    duration,
                }));
            }
        }

        Ok(ExecutionOutcome {
            task,
            result,
            duration,
        })
    }

    /// Run tasks one after another, splitting outcomes by success.
    pub async fn execute_batch(
        &self,
        tasks: Vec<Task>,
        cancel: CancellationToken,
    ) -> LaunchResult<BatchOutcome> {
        let mut batch = BatchOutcome::default();
        for task in tasks {
            let outcome = self.execute(task, cancel.child_token()).await?;
            if outcome.is_success() {
                batch.succeeded.push(outcome);
            } else {
                batch.failed.push(outcome);
            }
        }
        Ok(batch)
    }

    /// Snapshot of the statistics.
    pub async fn stats(&self) -> ExecutorStats {
        self.state.lock().await.stats.clone()
    }

    /// Zero the statistics.
    pub async fn reset_stats(&self) {
        *self.state.lock().await = ExecutorState::default();
    }

    /// Unhealthy when more than half of at least ten executions failed, or
    /// the memory ceiling is exceeded.
    pub async fn is_healthy(&self) -> bool {
        let stats = self.stats().await;
        if stats.total_executions >= 10 && stats.failure_rate() > 0.5 {
            return false;
        }
        match self.config.read().await.max_memory_bytes {
            Some(ceiling) => stats.current_memory_bytes <= ceiling,
            None => true,
        }
    }

    /// Apply a partial configuration update.
    pub async fn update_config(&self, update: impl FnOnce(&mut ExecutorConfig)) -> LaunchResult<()> {
        let mut config = self.config.write().await;
        let mut next = config.clone();
        update(&mut next);
        if next.default_timeout_ms == 0 {
            return Err(LaunchError::config(
                "Executor default timeout must be greater than 0",
            ));
        }
        *config = next;
        Ok(())
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Refuse further executions.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventFilter, Topic};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn executor(bus: &EventBus) -> Arc<TaskExecutor> {
        Arc::new(TaskExecutor::new(
            "exec-1",
            "test",
            ExecutorConfig::default().with_default_timeout(100),
            bus.clone(),
        ))
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let task = Task::from_fn(|_| async { Ok(json!("done")) }).on_success(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let outcome = exec.execute(task, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.result, Ok(json!("done")));
        assert_eq!(outcome.task.state(), crate::task::TaskState::Completed);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let names: Vec<_> = bus
            .history(&EventFilter::Topic(Topic::Queue), None)
            .iter()
            .map(|r| r.event.name())
            .collect();
        assert_eq!(names, vec!["queue:taskCompleted", "queue:taskStarted"]);

        let stats = exec.stats().await;
        assert_eq!(stats.total_executions, 1);
        assert_eq!(stats.successful, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_distinct_failure() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let task = Task::from_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });

        let outcome = exec.execute(task, CancellationToken::new()).await.unwrap();
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert_eq!(failure.message, "Task timed out after 100ms");

        let stats = exec.stats().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.timeouts, 1);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let task = Task::from_fn(|_| async {
            if true {
                panic!("kaboom");
            }
            Ok(Value::Null)
        });

        let outcome = exec.execute(task, CancellationToken::new()).await.unwrap();
        let failure = outcome.result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.message.contains("panicked"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_never_runs() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task = Task::from_fn(move |_| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        let token = CancellationToken::new();
        token.cancel();
        let outcome = exec.execute(task, token).await.unwrap();
        assert!(outcome.is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(exec.stats().await.cancelled, 1);
    }

    #[tokio::test]
    async fn test_cooperative_cancellation_while_running() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let task = Task::from_fn(|ctx| async move {
            ctx.cancelled().await;
            Err(LaunchError::failure("aborted"))
        })
        .with_timeout(Duration::from_secs(5));

        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = exec.execute(task, token).await.unwrap();
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.task.state(), crate::task::TaskState::Cancelled);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let slot = exec.try_claim().unwrap();
        assert!(exec.is_busy());
        assert!(exec.try_claim().is_none());
        drop(slot);
        assert!(!exec.is_busy());
    }

    #[tokio::test]
    async fn test_unhealthy_after_mostly_failures() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        let tasks = (0..10)
            .map(|i| {
                Task::from_fn(move |_| async move {
                    if i < 6 {
                        Err(LaunchError::failure("boom"))
                    } else {
                        Ok(Value::Null)
                    }
                })
            })
            .collect();

        let batch = exec
            .execute_batch(tasks, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(batch.failed.len(), 6);
        assert_eq!(batch.succeeded.len(), 4);
        assert!(!exec.is_healthy().await);

        exec.reset_stats().await;
        assert!(exec.is_healthy().await);
    }

    #[tokio::test]
    async fn test_destroyed_executor_refuses_work() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        exec.destroy();
        let task = Task::from_fn(|_| async { Ok(Value::Null) });
        let result = exec.execute(task, CancellationToken::new()).await;
        assert!(matches!(result, Err(LaunchError::Destroyed)));
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let bus = EventBus::new();
        let exec = executor(&bus);
        assert!(exec.update_config(|c| c.default_timeout_ms = 0).await.is_err());
        assert!(exec.update_config(|c| c.default_timeout_ms = 50).await.is_ok());
    }
}
