//! Retry handler.
//!
//! Listens for `queue:taskFailed`, keeps one [`RetryRecord`] per failing
//! task and decides whether to try again. Approved retries wait on a single
//! backoff timer per task, then go back out as `retry:taskStarted`; the
//! scheduler named in the task's metadata picks them up. Tasks that never
//! went through a scheduler are re-run on a short-lived executor owned by
//! the handler.
//!
//! A task with `max_retries = n` runs at most `n + 1` times. When retries are
//! over the handler publishes `retry:taskFinallyFailed` with the full error
//! history, which the dead letter queue consumes.
//!
//! # Examples
//!
//! ```rust
//! use launchq::config::RetryConfig;
//! use launchq::core::retry::base_delay;
//! use std::time::Duration;
//!
//! let config = RetryConfig::exponential(5).with_jitter(0.0);
//! assert_eq!(base_delay(&config, 1, None), Duration::from_millis(1_000));
//! assert_eq!(base_delay(&config, 3, None), Duration::from_millis(4_000));
//! ```

use crate::config::{BackoffStrategy, ExecutorConfig, RetryConfig};
use crate::core::dead_letter::DeadLetterReason;
use crate::core::executor::TaskExecutor;
use crate::error::{FailureKind, LaunchError, LaunchResult, TaskFailure};
use crate::events::{Event, EventBus, QueueEvent, RetryEvent, next_event};
use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const USER_ERROR_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "not found",
    "bad request",
    "validation",
    "invalid",
];

/// Custom retry predicate: `(failure, failures so far) -> retry?`.
pub type RetryPredicate = Arc<dyn Fn(&TaskFailure, u32) -> bool + Send + Sync>;

/// Custom delay function for [`BackoffStrategy::Custom`]:
/// `(attempt, base delay) -> delay`.
pub type DelayFn = Arc<dyn Fn(u32, Duration) -> Duration + Send + Sync>;

/// One failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub attempt: u32,
    pub error: TaskFailure,
    pub timestamp: DateTime<Utc>,
}

/// Retry bookkeeping for one task.
#[derive(Debug, Clone, Serialize)]
pub struct RetryRecord {
    pub task_id: TaskId,
    /// Failures so far
    pub attempts: u32,
    pub max_retries: u32,
    pub strategy: BackoffStrategy,
    pub started_at: DateTime<Utc>,
    pub error_history: Vec<ErrorRecord>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Retry statistics.
#[derive(Debug, Clone, Serialize)]
pub struct RetryStats {
    /// Retry timers armed
    pub total_retries: u64,
    /// Tasks that succeeded after at least one failure
    pub successful_retries: u64,
    /// Tasks handed to the dead letter queue
    pub final_failures: u64,
    /// Mean failures per finally failed task
    pub average_retries: f64,
    /// Finally failed tasks by number of failures
    pub distribution: BTreeMap<u32, u64>,
    pub last_updated: DateTime<Utc>,
}

impl Default for RetryStats {
    fn default() -> Self {
        Self {
            total_retries: 0,
            successful_retries: 0,
            final_failures: 0,
            average_retries: 0.0,
            distribution: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }
}

/// Whether a failure looks like a caller mistake that retrying cannot fix.
pub fn is_user_error(failure: &TaskFailure) -> bool {
    let message = failure.message.to_lowercase();
    USER_ERROR_PATTERNS.iter().any(|p| message.contains(p))
}

/// Backoff delay for `attempt` (1-based) before jitter, capped at the
/// configured maximum.
pub fn base_delay(config: &RetryConfig, attempt: u32, custom: Option<&DelayFn>) -> Duration {
    let base = config.base_delay_ms as f64;
    let attempt = attempt.max(1);
    let millis = match config.strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base * attempt as f64 * config.multiplier,
        BackoffStrategy::Exponential => base * config.multiplier.powi(attempt as i32 - 1),
        BackoffStrategy::Custom => match custom {
            Some(delay) => delay(attempt, Duration::from_millis(config.base_delay_ms)).as_millis() as f64,
            None => base,
        },
    };
    Duration::from_millis(millis.min(config.max_delay_ms as f64).max(0.0) as u64)
}

/// Shift a delay by a uniform random offset in `[-jitter, +jitter]` of itself.
pub fn with_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return delay;
    }
    let spread = delay.as_millis() as f64 * jitter;
    let offset = rand::rng().random_range(-1.0..=1.0) * spread;
    Duration::from_millis((delay.as_millis() as f64 + offset).max(0.0) as u64)
}

struct RecordEntry {
    record: RetryRecord,
    task: Task,
    config: RetryConfig,
    timer: Option<JoinHandle<()>>,
}

enum Verdict {
    Retry,
    GiveUp(DeadLetterReason),
}

struct RetryInner {
    id: String,
    bus: EventBus,
    executor_config: ExecutorConfig,
    config: RwLock<RetryConfig>,
    records: Mutex<HashMap<TaskId, RecordEntry>>,
    stats: Mutex<RetryStats>,
    should_retry: parking_lot::RwLock<Option<RetryPredicate>>,
    delay_fn: parking_lot::RwLock<Option<DelayFn>>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// Event-driven retry handler. Cloning shares the same handler.
#[derive(Clone)]
pub struct RetryHandler {
    inner: Arc<RetryInner>,
}

impl RetryHandler {
    /// Create a handler. Nothing is retried until [`start`](Self::start).
    pub fn new(
        id: impl Into<String>,
        config: RetryConfig,
        executor_config: ExecutorConfig,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                id: id.into(),
                bus,
                executor_config,
                config: RwLock::new(config),
                records: Mutex::new(HashMap::new()),
                stats: Mutex::new(RetryStats::default()),
                should_retry: parking_lot::RwLock::new(None),
                delay_fn: parking_lot::RwLock::new(None),
                listener: parking_lot::Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Subscribe to task outcomes.
    pub fn start(&self) -> LaunchResult<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return Err(LaunchError::AlreadyRunning);
        }
        let events = self.inner.bus.subscribe();
        *listener = Some(tokio::spawn(listen(Arc::downgrade(&self.inner), events)));
        tracing::info!("🔁 Retry handler {} listening", self.inner.id);
        Ok(())
    }

    /// Replace the default predicate. The retry limit still applies.
    pub fn set_should_retry(&self, predicate: impl Fn(&TaskFailure, u32) -> bool + Send + Sync + 'static) {
        *self.inner.should_retry.write() = Some(Arc::new(predicate));
    }

    /// Delay function used by [`BackoffStrategy::Custom`].
    pub fn set_delay_fn(&self, delay: impl Fn(u32, Duration) -> Duration + Send + Sync + 'static) {
        *self.inner.delay_fn.write() = Some(Arc::new(delay));
    }

    /// Arm a retry right away for a task that has a record, optionally with
    /// a modified configuration. Changing `max_retries` resets the attempt
    /// count. Returns whether a record existed.
    pub async fn manual_retry(
        &self,
        task_id: &str,
        overrides: impl FnOnce(&mut RetryConfig),
    ) -> bool {
        let mut records = self.inner.records.lock().await;
        let Some(entry) = records.get_mut(task_id) else {
            return false;
        };

        let previous_limit = entry.config.max_retries;
        overrides(&mut entry.config);
        if entry.config.max_retries != previous_limit {
            entry.record.attempts = 0;
            entry.record.max_retries = entry.config.max_retries;
        }
        entry.record.strategy = entry.config.strategy;
        self.inner.arm(entry).await;
        true
    }

    /// Drop a task's record and its pending timer.
    pub async fn cancel_retry(&self, task_id: &str) -> bool {
        let removed = self.inner.records.lock().await.remove(task_id);
        let Some(entry) = removed else {
            return false;
        };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        self.inner.bus.publish(Event::Retry(RetryEvent::TaskCancelled {
            task_id: task_id.to_string(),
        }));
        tracing::debug!("🔁 Retry for task {} cancelled", task_id);
        true
    }

    pub async fn retry_record(&self, task_id: &str) -> Option<RetryRecord> {
        self.inner
            .records
            .lock()
            .await
            .get(task_id)
            .map(|e| e.record.clone())
    }

    pub async fn records(&self) -> Vec<RetryRecord> {
        self.inner
            .records
            .lock()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect()
    }

    pub async fn stats(&self) -> RetryStats {
        self.inner.stats.lock().await.clone()
    }

    pub async fn reset_stats(&self) {
        *self.inner.stats.lock().await = RetryStats::default();
        self.inner.bus.publish(Event::Retry(RetryEvent::StatsReset));
    }

    pub async fn config(&self) -> RetryConfig {
        self.inner.config.read().await.clone()
    }

    /// Apply a partial configuration update. Existing records keep the
    /// configuration they were created with.
    pub async fn update_config(&self, update: impl FnOnce(&mut RetryConfig)) -> LaunchResult<()> {
        let mut next = self.config().await;
        update(&mut next);
        if !(0.0..=1.0).contains(&next.jitter) {
            return Err(LaunchError::config("Retry jitter must lie within [0, 1]"));
        }
        if next.max_delay_ms < next.base_delay_ms {
            return Err(LaunchError::config(
                "Retry max delay must be greater than or equal to base delay",
            ));
        }
        *self.inner.config.write().await = next;
        self.inner.bus.publish(Event::Retry(RetryEvent::ConfigUpdated));
        Ok(())
    }

    /// Stop listening and drop every record and timer.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
        for (_, entry) in self.inner.records.lock().await.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
        tracing::info!("🔁 Retry handler {} destroyed", self.inner.id);
    }
}

impl RetryInner {
    fn verdict(&self, entry: &RecordEntry, failure: &TaskFailure) -> Verdict {
        let attempts = entry.record.attempts;
        if !entry.config.enable_retry {
            return Verdict::GiveUp(if failure.is_timeout() {
                DeadLetterReason::Timeout
            } else {
                DeadLetterReason::SystemError
            });
        }
        if attempts > entry.record.max_retries {
            return Verdict::GiveUp(DeadLetterReason::MaxRetriesExceeded);
        }

        if let Some(predicate) = self.should_retry.read().clone() {
            return if predicate(failure, attempts) {
                Verdict::Retry
            } else {
                Verdict::GiveUp(DeadLetterReason::SystemError)
            };
        }

        if is_user_error(failure) {
            let message = failure.message.to_lowercase();
            if message.contains("validation") || message.contains("invalid") {
                Verdict::GiveUp(DeadLetterReason::ValidationFailed)
            } else {
                Verdict::GiveUp(DeadLetterReason::UserError)
            }
        } else {
            Verdict::Retry
        }
    }

    async fn handle_failure(self: &Arc<Self>, task: Task, failure: TaskFailure) {
        if failure.kind == FailureKind::Cancelled || self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let defaults = self.config.read().await.clone();
        let mut records = self.records.lock().await;

        let entry = records.entry(task.id.clone()).or_insert_with(|| {
            let max_retries = task.max_retries.unwrap_or(defaults.max_retries);
            RecordEntry {
                record: RetryRecord {
                    task_id: task.id.clone(),
                    attempts: 0,
                    max_retries,
                    strategy: defaults.strategy,
                    started_at: Utc::now(),
                    error_history: Vec::new(),
                    next_retry_at: None,
                },
                task: task.clone(),
                config: RetryConfig {
                    max_retries,
                    ..defaults.clone()
                },
                timer: None,
            }
        });

        entry.record.attempts += 1;
        entry.record.error_history.push(ErrorRecord {
            attempt: entry.record.attempts,
            error: failure.clone(),
            timestamp: Utc::now(),
        });
        entry.task = task;

        match self.verdict(entry, &failure) {
            Verdict::Retry => self.arm(entry).await,
            Verdict::GiveUp(reason) => {
                let task_id = entry.record.task_id.clone();
                if let Some(entry) = records.remove(&task_id) {
                    drop(records);
                    self.give_up(entry, reason, failure).await;
                }
            }
        }
    }

    async fn handle_success(&self, task_id: &str) {
        let removed = self.records.lock().await.remove(task_id);
        let Some(entry) = removed else { return };
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        if entry.record.attempts == 0 {
            return;
        }

        {
            let mut stats = self.stats.lock().await;
            stats.successful_retries += 1;
            stats.last_updated = Utc::now();
        }
        self.bus
            .publish(Event::Retry(RetryEvent::TaskSucceededAfterRetry {
                task_id: task_id.to_string(),
                attempts: entry.record.attempts + 1,
            }));
        tracing::info!(
            "🔁 Task {} succeeded after {} failed attempts",
            task_id,
            entry.record.attempts
        );
    }

    /// Arm (or re-arm) the retry timer of a record.
    async fn arm(self: &Arc<Self>, entry: &mut RecordEntry) {
        let attempt = entry.record.attempts;
        let custom = self.delay_fn.read().clone();
        let delay = with_jitter(
            base_delay(&entry.config, attempt, custom.as_ref()),
            entry.config.jitter,
        );

        entry.record.next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        if let Some(previous) = entry.timer.take() {
            previous.abort();
        }

        let task_id = entry.record.task_id.clone();
        let weak = Arc::downgrade(self);
        let timer_task = task_id.clone();
        entry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(&timer_task).await;
            }
        }));

        {
            let mut stats = self.stats.lock().await;
            stats.total_retries += 1;
            stats.last_updated = Utc::now();
        }
        self.bus.publish(Event::Retry(RetryEvent::TaskScheduled {
            task_id: task_id.clone(),
            attempt,
            delay,
        }));
        tracing::debug!(
            "🔁 Task {} retry {} in {:?} ({:?})",
            task_id,
            attempt,
            delay,
            entry.config.strategy
        );
    }

    async fn fire(&self, task_id: &str) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let retry = {
            let mut records = self.records.lock().await;
            let Some(entry) = records.get_mut(task_id) else {
                return;
            };
            entry.timer = None;
            entry.record.next_retry_at = None;
            entry.task.for_retry(entry.record.attempts)
        };

        let attempt = retry.attempt() - 1;
        let standalone = retry.scheduler_id().is_none();
        self.bus.publish(Event::Retry(RetryEvent::TaskStarted {
            task: retry.clone(),
            attempt,
        }));

        if standalone {
            let executor = TaskExecutor::new(
                format!("{}#retry", self.id),
                self.id.clone(),
                self.executor_config.clone(),
                self.bus.clone(),
            );
            if let Err(e) = executor.execute(retry, CancellationToken::new()).await {
                tracing::warn!("🔁 Retry of task {} could not run: {}", task_id, e);
            }
        }
    }

    async fn give_up(&self, entry: RecordEntry, reason: DeadLetterReason, final_error: TaskFailure) {
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        let attempts = entry.record.attempts;

        {
            let mut stats = self.stats.lock().await;
            stats.final_failures += 1;
            *stats.distribution.entry(attempts).or_insert(0) += 1;
            let (weighted, count) = stats
                .distribution
                .iter()
                .fold((0u64, 0u64), |(w, c), (attempts, n)| (w + *attempts as u64 * n, c + n));
            stats.average_retries = if count > 0 {
                weighted as f64 / count as f64
            } else {
                0.0
            };
            stats.last_updated = Utc::now();
        }

        tracing::error!(
            "🔁 Task {} finally failed after {} attempts ({}): {}",
            entry.record.task_id,
            attempts,
            reason.as_str(),
            final_error
        );
        self.bus.publish(Event::Retry(RetryEvent::TaskFinallyFailed {
            task: entry.task,
            reason,
            error_history: entry.record.error_history,
            final_error,
            total_attempts: attempts,
        }));
    }
}

async fn listen(inner: Weak<RetryInner>, mut events: tokio::sync::broadcast::Receiver<Event>) {
    while let Some(event) = next_event(&mut events).await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            Event::Queue(QueueEvent::TaskFailed { task, failure, .. }) => {
                inner.handle_failure(task, failure).await
            }
            Event::Queue(QueueEvent::TaskCompleted { task_id, .. }) => {
                inner.handle_success(&task_id).await
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    fn handler(config: RetryConfig, bus: &EventBus) -> RetryHandler {
        let handler = RetryHandler::new("r", config, ExecutorConfig::default(), bus.clone());
        handler.start().unwrap();
        handler
    }

    fn failing(message: &'static str, runs: Arc<AtomicU32>) -> Task {
        Task::from_fn(move |_| {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err(LaunchError::failure(message))
            }
        })
    }

    async fn run_once(bus: &EventBus, task: Task) {
        let executor = TaskExecutor::new("e", "q", ExecutorConfig::default(), bus.clone());
        executor.execute(task, CancellationToken::new()).await.unwrap();
    }

    fn finally_failed(bus: &EventBus) -> Vec<Event> {
        bus.history(&EventFilter::name("retry:taskFinallyFailed"), None)
            .into_iter()
            .map(|r| r.event)
            .collect()
    }

    #[test]
    fn test_base_delay_strategies() {
        let mut config = RetryConfig::exponential(5).with_jitter(0.0);
        let delays: Vec<_> = (1..=5).map(|a| base_delay(&config, a, None).as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 16_000]);
        assert_eq!(base_delay(&config, 6, None), Duration::from_millis(30_000));

        config.strategy = BackoffStrategy::Linear;
        assert_eq!(base_delay(&config, 3, None), Duration::from_millis(6_000));

        config.strategy = BackoffStrategy::Fixed;
        assert_eq!(base_delay(&config, 4, None), Duration::from_millis(1_000));

        config.strategy = BackoffStrategy::Custom;
        let custom: DelayFn = Arc::new(|attempt, base| base / 10 * attempt);
        assert_eq!(base_delay(&config, 3, Some(&custom)), Duration::from_millis(300));
        assert_eq!(base_delay(&config, 3, None), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        for _ in 0..200 {
            let delay = with_jitter(Duration::from_millis(1_000), 0.1).as_millis();
            assert!((900..=1_100).contains(&delay));
        }
        assert_eq!(
            with_jitter(Duration::from_millis(1_000), 0.0),
            Duration::from_millis(1_000)
        );
    }

    #[test]
    fn test_user_error_patterns() {
        assert!(is_user_error(&TaskFailure::execution("401 Unauthorized")));
        assert!(is_user_error(&TaskFailure::execution("Resource not found")));
        assert!(is_user_error(&TaskFailure::execution("invalid payload")));
        assert!(!is_user_error(&TaskFailure::execution("ECONNRESET")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_limit_then_gives_up() {
        let bus = EventBus::new();
        let handler = handler(RetryConfig::fixed(3, 100), &bus);
        let runs = Arc::new(AtomicU32::new(0));

        run_once(&bus, failing("ECONNRESET", Arc::clone(&runs)).with_max_retries(2)).await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        let events = finally_failed(&bus);
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Retry(RetryEvent::TaskFinallyFailed {
                reason,
                error_history,
                total_attempts,
                ..
            }) => {
                assert_eq!(*reason, DeadLetterReason::MaxRetriesExceeded);
                assert_eq!(*total_attempts, 3);
                assert_eq!(error_history.len(), 3);
                assert_eq!(
                    error_history.iter().map(|e| e.attempt).collect::<Vec<_>>(),
                    vec![1, 2, 3]
                );
            }
            other => panic!("unexpected event {:?}", other),
        }

        let stats = handler.stats().await;
        assert_eq!(stats.total_retries, 2);
        assert_eq!(stats.final_failures, 1);
        assert_eq!(stats.distribution.get(&3), Some(&1));
        assert_eq!(stats.average_retries, 3.0);
        assert!(handler.records().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_error_is_not_retried() {
        let bus = EventBus::new();
        let handler = handler(RetryConfig::fixed(3, 100), &bus);
        let runs = Arc::new(AtomicU32::new(0));

        run_once(&bus, failing("401 unauthorized", Arc::clone(&runs))).await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stats().await.total_retries, 0);
        assert!(matches!(
            finally_failed(&bus).first(),
            Some(Event::Retry(RetryEvent::TaskFinallyFailed {
                reason: DeadLetterReason::UserError,
                ..
            }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retry_is_recorded() {
        let bus = EventBus::new();
        let handler = handler(RetryConfig::fixed(3, 50), &bus);
        let runs = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&runs);
        let task = Task::from_fn(move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LaunchError::failure("flaky upstream"))
                } else {
                    Ok(Value::Null)
                }
            }
        });

        run_once(&bus, task).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let stats = handler.stats().await;
        assert_eq!(stats.successful_retries, 1);
        assert_eq!(stats.final_failures, 0);
        assert_eq!(
            bus.history(&EventFilter::name("retry:taskSucceededAfterRetry"), None)
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate() {
        let bus = EventBus::new();
        let handler = handler(RetryConfig::fixed(5, 10), &bus);
        handler.set_should_retry(|_, attempts| attempts < 2);
        let runs = Arc::new(AtomicU32::new(0));

        run_once(&bus, failing("boom", Arc::clone(&runs))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_retry_forwards_immediately() {
        let bus = EventBus::new();
        let _handler = handler(RetryConfig::none(), &bus);
        let runs = Arc::new(AtomicU32::new(0));

        run_once(&bus, failing("request timeout", Arc::clone(&runs))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(matches!(
            finally_failed(&bus).first(),
            Some(Event::Retry(RetryEvent::TaskFinallyFailed {
                reason: DeadLetterReason::Timeout,
                ..
            }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_and_manual_retry() {
        let bus = EventBus::new();
        let handler = handler(RetryConfig::fixed(3, 60_000), &bus);
        let runs = Arc::new(AtomicU32::new(0));
        let task = failing("ECONNRESET", Arc::clone(&runs)).with_id("t1");

        run_once(&bus, task).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let record = handler.retry_record("t1").await.unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.next_retry_at.is_some());

        assert!(
            handler
                .manual_retry("t1", |c| {
                    c.base_delay_ms = 10;
                    c.max_delay_ms = 10;
                })
                .await
        );
        // the retried run fails again and re-arms with the 10ms override
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        assert!(handler.cancel_retry("t1").await);
        assert!(!handler.cancel_retry("t1").await);
        tokio::time::sleep(Duration::from_millis(120_000)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!handler.manual_retry("missing", |_| {}).await);
    }

    #[tokio::test]
    async fn test_update_config_validates() {
        let bus = EventBus::new();
        let handler = RetryHandler::new("r", RetryConfig::default(), ExecutorConfig::default(), bus.clone());
        assert!(handler.update_config(|c| c.jitter = 2.0).await.is_err());
        handler.update_config(|c| c.max_retries = 7).await.unwrap();
        assert_eq!(handler.config().await.max_retries, 7);
        assert_eq!(bus.history(&EventFilter::name("retry:configUpdated"), None).len(), 1);
    }

    #[tokio::test]
    async fn test_reset_stats_and_destroy() {
        let bus = EventBus::new();
        let handler = handler(RetryConfig::default(), &bus);
        handler.reset_stats().await;
        assert_eq!(handler.stats().await.total_retries, 0);
        handler.destroy().await;
        assert!(matches!(handler.start(), Err(LaunchError::Destroyed)));
    }
}
