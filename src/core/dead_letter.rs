//! Dead letter queue.
//!
//! Terminal holding area for tasks the retry handler gave up on. Every entry
//! keeps the task snapshot, the full error history and a category derived
//! from the failure reason and message text:
//!
//! | category    | when                                                          |
//! |-------------|---------------------------------------------------------------|
//! | `permanent` | reason `user_error`/`validation_failed`, or client-error text |
//! | `temporary` | reason `timeout`/`resource_exhausted`, or transient error text |
//! | `unknown`   | anything else                                                 |
//!
//! Permanent entries, and entries dead-lettered for user errors, validation
//! failures or manual termination, cannot be reprocessed. Reprocessing puts
//! the task back into the pipeline as `deadLetter:taskReprocessed`; the
//! scheduler named in its metadata resubmits it. When a reprocessed task
//! later completes the entry is removed and `deadLetter:taskRecovered` is
//! published.
//!
//! The queue is the only durable component: after every change the entry
//! list is saved through a [`DeadLetterStore`] and it is reloaded by
//! [`DeadLetterQueue::start`]. Tasks loaded from a store carry no code and
//! are rebuilt through the [`OperationRegistry`] by task type.

use crate::config::{DeadLetterConfig, ExecutorConfig};
use crate::core::executor::TaskExecutor;
use crate::core::registry::OperationRegistry;
use crate::core::retry::ErrorRecord;
use crate::error::{FailureKind, LaunchError, LaunchResult, TaskFailure};
use crate::events::{DeadLetterEvent, Event, EventBus, QueueEvent, RetryEvent, next_event};
use crate::store::DeadLetterStore;
use crate::task::{Task, TaskId, TaskSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

const TEMPORARY_PATTERNS: &[&str] = &[
    "timeout",
    "network",
    "connection",
    "econn",
    "rate limit",
    "service unavailable",
    "internal server error",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "not found",
    "unauthorized",
    "forbidden",
    "bad request",
    "validation",
    "invalid",
];

/// Why a task was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    Timeout,
    SystemError,
    UserError,
    ResourceExhausted,
    ValidationFailed,
    DependencyFailed,
    ManualTermination,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::Timeout => "timeout",
            Self::SystemError => "system_error",
            Self::UserError => "user_error",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ValidationFailed => "validation_failed",
            Self::DependencyFailed => "dependency_failed",
            Self::ManualTermination => "manual_termination",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a dead-lettered failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Likely to succeed if tried again later
    Temporary,
    /// Will fail again without a change to the task
    Permanent,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a failure from its dead letter reason and message.
pub fn categorize(reason: DeadLetterReason, error: &TaskFailure) -> ErrorCategory {
    match reason {
        DeadLetterReason::UserError | DeadLetterReason::ValidationFailed => {
            return ErrorCategory::Permanent;
        }
        DeadLetterReason::Timeout | DeadLetterReason::ResourceExhausted => {
            return ErrorCategory::Temporary;
        }
        _ => {}
    }
    if error.kind == FailureKind::Timeout {
        return ErrorCategory::Temporary;
    }

    let message = error.message.to_lowercase();
    if TEMPORARY_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorCategory::Temporary
    } else if PERMANENT_PATTERNS.iter().any(|p| message.contains(p)) {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Unknown
    }
}

/// Whether an entry with this reason and category may be reprocessed.
pub fn is_reprocessable(reason: DeadLetterReason, category: ErrorCategory) -> bool {
    category != ErrorCategory::Permanent
        && !matches!(
            reason,
            DeadLetterReason::UserError
                | DeadLetterReason::ValidationFailed
                | DeadLetterReason::ManualTermination
        )
}

/// One dead-lettered task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub task: TaskSnapshot,
    pub reason: DeadLetterReason,
    pub error_history: Vec<ErrorRecord>,
    pub final_error: TaskFailure,
    pub added_at: DateTime<Utc>,
    pub category: ErrorCategory,
    pub can_reprocess: bool,
    pub reprocess_count: u32,
    pub last_reprocess_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

/// Selection used by [`DeadLetterQueue::filter_tasks`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub reason: Option<DeadLetterReason>,
    pub category: Option<ErrorCategory>,
    pub can_reprocess: Option<bool>,
    pub task_type: Option<String>,
    /// Only entries added at or after this time
    pub since: Option<DateTime<Utc>>,
}

impl DeadLetterFilter {
    fn matches(&self, entry: &DeadLetterEntry) -> bool {
        self.reason.is_none_or(|r| r == entry.reason)
            && self.category.is_none_or(|c| c == entry.category)
            && self.can_reprocess.is_none_or(|c| c == entry.can_reprocess)
            && self
                .task_type
                .as_deref()
                .is_none_or(|t| t == entry.task.task_type)
            && self.since.is_none_or(|s| entry.added_at >= s)
    }
}

/// Dead letter statistics.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterStats {
    pub total_tasks: usize,
    pub by_reason: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub reprocessable: usize,
    /// Reprocess submissions since start
    pub reprocess_attempts: u64,
    /// Reprocessed tasks that later completed
    pub reprocess_successes: u64,
    pub reprocess_success_rate: f64,
    /// Mean time current entries have spent in the queue
    pub average_queue_time: Duration,
    pub oldest_entry: Option<DateTime<Utc>>,
    pub newest_entry: Option<DateTime<Utc>>,
}

/// Error type frequency in an [`ErrorAnalysis`].
#[derive(Debug, Clone, Serialize)]
pub struct ErrorFrequency {
    pub error_type: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryTrend {
    pub category: ErrorCategory,
    pub count: usize,
    pub trend: Trend,
}

/// Result of the periodic error pattern analysis.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorAnalysis {
    pub generated_at: DateTime<Utc>,
    pub total_entries: usize,
    /// Five most frequent error types, most frequent first
    pub common_errors: Vec<ErrorFrequency>,
    pub trends: Vec<CategoryTrend>,
    pub recommendations: Vec<String>,
}

struct Slot {
    entry: DeadLetterEntry,
    /// Runnable task when it arrived in this process
    task: Option<Task>,
}

#[derive(Default)]
struct Counters {
    reprocess_attempts: u64,
    reprocess_successes: u64,
}

struct DeadLetterInner {
    id: String,
    bus: EventBus,
    registry: OperationRegistry,
    store: Arc<dyn DeadLetterStore>,
    executor: Arc<TaskExecutor>,
    config: parking_lot::RwLock<DeadLetterConfig>,
    slots: Mutex<HashMap<TaskId, Slot>>,
    counters: Mutex<Counters>,
    persist_lock: Mutex<()>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    destroyed: AtomicBool,
}

/// Durable dead letter queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct DeadLetterQueue {
    inner: Arc<DeadLetterInner>,
}

impl DeadLetterQueue {
    /// Create a queue persisting under namespace `id`. Nothing is loaded or
    /// collected until [`start`](Self::start).
    pub fn new(
        id: impl Into<String>,
        config: DeadLetterConfig,
        executor_config: ExecutorConfig,
        store: Arc<dyn DeadLetterStore>,
        registry: OperationRegistry,
        bus: EventBus,
    ) -> Self {
        let id = id.into();
        let executor = Arc::new(TaskExecutor::new(
            format!("{}#reprocess", id),
            id.clone(),
            executor_config,
            bus.clone(),
        ));
        Self {
            inner: Arc::new(DeadLetterInner {
                id,
                bus,
                registry,
                store,
                executor,
                config: parking_lot::RwLock::new(config),
                slots: Mutex::new(HashMap::new()),
                counters: Mutex::new(Counters::default()),
                persist_lock: Mutex::new(()),
                handles: parking_lot::Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Load persisted entries, subscribe to final failures and completions,
    /// and arm the expiry and analysis timers.
    pub async fn start(&self) -> LaunchResult<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(LaunchError::AlreadyRunning);
        }

        let config = self.config();
        if config.enable_persistence {
            let loaded = match self.inner.store.load(&self.inner.id).await {
                Ok(loaded) => loaded,
                Err(e) => {
                    self.inner.running.store(false, Ordering::Release);
                    return Err(e);
                }
            };
            let mut slots = self.inner.slots.lock().await;
            for entry in loaded {
                slots
                    .entry(entry.task.id.clone())
                    .or_insert(Slot { entry, task: None });
            }
            tracing::info!(
                "🪦 Dead letter queue {} loaded {} entries from {} store",
                self.inner.id,
                slots.len(),
                self.inner.store.name()
            );
        }

        let events = self.inner.bus.subscribe();
        self.inner
            .handles
            .lock()
            .push(tokio::spawn(listen(Arc::downgrade(&self.inner), events)));
        self.inner.spawn_timers(&config);
        tracing::info!("🪦 Dead letter queue {} started", self.inner.id);
        Ok(())
    }

    pub fn config(&self) -> DeadLetterConfig {
        self.inner.config.read().clone()
    }

    /// Add a task. An entry for the same task id is replaced but keeps its
    /// reprocess count.
    pub async fn add_task(
        &self,
        task: Task,
        reason: DeadLetterReason,
        error_history: Vec<ErrorRecord>,
        final_error: TaskFailure,
    ) -> LaunchResult<DeadLetterEntry> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        Ok(self
            .inner
            .add(task, reason, error_history, final_error)
            .await)
    }

    pub async fn get_task(&self, task_id: &str) -> Option<DeadLetterEntry> {
        self.inner
            .slots
            .lock()
            .await
            .get(task_id)
            .map(|s| s.entry.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Entries matching `filter`, newest first.
    pub async fn filter_tasks(&self, filter: &DeadLetterFilter) -> Vec<DeadLetterEntry> {
        let mut entries: Vec<DeadLetterEntry> = self
            .inner
            .slots
            .lock()
            .await
            .values()
            .filter(|s| filter.matches(&s.entry))
            .map(|s| s.entry.clone())
            .collect();
        entries.sort_by(|a, b| b.added_at.cmp(&a.added_at));
        entries
    }

    /// Send a task back into the pipeline.
    ///
    /// Returns `Ok(false)` when the entry is not reprocessable and
    /// [`LaunchError::TaskNotFound`] when there is no entry. A task that
    /// cannot be rebuilt from its snapshot publishes
    /// `deadLetter:reprocessFailed` and returns the error.
    pub async fn reprocess(&self, task_id: &str) -> LaunchResult<bool> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        self.inner.reprocess(task_id).await
    }

    /// Reprocess every reprocessable entry of one category. Returns
    /// `(succeeded, failed)`.
    pub async fn reprocess_by_category(&self, category: ErrorCategory) -> LaunchResult<(usize, usize)> {
        let ids: Vec<TaskId> = self
            .filter_tasks(&DeadLetterFilter {
                category: Some(category),
                can_reprocess: Some(true),
                ..Default::default()
            })
            .await
            .into_iter()
            .map(|e| e.task.id)
            .collect();

        let (mut succeeded, mut failed) = (0, 0);
        for id in ids {
            match self.reprocess(&id).await {
                Ok(true) => succeeded += 1,
                Ok(false) | Err(_) => failed += 1,
            }
        }
        self.inner
            .bus
            .publish(Event::DeadLetter(DeadLetterEvent::BatchReprocessed {
                category,
                succeeded,
                failed,
            }));
        tracing::info!(
            "🪦 Batch reprocess of {} entries: {} submitted, {} failed",
            category,
            succeeded,
            failed
        );
        Ok((succeeded, failed))
    }

    /// Remove entries older than the retention age. Returns their ids.
    pub async fn purge_expired(&self) -> Vec<TaskId> {
        self.inner.purge_expired().await
    }

    /// Run the error pattern analysis now and publish the result.
    pub async fn analyze(&self) -> Arc<ErrorAnalysis> {
        self.inner.analyze().await
    }

    pub async fn stats(&self) -> DeadLetterStats {
        self.inner.stats().await
    }

    /// Drop every entry. Returns how many were removed.
    pub async fn clear(&self) -> usize {
        let count = {
            let mut slots = self.inner.slots.lock().await;
            let count = slots.len();
            slots.clear();
            count
        };
        self.inner.persist().await;
        self.inner
            .bus
            .publish(Event::DeadLetter(DeadLetterEvent::QueueCleared { count }));
        tracing::info!("🪦 Dead letter queue {} cleared ({} entries)", self.inner.id, count);
        count
    }

    /// Apply a partial configuration update. A smaller capacity evicts the
    /// oldest surplus entries; new intervals take effect immediately.
    pub async fn update_config(&self, update: impl FnOnce(&mut DeadLetterConfig)) -> LaunchResult<()> {
        let mut next = self.config();
        update(&mut next);
        if next.max_queue_size == 0 {
            return Err(LaunchError::config("Dead letter capacity must be greater than 0"));
        }
        if next.retention_ms == 0 || next.cleanup_interval_ms == 0 || next.analysis_interval_ms == 0 {
            return Err(LaunchError::config(
                "Dead letter retention and intervals must be greater than 0",
            ));
        }
        *self.inner.config.write() = next.clone();

        let evicted = {
            let mut slots = self.inner.slots.lock().await;
            evict_oldest(&mut slots, next.max_queue_size)
        };
        if evicted > 0 {
            tracing::warn!("🪦 Evicted {} dead letters after capacity change", evicted);
            self.inner.persist().await;
        }

        if self.inner.running.load(Ordering::Acquire) {
            self.inner.abort_timers();
            self.inner.spawn_timers(&next);
        }
        Ok(())
    }

    /// Stop listening, cancel timers and save a final snapshot.
    pub async fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        for handle in self.inner.handles.lock().drain(..) {
            handle.abort();
        }
        self.inner.persist().await;
        self.inner.executor.destroy();
        tracing::info!("🪦 Dead letter queue {} destroyed", self.inner.id);
    }
}

/// Remove the oldest entries until at most `capacity` remain.
fn evict_oldest(slots: &mut HashMap<TaskId, Slot>, capacity: usize) -> usize {
    let mut evicted = 0;
    while slots.len() > capacity {
        let oldest = slots
            .iter()
            .min_by_key(|(_, s)| s.entry.added_at)
            .map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                slots.remove(&id);
                evicted += 1;
            }
            None => break,
        }
    }
    evicted
}

impl DeadLetterInner {
    async fn add(
        &self,
        task: Task,
        reason: DeadLetterReason,
        error_history: Vec<ErrorRecord>,
        final_error: TaskFailure,
    ) -> DeadLetterEntry {
        let category = categorize(reason, &final_error);
        let capacity = self.config.read().max_queue_size;
        let task_id = task.id.clone();

        let entry = {
            let mut slots = self.slots.lock().await;
            let (reprocess_count, last_reprocess_at) = slots
                .get(&task_id)
                .map(|s| (s.entry.reprocess_count, s.entry.last_reprocess_at))
                .unwrap_or((0, None));

            if !slots.contains_key(&task_id) && slots.len() >= capacity {
                let evicted = evict_oldest(&mut slots, capacity.saturating_sub(1));
                tracing::warn!("🪦 Dead letter queue {} full, evicted {} oldest", self.id, evicted);
            }

            let entry = DeadLetterEntry {
                task: task.snapshot(),
                reason,
                error_history,
                final_error,
                added_at: Utc::now(),
                category,
                can_reprocess: is_reprocessable(reason, category),
                reprocess_count,
                last_reprocess_at,
            };
            slots.insert(
                task_id.clone(),
                Slot {
                    entry: entry.clone(),
                    task: Some(task),
                },
            );
            entry
        };

        self.persist().await;
        self.bus.publish(Event::DeadLetter(DeadLetterEvent::TaskAdded {
            task_id: task_id.clone(),
            reason,
            category,
        }));
        tracing::warn!(
            "🪦 Task {} dead-lettered ({}, {}): {}",
            task_id,
            reason,
            category,
            entry.final_error
        );
        entry
    }

    async fn reprocess(&self, task_id: &str) -> LaunchResult<bool> {
        let (snapshot, task, reason) = {
            let slots = self.slots.lock().await;
            let slot = slots.get(task_id).ok_or_else(|| LaunchError::TaskNotFound {
                task_id: task_id.to_string(),
            })?;
            if !slot.entry.can_reprocess {
                tracing::debug!("🪦 Task {} is not reprocessable", task_id);
                return Ok(false);
            }
            (slot.entry.task.clone(), slot.task.clone(), slot.entry.reason)
        };

        let task = match task {
            Some(task) => task,
            None => match self.registry.rehydrate(snapshot).await {
                Ok(task) => task,
                Err(e) => {
                    self.bus
                        .publish(Event::DeadLetter(DeadLetterEvent::ReprocessFailed {
                            task_id: task_id.to_string(),
                            error: e.to_string(),
                        }));
                    tracing::warn!("🪦 Task {} could not be rebuilt: {}", task_id, e);
                    return Err(e);
                }
            },
        };

        let count = {
            let mut slots = self.slots.lock().await;
            let Some(slot) = slots.get_mut(task_id) else {
                return Err(LaunchError::TaskNotFound {
                    task_id: task_id.to_string(),
                });
            };
            slot.entry.reprocess_count += 1;
            slot.entry.last_reprocess_at = Some(Utc::now());
            slot.task = Some(task.clone());
            slot.entry.reprocess_count
        };
        self.counters.lock().await.reprocess_attempts += 1;
        self.persist().await;

        let resubmitted = task.for_reprocess(count, reason.as_str());
        let standalone = resubmitted.scheduler_id().is_none();
        self.bus
            .publish(Event::DeadLetter(DeadLetterEvent::TaskReprocessed {
                task: resubmitted.clone(),
                reprocess_count: count,
            }));
        tracing::info!("🪦 Task {} reprocessed (#{})", task_id, count);

        if standalone {
            let executor = Arc::clone(&self.executor);
            let id = task_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = executor.execute(resubmitted, CancellationToken::new()).await {
                    tracing::warn!("🪦 Reprocessed task {} could not run: {}", id, e);
                }
            });
        }
        Ok(true)
    }

    async fn recover(&self, task_id: &str) {
        let removed = {
            let mut slots = self.slots.lock().await;
            match slots.get(task_id) {
                Some(slot) if slot.entry.reprocess_count > 0 => slots.remove(task_id),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        self.counters.lock().await.reprocess_successes += 1;
        self.persist().await;
        self.bus.publish(Event::DeadLetter(DeadLetterEvent::TaskRecovered {
            task_id: task_id.to_string(),
        }));
        tracing::info!("🪦 Task {} recovered after reprocessing", task_id);
    }

    async fn purge_expired(&self) -> Vec<TaskId> {
        let retention = self.config.read().retention_ms;
        let cutoff = Utc::now() - chrono::Duration::milliseconds(retention as i64);
        let expired: Vec<TaskId> = {
            let mut slots = self.slots.lock().await;
            let ids: Vec<TaskId> = slots
                .iter()
                .filter(|(_, s)| s.entry.added_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                slots.remove(id);
            }
            ids
        };

        if !expired.is_empty() {
            self.persist().await;
            tracing::info!("🪦 {} dead letters expired", expired.len());
            self.bus.publish(Event::DeadLetter(DeadLetterEvent::TasksExpired {
                task_ids: expired.clone(),
            }));
        }
        expired
    }

    async fn stats(&self) -> DeadLetterStats {
        let slots = self.slots.lock().await;
        let counters = self.counters.lock().await;
        let now = Utc::now();

        let mut by_reason = BTreeMap::new();
        let mut by_category = BTreeMap::new();
        let mut reprocessable = 0;
        let mut queued_ms = 0i64;
        for slot in slots.values() {
            let entry = &slot.entry;
            *by_reason.entry(entry.reason.as_str().to_string()).or_insert(0) += 1;
            *by_category.entry(entry.category.as_str().to_string()).or_insert(0) += 1;
            if entry.can_reprocess {
                reprocessable += 1;
            }
            queued_ms += (now - entry.added_at).num_milliseconds().max(0);
        }

        let total = slots.len();
        DeadLetterStats {
            total_tasks: total,
            by_reason,
            by_category,
            reprocessable,
            reprocess_attempts: counters.reprocess_attempts,
            reprocess_successes: counters.reprocess_successes,
            reprocess_success_rate: success_rate(&counters),
            average_queue_time: if total > 0 {
                Duration::from_millis((queued_ms / total as i64) as u64)
            } else {
                Duration::ZERO
            },
            oldest_entry: slots.values().map(|s| s.entry.added_at).min(),
            newest_entry: slots.values().map(|s| s.entry.added_at).max(),
        }
    }

    async fn analyze(&self) -> Arc<ErrorAnalysis> {
        let (counts, categories, total) = {
            let slots = self.slots.lock().await;
            let mut counts: HashMap<&'static str, usize> = HashMap::new();
            let mut categories: BTreeMap<ErrorCategory, usize> = BTreeMap::new();
            for slot in slots.values() {
                *counts.entry(slot.entry.final_error.error_type()).or_insert(0) += 1;
                *categories.entry(slot.entry.category).or_insert(0) += 1;
            }
            (counts, categories, slots.len())
        };
        let counters = self.counters.lock().await;

        let mut common_errors: Vec<ErrorFrequency> = counts
            .into_iter()
            .map(|(error_type, count)| ErrorFrequency {
                error_type: error_type.to_string(),
                count,
            })
            .collect();
        common_errors.sort_by(|a, b| b.count.cmp(&a.count).then(a.error_type.cmp(&b.error_type)));
        common_errors.truncate(5);

        let trends: Vec<CategoryTrend> = categories
            .into_iter()
            .map(|(category, count)| CategoryTrend {
                category,
                count,
                trend: if count > 10 {
                    Trend::Increasing
                } else if count < 5 {
                    Trend::Decreasing
                } else {
                    Trend::Stable
                },
            })
            .collect();

        let mut recommendations = Vec::new();
        for error in common_errors.iter().filter(|e| e.count > 10) {
            let name = error.error_type.to_lowercase();
            if name.contains("timeout") {
                recommendations
                    .push("Consider raising task timeouts or speeding up the task body".to_string());
            } else if name.contains("network") {
                recommendations
                    .push("Check network stability and consider retrying at the network layer".to_string());
            } else if name.contains("memory") {
                recommendations
                    .push("Reduce memory usage or provision more memory".to_string());
            }
        }
        if trends.iter().any(|t| t.trend == Trend::Increasing) {
            recommendations.push("Error volume is rising, run a system health check".to_string());
        }
        if counters.reprocess_attempts > 0 && success_rate(&counters) < 0.5 {
            recommendations.push(
                "Reprocessing rarely succeeds, review error categorization and retry policy".to_string(),
            );
        }
        drop(counters);

        let analysis = Arc::new(ErrorAnalysis {
            generated_at: Utc::now(),
            total_entries: total,
            common_errors,
            trends,
            recommendations,
        });
        self.bus
            .publish(Event::DeadLetter(DeadLetterEvent::AnalysisCompleted {
                analysis: Arc::clone(&analysis),
            }));
        tracing::debug!(
            "🪦 Dead letter analysis: {} entries, {} recommendations",
            total,
            analysis.recommendations.len()
        );
        analysis
    }

    /// Save the current entries, oldest first. Failures are logged.
    async fn persist(&self) {
        if !self.config.read().enable_persistence {
            return;
        }
        let _guard = self.persist_lock.lock().await;
        let mut entries: Vec<DeadLetterEntry> = self
            .slots
            .lock()
            .await
            .values()
            .map(|s| s.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.added_at.cmp(&b.added_at));

        if let Err(e) = self.store.save(&self.id, &entries).await {
            tracing::warn!(
                "🪦 Failed to persist dead letters to {} store: {}",
                self.store.name(),
                e
            );
        }
    }

    fn spawn_timers(self: &Arc<Self>, config: &DeadLetterConfig) {
        let mut handles = self.handles.lock();

        let period = Duration::from_millis(config.cleanup_interval_ms);
        let weak = Arc::downgrade(self);
        handles.push(tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                inner.purge_expired().await;
            }
        }));

        if config.enable_auto_analysis {
            let period = Duration::from_millis(config.analysis_interval_ms);
            let weak = Arc::downgrade(self);
            handles.push(tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                loop {
                    ticks.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.analyze().await;
                }
            }));
        }
    }

    /// Abort the timers, keeping the event listener (always the first handle).
    fn abort_timers(&self) {
        let mut handles = self.handles.lock();
        if handles.len() > 1 {
            for timer in handles.drain(1..) {
                timer.abort();
            }
        }
    }
}

fn success_rate(counters: &Counters) -> f64 {
    if counters.reprocess_attempts == 0 {
        0.0
    } else {
        counters.reprocess_successes as f64 / counters.reprocess_attempts as f64
    }
}

async fn listen(inner: Weak<DeadLetterInner>, mut events: tokio::sync::broadcast::Receiver<Event>) {
    while let Some(event) = next_event(&mut events).await {
        let Some(inner) = inner.upgrade() else { break };
        match event {
            Event::Retry(RetryEvent::TaskFinallyFailed {
                task,
                reason,
                error_history,
                final_error,
                ..
            }) => {
                inner.add(task, reason, error_history, final_error).await;
            }
            Event::Queue(QueueEvent::TaskCompleted { task_id, .. }) => inner.recover(&task_id).await,
            _ => {}
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::store::MemoryStore;
    use serde_json::Value;

    pub(crate) fn sample_entry(id: &str, message: &str) -> DeadLetterEntry {
        let task = Task::from_fn(|_| async { Ok(Value::Null) })
            .with_id(id)
            .with_type("sample");
        let failure = TaskFailure::execution(message);
        let reason = DeadLetterReason::MaxRetriesExceeded;
        let category = categorize(reason, &failure);
        DeadLetterEntry {
            task: task.snapshot(),
            reason,
            error_history: vec![ErrorRecord {
                attempt: 1,
                error: failure.clone(),
                timestamp: Utc::now(),
            }],
            final_error: failure,
            added_at: Utc::now(),
            category,
            can_reprocess: is_reprocessable(reason, category),
            reprocess_count: 0,
            last_reprocess_at: None,
        }
    }

    fn config() -> DeadLetterConfig {
        DeadLetterConfig {
            enable_auto_analysis: false,
            ..Default::default()
        }
    }

    async fn queue_with(store: MemoryStore, registry: OperationRegistry, bus: &EventBus) -> DeadLetterQueue {
        let dlq = DeadLetterQueue::new(
            "dlq",
            config(),
            ExecutorConfig::default(),
            Arc::new(store),
            registry,
            bus.clone(),
        );
        dlq.start().await.unwrap();
        dlq
    }

    fn task(id: &str, ok: bool) -> Task {
        Task::from_fn(move |_| async move {
            if ok {
                Ok(Value::Null)
            } else {
                Err(LaunchError::failure("still broken"))
            }
        })
        .with_id(id)
    }

    async fn add(dlq: &DeadLetterQueue, task: Task, reason: DeadLetterReason, message: &str) -> DeadLetterEntry {
        let failure = TaskFailure::execution(message);
        dlq.add_task(task, reason, Vec::new(), failure).await.unwrap()
    }

    #[test]
    fn test_categorize() {
        let network = TaskFailure::execution("ECONNRESET network error");
        let category = categorize(DeadLetterReason::MaxRetriesExceeded, &network);
        assert_eq!(category, ErrorCategory::Temporary);
        assert!(is_reprocessable(DeadLetterReason::MaxRetriesExceeded, category));

        let category = categorize(DeadLetterReason::ValidationFailed, &network);
        assert_eq!(category, ErrorCategory::Permanent);
        assert!(!is_reprocessable(DeadLetterReason::ValidationFailed, category));

        let missing = TaskFailure::execution("404 Not Found");
        assert_eq!(
            categorize(DeadLetterReason::SystemError, &missing),
            ErrorCategory::Permanent
        );
        assert_eq!(
            categorize(DeadLetterReason::SystemError, &TaskFailure::timeout(500)),
            ErrorCategory::Temporary
        );
        assert_eq!(
            categorize(DeadLetterReason::SystemError, &TaskFailure::execution("boom")),
            ErrorCategory::Unknown
        );
        assert!(!is_reprocessable(
            DeadLetterReason::ManualTermination,
            ErrorCategory::Unknown
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_failure_event_lands_in_queue() {
        let bus = EventBus::new();
        let dlq = queue_with(MemoryStore::new(), OperationRegistry::new(), &bus).await;

        bus.publish(Event::Retry(RetryEvent::TaskFinallyFailed {
            task: task("t1", false),
            reason: DeadLetterReason::MaxRetriesExceeded,
            error_history: Vec::new(),
            final_error: TaskFailure::execution("ECONNRESET"),
            total_attempts: 3,
        }));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let entry = dlq.get_task("t1").await.unwrap();
        assert_eq!(entry.category, ErrorCategory::Temporary);
        assert!(entry.can_reprocess);
        assert_eq!(entry.reprocess_count, 0);
        assert_eq!(bus.history(&EventFilter::name("deadLetter:taskAdded"), None).len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let bus = EventBus::new();
        let dlq = queue_with(MemoryStore::new(), OperationRegistry::new(), &bus).await;
        dlq.update_config(|c| c.max_queue_size = 2).await.unwrap();

        for id in ["a", "b", "c"] {
            add(&dlq, task(id, false), DeadLetterReason::SystemError, "boom").await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(dlq.len().await, 2);
        assert!(dlq.get_task("a").await.is_none());
        assert!(dlq.get_task("c").await.is_some());

        assert!(dlq.update_config(|c| c.max_queue_size = 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reprocess_and_recover() {
        let bus = EventBus::new();
        let store = MemoryStore::new();
        let dlq = queue_with(store.clone(), OperationRegistry::new(), &bus).await;
        add(&dlq, task("t1", true), DeadLetterReason::MaxRetriesExceeded, "ECONNRESET").await;
        assert_eq!(store.len("dlq"), 1);

        assert!(dlq.reprocess("t1").await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(dlq.get_task("t1").await.is_none());
        assert_eq!(store.len("dlq"), 0);
        let reprocessed = bus.history(&EventFilter::name("deadLetter:taskReprocessed"), None);
        match &reprocessed[0].event {
            Event::DeadLetter(DeadLetterEvent::TaskReprocessed { task, reprocess_count }) => {
                assert_eq!(*reprocess_count, 1);
                assert_eq!(task.attempt(), 1);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(bus.history(&EventFilter::name("deadLetter:taskRecovered"), None).len(), 1);

        let stats = dlq.stats().await;
        assert_eq!(stats.reprocess_attempts, 1);
        assert_eq!(stats.reprocess_successes, 1);
        assert_eq!(stats.reprocess_success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_reprocess_refusals() {
        let bus = EventBus::new();
        let dlq = queue_with(MemoryStore::new(), OperationRegistry::new(), &bus).await;
        add(&dlq, task("bad", true), DeadLetterReason::ValidationFailed, "invalid input").await;

        assert!(!dlq.reprocess("bad").await.unwrap());
        assert!(matches!(
            dlq.reprocess("missing").await,
            Err(LaunchError::TaskNotFound { .. })
        ));
        assert_eq!(dlq.get_task("bad").await.unwrap().reprocess_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_entries_are_rehydrated() {
        let bus = EventBus::new();
        let store = MemoryStore::new();
        let first = queue_with(store.clone(), OperationRegistry::new(), &bus).await;
        add(&first, task("t1", true).with_type("sample"), DeadLetterReason::SystemError, "ECONNRESET").await;
        add(&first, task("t2", true).with_type("unknown"), DeadLetterReason::SystemError, "ECONNRESET").await;
        first.destroy().await;

        let registry = OperationRegistry::new();
        registry.register_fn("sample", |_| async { Ok(Value::Null) }).await;
        let second = queue_with(store, registry, &bus).await;
        assert_eq!(second.len().await, 2);

        assert!(second.reprocess("t1").await.unwrap());
        assert!(matches!(
            second.reprocess("t2").await,
            Err(LaunchError::TaskNotFound { .. })
        ));
        assert_eq!(
            bus.history(&EventFilter::name("deadLetter:reprocessFailed"), None).len(),
            1
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.get_task("t1").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged() {
        let bus = EventBus::new();
        let store = MemoryStore::new();
        let mut old = sample_entry("old", "ECONNRESET");
        old.added_at = Utc::now() - chrono::Duration::days(10);
        store
            .save("dlq", &[old, sample_entry("fresh", "ECONNRESET")])
            .await
            .unwrap();

        let dlq = queue_with(store, OperationRegistry::new(), &bus).await;
        assert_eq!(dlq.purge_expired().await, vec!["old".to_string()]);
        assert_eq!(dlq.len().await, 1);
        assert_eq!(bus.history(&EventFilter::name("deadLetter:tasksExpired"), None).len(), 1);
    }

    #[tokio::test]
    async fn test_analysis_and_recommendations() {
        let bus = EventBus::new();
        let dlq = queue_with(MemoryStore::new(), OperationRegistry::new(), &bus).await;
        for i in 0..12 {
            dlq.add_task(
                task(&format!("slow-{}", i), false),
                DeadLetterReason::Timeout,
                Vec::new(),
                TaskFailure::timeout(1_000),
            )
            .await
            .unwrap();
        }
        add(&dlq, task("nf", false), DeadLetterReason::UserError, "not found").await;

        let analysis = dlq.analyze().await;
        assert_eq!(analysis.total_entries, 13);
        assert_eq!(analysis.common_errors[0].error_type, "TimeoutError");
        assert_eq!(analysis.common_errors[0].count, 12);
        assert!(
            analysis
                .trends
                .iter()
                .any(|t| t.category == ErrorCategory::Temporary && t.trend == Trend::Increasing)
        );
        assert!(analysis.recommendations.iter().any(|r| r.contains("timeouts")));
        assert!(analysis.recommendations.iter().any(|r| r.contains("health check")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_batch_stats_and_clear() {
        let bus = EventBus::new();
        let dlq = queue_with(MemoryStore::new(), OperationRegistry::new(), &bus).await;
        add(&dlq, task("n1", false), DeadLetterReason::MaxRetriesExceeded, "connection refused").await;
        add(&dlq, task("n2", false), DeadLetterReason::MaxRetriesExceeded, "network down").await;
        add(&dlq, task("u1", false), DeadLetterReason::UserError, "forbidden").await;

        let temporary = dlq
            .filter_tasks(&DeadLetterFilter {
                category: Some(ErrorCategory::Temporary),
                ..Default::default()
            })
            .await;
        assert_eq!(temporary.len(), 2);

        let stats = dlq.stats().await;
        assert_eq!(stats.total_tasks, 3);
        assert_eq!(stats.reprocessable, 2);
        assert_eq!(stats.by_reason.get("user_error"), Some(&1));
        assert_eq!(stats.by_category.get("temporary"), Some(&2));

        assert_eq!(
            dlq.reprocess_by_category(ErrorCategory::Temporary).await.unwrap(),
            (2, 0)
        );
        assert_eq!(dlq.get_task("n1").await.unwrap().reprocess_count, 1);

        assert_eq!(dlq.clear().await, 3);
        assert!(dlq.is_empty().await);
    }
}
