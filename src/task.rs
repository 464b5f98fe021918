//! Task model: the unit of work accepted by schedulers.
//!
//! A [`Task`] bundles an asynchronous [`TaskOperation`] with its scheduling
//! attributes (priority, timeout, retry limit) and a typed metadata map. The
//! operation itself is not serializable; [`TaskSnapshot`] is the serializable
//! view used in events and dead-letter persistence, and a snapshot can be
//! turned back into a runnable task through an
//! [`OperationRegistry`](crate::core::registry::OperationRegistry) keyed by
//! [`Task::task_type`].
//!
//! # Examples
//!
//! ```rust
//! use launchq::task::Task;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! let task = Task::from_fn(|ctx| async move { Ok(json!({ "echo": ctx.payload })) })
//!     .with_type("echo")
//!     .with_priority(8)
//!     .with_timeout(Duration::from_secs(2))
//!     .with_payload(json!("hello"));
//!
//! assert_eq!(task.priority, 8);
//! assert_eq!(task.task_type, "echo");
//! ```

use crate::error::{LaunchError, LaunchResult, TaskFailure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Unique identifier for a task
pub type TaskId = String;

/// Well-known metadata keys written by the scheduling pipeline.
pub mod meta {
    /// Delay in milliseconds honoured by delayed queues
    pub const DELAY: &str = "delay";
    /// Scheduler that accepted the task
    pub const SCHEDULER_ID: &str = "scheduler_id";
    /// Execution mode of that scheduler at schedule time
    pub const MODE: &str = "mode";
    /// When the scheduler accepted the task
    pub const SCHEDULED_AT: &str = "scheduled_at";
    /// Set on copies created by the retry handler
    pub const IS_RETRY: &str = "is_retry";
    /// Retry number of a retry copy, starting at 1
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    /// Set on copies created by dead-letter reprocessing
    pub const IS_REPROCESSED: &str = "is_reprocessed";
    /// How many times the task was reprocessed
    pub const REPROCESS_COUNT: &str = "reprocess_count";
    /// Failure reason that sent the task to the dead letter queue
    pub const ORIGINAL_FAILURE_REASON: &str = "original_failure_reason";
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting to be executed
    Pending,
    /// Currently executing
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error or timeout
    Failed,
    /// Cancelled before or during execution
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

/// Closed set of values a metadata entry may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum MetadataValue {
    /// Text
    String(String),
    /// Any number
    Number(f64),
    /// Flag
    Bool(bool),
    /// Wall-clock instant
    Timestamp(DateTime<Utc>),
}

impl MetadataValue {
    /// Text value, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, if this is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Flag value, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Timestamp value, if this is a timestamp.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<u32> for MetadataValue {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u64> for MetadataValue {
    fn from(value: u64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for MetadataValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Typed metadata map carried by every task.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Everything an operation gets to see about the execution it runs in.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Identifier of the running task
    pub task_id: TaskId,
    /// Execution number, 1 for the first run and incremented per retry
    pub attempt: u32,
    /// Payload of the task
    pub payload: Value,
    cancel: CancellationToken,
}

impl TaskContext {
    /// Build a context for a task execution.
    pub fn new(task_id: TaskId, attempt: u32, payload: Value, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            attempt,
            payload,
            cancel,
        }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Cancellation is cooperative: an operation that never awaits this (or
    /// checks [`is_cancelled`](Self::is_cancelled)) runs until its timeout.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The underlying token, for handing to nested work.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Asynchronous body of a task.
#[async_trait]
pub trait TaskOperation: Send + Sync {
    /// Run the operation once.
    async fn run(&self, ctx: TaskContext) -> LaunchResult<Value>;
}

/// Adapter turning an async closure into a [`TaskOperation`].
pub struct FnOperation<F>(F);

impl<F> FnOperation<F> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> TaskOperation for FnOperation<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LaunchResult<Value>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> LaunchResult<Value> {
        (self.0)(ctx).await
    }
}

/// Invoked with the result of a successful execution.
pub type SuccessCallback = Arc<dyn Fn(&TaskId, &Value) + Send + Sync>;

/// Invoked with the failure of an unsuccessful execution.
pub type ErrorCallback = Arc<dyn Fn(&TaskId, &TaskFailure) + Send + Sync>;

/// A unit of work.
#[derive(Clone)]
pub struct Task {
    /// Unique task identifier
    pub id: TaskId,
    /// Type name used to look the operation up when rehydrating
    pub task_type: String,
    /// Higher is more urgent
    pub priority: i32,
    /// Input handed to the operation
    pub payload: Value,
    /// Per-task timeout, falling back to the executor default
    pub timeout: Option<Duration>,
    /// Retries allowed after the first failure; `None` defers to the retry
    /// handler's configuration
    pub max_retries: Option<u32>,
    /// Typed metadata
    pub metadata: Metadata,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When the current execution started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
    /// Result of a successful execution
    pub result: Option<Value>,
    /// Failure of an unsuccessful execution
    pub error: Option<TaskFailure>,
    state: TaskState,
    operation: Arc<dyn TaskOperation>,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("priority", &self.priority)
            .field("state", &self.state)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl Task {
    /// Create a pending task around an operation.
    pub fn new(operation: Arc<dyn TaskOperation>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: "anonymous".to_string(),
            priority: 0,
            payload: Value::Null,
            timeout: None,
            max_retries: None,
            metadata: Metadata::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            state: TaskState::Pending,
            operation,
            on_success: None,
            on_error: None,
        }
    }

    /// Create a pending task from an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LaunchResult<Value>> + Send + 'static,
    {
        Self::new(Arc::new(FnOperation::new(f)))
    }

    /// Set the identifier.
    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the type name.
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry limit.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Insert one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Hold the task in a delayed queue for `delay` before it becomes visible.
    pub fn with_delay(self, delay: Duration) -> Self {
        let ms = delay.as_millis() as u64;
        self.with_metadata(meta::DELAY, ms)
    }

    /// Register a success callback.
    pub fn on_success(mut self, callback: impl Fn(&TaskId, &Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Register an error callback.
    pub fn on_error(
        mut self,
        callback: impl Fn(&TaskId, &TaskFailure) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Shared handle to the operation.
    pub fn operation(&self) -> Arc<dyn TaskOperation> {
        Arc::clone(&self.operation)
    }

    fn transition(&mut self, next: TaskState) -> LaunchResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(LaunchError::queue(format!(
                "Task {} cannot move from {:?} to {:?}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Pending -> Running.
    pub fn mark_running(&mut self) -> LaunchResult<()> {
        self.transition(TaskState::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Running -> Completed.
    pub fn mark_completed(&mut self, result: Value) -> LaunchResult<()> {
        self.transition(TaskState::Completed)?;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        Ok(())
    }

    /// Running -> Failed.
    pub fn mark_failed(&mut self, failure: TaskFailure) -> LaunchResult<()> {
        self.transition(TaskState::Failed)?;
        self.completed_at = Some(Utc::now());
        self.error = Some(failure);
        Ok(())
    }

    /// Pending or Running -> Cancelled.
    pub fn mark_cancelled(&mut self) -> LaunchResult<()> {
        self.transition(TaskState::Cancelled)?;
        self.completed_at = Some(Utc::now());
        if self.error.is_none() {
            self.error = Some(TaskFailure::cancelled(&self.id));
        }
        Ok(())
    }

    pub(crate) fn notify_success(&self, result: &Value) {
        if let Some(callback) = &self.on_success {
            callback(&self.id, result);
        }
    }

    pub(crate) fn notify_error(&self, failure: &TaskFailure) {
        if let Some(callback) = &self.on_error {
            callback(&self.id, failure);
        }
    }

    /// Execution context for the next run of this task.
    pub fn context(&self, cancel: CancellationToken) -> TaskContext {
        TaskContext::new(self.id.clone(), self.attempt(), self.payload.clone(), cancel)
    }

    /// Execution number of the next run: 1 plus the retry attempt.
    pub fn attempt(&self) -> u32 {
        let retries = self
            .metadata
            .get(meta::RETRY_ATTEMPT)
            .and_then(MetadataValue::as_f64)
            .unwrap_or(0.0);
        retries as u32 + 1
    }

    /// Delay carried in metadata, if positive.
    pub fn delay(&self) -> Option<Duration> {
        self.metadata
            .get(meta::DELAY)
            .and_then(MetadataValue::as_f64)
            .filter(|ms| *ms > 0.0)
            .map(|ms| Duration::from_millis(ms as u64))
    }

    /// Scheduler that accepted this task, if any.
    pub fn scheduler_id(&self) -> Option<&str> {
        self.metadata
            .get(meta::SCHEDULER_ID)
            .and_then(MetadataValue::as_str)
    }

    /// Time between start and completion of the last execution.
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        let completed = self.completed_at?;
        (completed - started).to_std().ok()
    }

    /// Best-effort size of the task payload in bytes.
    pub fn memory_estimate(&self) -> u64 {
        serde_json::to_vec(&self.payload)
            .map(|bytes| bytes.len() as u64)
            .unwrap_or(0)
    }

    fn reset(&mut self) {
        self.state = TaskState::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.result = None;
        self.error = None;
    }

    /// Pending copy of this task annotated as retry number `attempt`.
    pub fn for_retry(&self, attempt: u32) -> Task {
        let mut task = self.clone();
        task.reset();
        task.metadata.insert(meta::IS_RETRY.into(), true.into());
        task.metadata
            .insert(meta::RETRY_ATTEMPT.into(), attempt.into());
        task
    }

    /// Pending copy of this task annotated as a dead-letter reprocess.
    pub fn for_reprocess(&self, reprocess_count: u32, reason: &str) -> Task {
        let mut task = self.clone();
        task.reset();
        task.metadata.remove(meta::IS_RETRY);
        task.metadata.remove(meta::RETRY_ATTEMPT);
        task.metadata
            .insert(meta::IS_REPROCESSED.into(), true.into());
        task.metadata
            .insert(meta::REPROCESS_COUNT.into(), reprocess_count.into());
        task.metadata
            .insert(meta::ORIGINAL_FAILURE_REASON.into(), reason.into());
        task
    }

    /// Serializable view of the task.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id.clone(),
            task_type: self.task_type.clone(),
            priority: self.priority,
            payload: self.payload.clone(),
            timeout_ms: self.timeout.map(|t| t.as_millis() as u64),
            max_retries: self.max_retries,
            metadata: self.metadata.clone(),
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    /// Rebuild a pending task from a snapshot and its operation.
    pub fn from_snapshot(snapshot: TaskSnapshot, operation: Arc<dyn TaskOperation>) -> Task {
        let mut task = Task::new(operation);
        task.id = snapshot.id;
        task.task_type = snapshot.task_type;
        task.priority = snapshot.priority;
        task.payload = snapshot.payload;
        task.timeout = snapshot.timeout_ms.map(Duration::from_millis);
        task.max_retries = snapshot.max_retries;
        task.metadata = snapshot.metadata;
        task.created_at = snapshot.created_at;
        task
    }
}

/// Serializable view of a [`Task`] without its operation and callbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Unique task identifier
    pub id: TaskId,
    /// Type name
    pub task_type: String,
    /// Priority
    pub priority: i32,
    /// Payload
    pub payload: Value,
    /// Timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Retry limit
    pub max_retries: Option<u32>,
    /// Metadata
    pub metadata: Metadata,
    /// State at snapshot time
    pub state: TaskState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Start of the last execution
    pub started_at: Option<DateTime<Utc>>,
    /// Completion of the last execution
    pub completed_at: Option<DateTime<Utc>>,
    /// Result, if completed
    pub result: Option<Value>,
    /// Failure, if failed or cancelled
    pub error: Option<TaskFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Task {
        Task::from_fn(|_ctx| async { Ok(Value::Null) })
    }

    #[test]
    fn test_task_defaults() {
        let task = noop();
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.priority, 0);
        assert_eq!(task.max_retries, None);
        assert_eq!(task.attempt(), 1);
        assert!(task.delay().is_none());
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let mut task = noop();
        assert!(task.mark_completed(Value::Null).is_err());

        task.mark_running().unwrap();
        assert!(task.started_at.is_some());
        task.mark_completed(json!(42)).unwrap();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.result, Some(json!(42)));

        assert!(task.mark_running().is_err());
        assert!(task.mark_cancelled().is_err());
    }

    #[test]
    fn test_pending_task_can_be_cancelled() {
        let mut task = noop();
        task.mark_cancelled().unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(
            task.error.as_ref().map(|e| e.kind),
            Some(crate::error::FailureKind::Cancelled)
        );
    }

    #[test]
    fn test_delay_metadata() {
        let task = noop().with_delay(Duration::from_millis(250));
        assert_eq!(task.delay(), Some(Duration::from_millis(250)));

        let task = noop().with_metadata(meta::DELAY, 0u64);
        assert!(task.delay().is_none());
    }

    #[test]
    fn test_retry_copy_resets_state() {
        let mut task = noop().with_id("job-1");
        task.mark_running().unwrap();
        task.mark_failed(TaskFailure::execution("boom")).unwrap();

        let retry = task.for_retry(2);
        assert_eq!(retry.id, "job-1");
        assert_eq!(retry.state(), TaskState::Pending);
        assert!(retry.error.is_none());
        assert_eq!(retry.attempt(), 3);
        assert_eq!(
            retry.metadata.get(meta::IS_RETRY).and_then(MetadataValue::as_bool),
            Some(true)
        );
    }

    #[test]
    fn test_reprocess_copy_annotations() {
        let task = noop().for_retry(1).for_reprocess(1, "max_retries_exceeded");
        assert!(!task.metadata.contains_key(meta::IS_RETRY));
        assert_eq!(task.attempt(), 1);
        assert_eq!(
            task.metadata
                .get(meta::ORIGINAL_FAILURE_REASON)
                .and_then(MetadataValue::as_str),
            Some("max_retries_exceeded")
        );
    }

    #[test]
    fn test_snapshot_rehydration() {
        let task = noop()
            .with_type("fetch")
            .with_priority(7)
            .with_timeout(Duration::from_millis(1500))
            .with_payload(json!({ "url": "https://example.invalid" }))
            .with_metadata("source", "plugin-a");

        let snapshot = task.snapshot();
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: TaskSnapshot = serde_json::from_str(&encoded).unwrap();

        let restored = Task::from_snapshot(decoded, task.operation());
        assert_eq!(restored.id, task.id);
        assert_eq!(restored.task_type, "fetch");
        assert_eq!(restored.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(restored.metadata, task.metadata);
    }

    #[test]
    fn test_callbacks_are_invoked() {
        let hits = Arc::new(AtomicUsize::new(0));
        let ok_hits = Arc::clone(&hits);
        let err_hits = Arc::clone(&hits);
        let task = noop()
            .on_success(move |_, _| {
                ok_hits.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_, _| {
                err_hits.fetch_add(10, Ordering::SeqCst);
            });

        task.notify_success(&Value::Null);
        task.notify_error(&TaskFailure::execution("x"));
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_operation_sees_context() {
        let task = Task::from_fn(|ctx| async move {
            Ok(json!({ "id": ctx.task_id, "attempt": ctx.attempt, "payload": ctx.payload }))
        })
        .with_id("ctx-task")
        .with_payload(json!(5));

        let token = CancellationToken::new();
        let value = task.operation().run(task.context(token)).await.unwrap();
        assert_eq!(value, json!({ "id": "ctx-task", "attempt": 1, "payload": 5 }));
    }
}
