//! Error types for launchq operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type used throughout launchq.
pub type LaunchResult<T> = Result<T, LaunchError>;

/// Why a call to `schedule` was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The rate-limit window is full
    RateLimited,
    /// The scheduler configuration does not validate
    InvalidConfig,
    /// The component is stopped or destroyed
    NotAccepting,
    /// A task with the same id is already queued or running
    Duplicate,
    /// The task has already run and is no longer pending
    NotPending,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::RateLimited => "rate limit exceeded",
            Self::InvalidConfig => "invalid configuration",
            Self::NotAccepting => "not accepting tasks",
            Self::Duplicate => "task already in flight",
            Self::NotPending => "task is not pending",
        };
        f.write_str(text)
    }
}

/// Main error type for launchq operations.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Scheduling was refused synchronously
    #[error("Schedule rejected: {reason} ({detail})")]
    ScheduleRejected {
        /// Rejection class
        reason: RejectReason,
        /// Human readable detail
        detail: String,
    },

    /// Task operation did not finish before its deadline
    #[error("Task timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout that elapsed, in milliseconds
        timeout_ms: u64,
    },

    /// Task body returned an error or panicked
    #[error("Task execution failed: {message}")]
    TaskExecutionFailed {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Task was cancelled before or while running
    #[error("Task {task_id} was cancelled")]
    Cancelled {
        /// Cancelled task
        task_id: String,
    },

    /// No task (or task type) with the given identifier
    #[error("Task '{task_id}' not found")]
    TaskNotFound {
        /// The identifier that was looked up
        task_id: String,
    },

    /// Queue level error
    #[error("Queue error: {message}")]
    QueueError {
        /// Error message
        message: String,
        /// Optional underlying error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError {
        /// Error message
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Dead-letter persistence I/O error
    #[error("Persistence error: {0}")]
    Io(#[from] std::io::Error),

    /// Component is already running
    #[error("Component is already running")]
    AlreadyRunning,

    /// Component is not running
    #[error("Component is not running")]
    NotRunning,

    /// Component has been destroyed and refuses further work
    #[error("Component has been destroyed")]
    Destroyed,

    /// Redis store error
    #[cfg(feature = "redis-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-store")))]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Prometheus registry error
    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl LaunchError {
    /// Create a new task execution error with an underlying source
    pub fn task_execution<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TaskExecutionFailed {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a task failure carrying only a message
    pub fn failure(message: impl Into<String>) -> Self {
        Self::TaskExecutionFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new queue error
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// Create a scheduling rejection
    pub fn rejected(reason: RejectReason, detail: impl Into<String>) -> Self {
        Self::ScheduleRejected {
            reason,
            detail: detail.into(),
        }
    }
}

/// Kind of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The executor deadline elapsed
    Timeout,
    /// The task body returned an error or panicked
    Execution,
    /// The task observed its cancellation signal
    Cancelled,
}

/// Cloneable record of why a task execution failed.
///
/// Travels inside events and dead-letter snapshots, so unlike [`LaunchError`]
/// it holds no boxed sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure class
    pub kind: FailureKind,
    /// Error text as produced by the task body or the executor
    pub message: String,
}

impl TaskFailure {
    /// Failure produced by the task body
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            message: message.into(),
        }
    }

    /// Failure produced by the executor deadline
    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("Task timed out after {}ms", timeout_ms),
        }
    }

    /// Failure produced by cancellation
    pub fn cancelled(task_id: &str) -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: format!("Task {} was cancelled", task_id),
        }
    }

    /// Whether this failure is a timeout, either by kind or by message text.
    pub fn is_timeout(&self) -> bool {
        self.kind == FailureKind::Timeout || self.message.to_lowercase().contains("timeout")
    }

    /// Short error-type label used when grouping failures.
    pub fn error_type(&self) -> &'static str {
        let lower = self.message.to_lowercase();
        match self.kind {
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Cancelled => "CancelledError",
            FailureKind::Execution if lower.contains("timeout") => "TimeoutError",
            FailureKind::Execution
                if lower.contains("network")
                    || lower.contains("connection")
                    || lower.contains("econn") =>
            {
                "NetworkError"
            }
            FailureKind::Execution if lower.contains("memory") => "MemoryError",
            FailureKind::Execution => "ExecutionError",
        }
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<&LaunchError> for TaskFailure {
    fn from(error: &LaunchError) -> Self {
        match error {
            LaunchError::Timeout { timeout_ms } => TaskFailure::timeout(*timeout_ms),
            LaunchError::Cancelled { task_id } => TaskFailure::cancelled(task_id),
            LaunchError::TaskExecutionFailed { message, .. } => {
                TaskFailure::execution(message.clone())
            }
            other => TaskFailure::execution(other.to_string()),
        }
    }
}

impl From<LaunchError> for TaskFailure {
    fn from(error: LaunchError) -> Self {
        TaskFailure::from(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_from_timeout_error() {
        let failure = TaskFailure::from(LaunchError::Timeout { timeout_ms: 250 });
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.is_timeout());
        assert_eq!(failure.error_type(), "TimeoutError");
    }

    #[test]
    fn test_timeout_detected_from_message() {
        let failure = TaskFailure::execution("upstream timeout while fetching");
        assert_eq!(failure.kind, FailureKind::Execution);
        assert!(failure.is_timeout());
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(
            TaskFailure::execution("ECONNRESET").error_type(),
            "NetworkError"
        );
        assert_eq!(
            TaskFailure::execution("out of memory").error_type(),
            "MemoryError"
        );
        assert_eq!(TaskFailure::execution("boom").error_type(), "ExecutionError");
        assert_eq!(TaskFailure::cancelled("t").error_type(), "CancelledError");
    }

    #[test]
    fn test_rejection_display() {
        let err = LaunchError::rejected(RejectReason::RateLimited, "3 tasks per 5000ms");
        assert_eq!(
            err.to_string(),
            "Schedule rejected: rate limit exceeded (3 tasks per 5000ms)"
        );
    }
}
