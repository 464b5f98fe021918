//! Task queues.
//!
//! A queue holds pending tasks and runs them on its own executor pool, at
//! most `concurrency` at a time. Four ordering policies are available
//! through [`QueueKind`]:
//!
//! - **FIFO**: strict append order
//! - **Priority**: a new task goes right before the first task with strictly
//!   lower priority, so ties keep insertion order
//! - **Delayed**: tasks carrying a `delay` in their metadata wait on a timer
//!   before becoming visible
//! - **Circular**: fixed capacity, evicting (cancelling) the oldest pending
//!   task when full
//!
//! # Examples
//!
//! ```rust,no_run
//! use launchq::config::{ExecutorConfig, QueueConfig, QueueKind};
//! use launchq::events::EventBus;
//! use launchq::queue::{QueueFactory, TaskQueue};
//! use launchq::task::Task;
//! use serde_json::Value;
//!
//! # async fn example() -> launchq::error::LaunchResult<()> {
//! let factory = QueueFactory::new(EventBus::new(), ExecutorConfig::default());
//! let queue = factory
//!     .create("uploads", QueueConfig::of_kind(QueueKind::Priority).with_concurrency(2))
//!     .await?;
//!
//! queue.push(Task::from_fn(|_| async { Ok(Value::Null) }).with_priority(5)).await?;
//! queue.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{ExecutorConfig, QueueConfig, QueueKind};
use crate::core::executor::ExecutionOutcome;
use crate::error::{LaunchError, LaunchResult};
use crate::events::EventBus;
use crate::task::{Task, TaskId, TaskSnapshot};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};

pub mod memory;
pub use memory::InMemoryQueue;

/// Channel receiving the outcome of every task a queue finishes.
pub type OutcomeSink = mpsc::UnboundedSender<ExecutionOutcome>;

/// Statistics about the queue state
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Tasks ever pushed
    pub total: u64,
    /// Visible tasks waiting to run
    pub pending: u64,
    /// Tasks waiting on a delay timer
    pub delayed: u64,
    /// Tasks currently running
    pub running: u64,
    /// Tasks completed successfully
    pub completed: u64,
    /// Tasks that failed or timed out
    pub failed: u64,
    /// Tasks cancelled or evicted
    pub cancelled: u64,
    /// Rolling average over the last 100 executions
    pub average_execution_time: Duration,
    /// Finished tasks per second since the queue was created
    pub throughput: f64,
}

/// What [`TaskQueue::cancel`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was pending or delayed and never ran
    Removed,
    /// The task is running; its cancellation token was triggered
    Signalled,
    /// The queue does not know the task
    NotFound,
}

/// Contract shared by every queue kind.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Queue identifier.
    fn id(&self) -> &str;

    /// Ordering policy.
    fn kind(&self) -> QueueKind;

    /// Add a task. Returns its identifier.
    async fn push(&self, task: Task) -> LaunchResult<TaskId>;

    /// Start dispatching pending tasks.
    async fn start(&self) -> LaunchResult<()>;

    /// Stop dispatching. Running tasks are left to finish.
    async fn stop(&self);

    /// Whether the queue is dispatching.
    fn is_running(&self) -> bool;

    /// Cancel a pending, delayed or running task.
    async fn cancel(&self, task_id: &str) -> CancelOutcome;

    /// Remove and return the next visible pending task without running it.
    async fn pop(&self) -> Option<Task>;

    /// Remove and return every pending and delayed task.
    async fn drain(&self) -> Vec<Task>;

    /// Cancel every pending and delayed task. Returns how many were cancelled.
    async fn clear(&self) -> usize;

    /// Snapshot of a task known to the queue.
    async fn get_task(&self, task_id: &str) -> Option<TaskSnapshot>;

    /// Snapshots of the pending tasks, in dispatch order.
    async fn tasks(&self) -> Vec<TaskSnapshot>;

    /// Number of visible pending tasks.
    async fn len(&self) -> usize;

    /// Whether no task is pending.
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Current statistics.
    async fn stats(&self) -> QueueStats;

    /// Pending over capacity for circular queues, running over concurrency
    /// otherwise.
    async fn utilization(&self) -> f64;

    /// Resize the executor pool.
    async fn set_concurrency(&self, concurrency: usize) -> LaunchResult<()>;

    /// Resize a circular queue, evicting the oldest surplus tasks.
    async fn set_capacity(&self, capacity: usize) -> LaunchResult<()>;

    /// Stop, cancel everything and release timers. The queue refuses further
    /// pushes afterwards.
    async fn destroy(&self);
}

/// Aggregated statistics across the queues of a [`QueueFactory`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalQueueStats {
    /// Number of queues
    pub queues: usize,
    /// Sum of `total`
    pub total: u64,
    /// Sum of `pending`
    pub pending: u64,
    /// Sum of `running`
    pub running: u64,
    /// Sum of `completed`
    pub completed: u64,
    /// Sum of `failed`
    pub failed: u64,
    /// Sum of `cancelled`
    pub cancelled: u64,
    /// Average execution time weighted by completed tasks
    pub average_execution_time: Duration,
    /// Sum of throughputs
    pub throughput: f64,
}

/// Creates queues and keeps track of them by id.
pub struct QueueFactory {
    bus: EventBus,
    executor_config: ExecutorConfig,
    queues: RwLock<HashMap<String, Arc<dyn TaskQueue>>>,
}

impl QueueFactory {
    /// Create a factory whose queues publish on `bus`.
    pub fn new(bus: EventBus, executor_config: ExecutorConfig) -> Self {
        Self {
            bus,
            executor_config,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Build a standalone queue, starting it when `config.autostart` is set.
    pub async fn build(
        id: impl Into<String>,
        config: &QueueConfig,
        bus: EventBus,
        executor_config: ExecutorConfig,
        sink: Option<OutcomeSink>,
    ) -> LaunchResult<Arc<dyn TaskQueue>> {
        if config.concurrency == 0 {
            return Err(LaunchError::config("Queue concurrency must be greater than 0"));
        }
        if config.kind == QueueKind::Circular && config.capacity == 0 {
            return Err(LaunchError::config(
                "Circular queue capacity must be greater than 0",
            ));
        }

        let queue = InMemoryQueue::new(id, config, bus, executor_config, sink);
        if config.autostart {
            queue.start().await?;
        }
        Ok(Arc::new(queue))
    }

    /// Create a named queue, destroying any existing queue with the same id.
    pub async fn create(
        &self,
        id: impl Into<String>,
        config: QueueConfig,
    ) -> LaunchResult<Arc<dyn TaskQueue>> {
        let id = id.into();
        let queue = Self::build(
            id.clone(),
            &config,
            self.bus.clone(),
            self.executor_config.clone(),
            None,
        )
        .await?;

        let previous = self.queues.write().await.insert(id.clone(), Arc::clone(&queue));
        if let Some(previous) = previous {
            tracing::warn!("📦 Replacing existing queue '{}'", id);
            previous.destroy().await;
        }

        tracing::info!(
            "📦 Created {} queue '{}' (concurrency {})",
            config.kind.as_str(),
            id,
            config.concurrency
        );
        Ok(queue)
    }

    /// Queue by id.
    pub async fn get(&self, id: &str) -> Option<Arc<dyn TaskQueue>> {
        self.queues.read().await.get(id).cloned()
    }

    /// Destroy and forget a queue. Returns whether it existed.
    pub async fn destroy_queue(&self, id: &str) -> bool {
        let removed = self.queues.write().await.remove(id);
        match removed {
            Some(queue) => {
                queue.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Ids of all queues, sorted.
    pub async fn all(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.queues.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Destroy every queue.
    pub async fn destroy_all(&self) {
        let queues: Vec<_> = self.queues.write().await.drain().collect();
        for (_, queue) in queues {
            queue.destroy().await;
        }
    }

    /// Statistics summed over every queue.
    pub async fn global_stats(&self) -> GlobalQueueStats {
        let queues: Vec<_> = self.queues.read().await.values().cloned().collect();
        let mut global = GlobalQueueStats {
            queues: queues.len(),
            ..Default::default()
        };
        let mut weighted = Duration::ZERO;

        for queue in queues {
            let stats = queue.stats().await;
            global.total += stats.total;
            global.pending += stats.pending;
            global.running += stats.running;
            global.completed += stats.completed;
            global.failed += stats.failed;
            global.cancelled += stats.cancelled;
            global.throughput += stats.throughput;
            weighted += stats.average_execution_time * stats.completed as u32;
        }

        if global.completed > 0 {
            global.average_execution_time = weighted / global.completed as u32;
        }
        global
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn factory() -> QueueFactory {
        QueueFactory::new(EventBus::new(), ExecutorConfig::default())
    }

    #[tokio::test]
    async fn test_factory_create_and_get() {
        let factory = factory();
        let queue = factory
            .create("a", QueueConfig::of_kind(QueueKind::Priority))
            .await
            .unwrap();
        assert_eq!(queue.kind(), QueueKind::Priority);
        assert!(factory.get("a").await.is_some());
        assert_eq!(factory.all().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_factory_replaces_existing_queue() {
        let factory = factory();
        let first = factory.create("a", QueueConfig::default()).await.unwrap();
        factory
            .create("a", QueueConfig::of_kind(QueueKind::Circular))
            .await
            .unwrap();

        let task = Task::from_fn(|_| async { Ok(Value::Null) });
        assert!(matches!(
            first.push(task).await,
            Err(LaunchError::Destroyed)
        ));
        assert_eq!(
            factory.get("a").await.map(|q| q.kind()),
            Some(QueueKind::Circular)
        );
    }

    #[tokio::test]
    async fn test_factory_rejects_invalid_config() {
        let factory = factory();
        let result = factory
            .create("bad", QueueConfig::default().with_concurrency(0))
            .await;
        assert!(matches!(result, Err(LaunchError::ConfigError { .. })));
    }

    #[tokio::test]
    async fn test_global_stats_and_destroy() {
        let factory = factory();
        let a = factory.create("a", QueueConfig::default()).await.unwrap();
        let b = factory.create("b", QueueConfig::default()).await.unwrap();
        a.push(Task::from_fn(|_| async { Ok(Value::Null) })).await.unwrap();
        b.push(Task::from_fn(|_| async { Ok(Value::Null) })).await.unwrap();
        b.push(Task::from_fn(|_| async { Ok(Value::Null) })).await.unwrap();

        let global = factory.global_stats().await;
        assert_eq!(global.queues, 2);
        assert_eq!(global.total, 3);
        assert_eq!(global.pending, 3);

        assert!(factory.destroy_queue("a").await);
        assert!(!factory.destroy_queue("a").await);
        factory.destroy_all().await;
        assert!(factory.all().await.is_empty());
    }
}
