//! The launchq runtime and its components.
//!
//! [`LaunchRuntime`] wires one event bus, retry handler, dead letter queue,
//! queue monitor and concurrency controller together from a
//! [`LaunchConfig`], and creates schedulers that are registered with the
//! controller. Components never call each other; everything flows through
//! the shared [`EventBus`].

use crate::config::{LaunchConfig, SchedulerConfig};
use crate::error::{LaunchError, LaunchResult};
use crate::events::EventBus;
use crate::queue::QueueFactory;
use crate::store::{DeadLetterStore, FileStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

pub mod concurrency;
pub mod dead_letter;
pub mod executor;
pub mod monitor;
pub mod probe;
pub mod registry;
pub mod retry;
pub mod scheduler;

pub use concurrency::{ConcurrencyController, ConcurrencyTarget};
pub use dead_letter::{DeadLetterQueue, DeadLetterReason, ErrorCategory};
pub use executor::TaskExecutor;
pub use monitor::QueueMonitor;
pub use probe::{ResourceProbe, ResourceUsage, StaticProbe, SystemProbe};
pub use registry::OperationRegistry;
pub use retry::RetryHandler;
pub use scheduler::TaskScheduler;

const RUNTIME_ID: &str = "launchq";

/// The assembled task runtime.
///
/// # Examples
///
/// ```rust,no_run
/// use launchq::prelude::*;
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> LaunchResult<()> {
///     let runtime = LaunchRuntime::new(LaunchConfig::development())?;
///     runtime.start().await?;
///
///     let scheduler = runtime.create_scheduler("plugins", None).await?;
///     scheduler
///         .schedule(Task::from_fn(|ctx| async move { Ok(ctx.payload) }).with_payload(json!(1)))
///         .await?;
///
///     runtime.wait_for_shutdown().await
/// }
/// ```
pub struct LaunchRuntime {
    config: LaunchConfig,
    bus: EventBus,
    registry: OperationRegistry,
    queues: QueueFactory,
    retry: RetryHandler,
    dead_letter: DeadLetterQueue,
    monitor: QueueMonitor,
    controller: ConcurrencyController,
    schedulers: RwLock<HashMap<String, TaskScheduler>>,
    is_running: AtomicBool,
}

impl LaunchRuntime {
    /// Create a runtime sampling the host through [`SystemProbe`] and
    /// persisting dead letters as JSON files under
    /// `dead_letter.persistence_dir`.
    pub fn new(config: LaunchConfig) -> LaunchResult<Self> {
        let store = Arc::new(FileStore::new(config.dead_letter.persistence_dir.clone()));
        Self::with_parts(config, Arc::new(SystemProbe), store)
    }

    /// Create a runtime with an explicit resource probe and dead letter store.
    pub fn with_parts(
        config: LaunchConfig,
        probe: Arc<dyn ResourceProbe>,
        store: Arc<dyn DeadLetterStore>,
    ) -> LaunchResult<Self> {
        config
            .validate()
            .map_err(|errors| LaunchError::config(errors.join("; ")))?;

        let bus = EventBus::new();
        let registry = OperationRegistry::new();
        let queues = QueueFactory::new(bus.clone(), config.executor.clone());
        let retry = RetryHandler::new(
            RUNTIME_ID,
            config.retry.clone(),
            config.executor.clone(),
            bus.clone(),
        );
        let dead_letter = DeadLetterQueue::new(
            RUNTIME_ID,
            config.dead_letter.clone(),
            config.executor.clone(),
            store,
            registry.clone(),
            bus.clone(),
        );
        let monitor = QueueMonitor::new(
            RUNTIME_ID,
            config.monitor.clone(),
            Arc::clone(&probe),
            bus.clone(),
        );
        let controller = ConcurrencyController::new(
            RUNTIME_ID,
            config.concurrency.clone(),
            probe,
            bus.clone(),
        )?;

        Ok(Self {
            config,
            bus,
            registry,
            queues,
            retry,
            dead_letter,
            monitor,
            controller,
            schedulers: RwLock::new(HashMap::new()),
            is_running: AtomicBool::new(false),
        })
    }

    /// Create a runtime whose dead letters live in Redis.
    #[cfg(feature = "redis-store")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-store")))]
    pub async fn with_redis(config: LaunchConfig, connection_string: &str) -> LaunchResult<Self> {
        let store = crate::store::RedisStore::connect(connection_string, RUNTIME_ID).await?;
        Self::with_parts(config, Arc::new(SystemProbe), Arc::new(store))
    }

    /// Start the retry handler, dead letter queue, monitor and controller.
    pub async fn start(&self) -> LaunchResult<()> {
        if self.is_running.swap(true, Ordering::AcqRel) {
            return Err(LaunchError::AlreadyRunning);
        }

        let started = async {
            self.retry.start()?;
            self.dead_letter.start().await?;
            self.monitor.start()?;
            self.controller.start().await
        };
        if let Err(e) = started.await {
            self.is_running.store(false, Ordering::Release);
            return Err(e);
        }

        tracing::info!(
            "🚀 launchq runtime started ({:?} concurrency, base {})",
            self.config.concurrency.strategy,
            self.config.concurrency.base_concurrency
        );
        Ok(())
    }

    /// Create and start a scheduler, register it with the concurrency
    /// controller and keep track of it. `None` uses the configured default.
    ///
    /// The controller applies its current limit on registration, so the
    /// scheduler's `max_concurrency` is overridden by the controller's.
    pub async fn create_scheduler(
        &self,
        id: impl Into<String>,
        config: Option<SchedulerConfig>,
    ) -> LaunchResult<TaskScheduler> {
        if !self.is_running() {
            return Err(LaunchError::NotRunning);
        }
        let id = id.into();
        if self.schedulers.read().await.contains_key(&id) {
            return Err(LaunchError::config(format!("Scheduler '{}' already exists", id)));
        }

        let config = config.unwrap_or_else(|| self.config.scheduler.clone());
        let scheduler =
            TaskScheduler::new(id.clone(), config, self.config.executor.clone(), self.bus.clone())
                .await?;
        self.controller
            .register(Arc::new(scheduler.clone()))
            .await?;
        scheduler.start().await?;

        self.schedulers
            .write()
            .await
            .insert(id, scheduler.clone());
        Ok(scheduler)
    }

    pub async fn scheduler(&self, id: &str) -> Option<TaskScheduler> {
        self.schedulers.read().await.get(id).cloned()
    }

    /// Ids of all schedulers, sorted.
    pub async fn schedulers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.schedulers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Unregister and destroy a scheduler. Returns whether it existed.
    pub async fn remove_scheduler(&self, id: &str) -> bool {
        let removed = self.schedulers.write().await.remove(id);
        let Some(scheduler) = removed else {
            return false;
        };
        self.controller.unregister(id).await;
        scheduler.destroy().await;
        true
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Operations used to rebuild dead letters loaded from the store.
    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    /// Standalone named queues.
    pub fn queues(&self) -> &QueueFactory {
        &self.queues
    }

    pub fn retry(&self) -> &RetryHandler {
        &self.retry
    }

    pub fn dead_letter(&self) -> &DeadLetterQueue {
        &self.dead_letter
    }

    pub fn monitor(&self) -> &QueueMonitor {
        &self.monitor
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Destroy every component. All timers are cancelled and the dead
    /// letter queue saves a final snapshot.
    pub async fn shutdown(&self) -> LaunchResult<()> {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return Err(LaunchError::NotRunning);
        }
        tracing::info!("🚀 Shutting down launchq runtime...");

        let schedulers: Vec<TaskScheduler> = self
            .schedulers
            .write()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for scheduler in schedulers {
            scheduler.destroy().await;
        }
        self.controller.destroy().await;
        self.queues.destroy_all().await;
        self.retry.destroy().await;
        self.dead_letter.destroy().await;
        self.monitor.destroy();
        self.bus.destroy();

        tracing::info!("🚀 launchq runtime stopped");
        Ok(())
    }

    /// Block until Ctrl+C, then shut down.
    pub async fn wait_for_shutdown(&self) -> LaunchResult<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        self.shutdown().await
    }
}

impl Drop for LaunchRuntime {
    fn drop(&mut self) {
        if self.is_running() {
            tracing::warn!(
                "🚀 launchq runtime dropped while running. Call shutdown() explicitly to persist dead letters and stop timers."
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionMode;
    use crate::store::MemoryStore;
    use crate::task::Task;
    use serde_json::Value;
    use std::time::Duration;

    fn runtime(config: LaunchConfig) -> LaunchRuntime {
        LaunchRuntime::with_parts(
            config,
            Arc::new(StaticProbe::new(ResourceUsage::default())),
            Arc::new(MemoryStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_runtime_lifecycle() {
        let runtime = runtime(LaunchConfig::testing());
        assert!(!runtime.is_running());
        assert!(matches!(
            runtime.create_scheduler("early", None).await,
            Err(LaunchError::NotRunning)
        ));

        runtime.start().await.unwrap();
        assert!(runtime.is_running());
        assert!(matches!(runtime.start().await, Err(LaunchError::AlreadyRunning)));

        runtime.shutdown().await.unwrap();
        assert!(!runtime.is_running());
        assert!(runtime.bus().is_destroyed());
        assert!(matches!(runtime.shutdown().await, Err(LaunchError::NotRunning)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = LaunchConfig::testing();
        config.concurrency.min_concurrency = 0;
        assert!(
            LaunchRuntime::with_parts(
                config,
                Arc::new(StaticProbe::default()),
                Arc::new(MemoryStore::new()),
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn test_schedulers_are_registered_with_controller() {
        let mut config = LaunchConfig::testing();
        config.concurrency.base_concurrency = 3;
        config.concurrency.max_concurrency = 3;
        let runtime = runtime(config);
        runtime.start().await.unwrap();

        let scheduler = runtime
            .create_scheduler(
                "plugins",
                Some(SchedulerConfig::default().with_mode(ExecutionMode::Parallel).with_max_concurrency(1)),
            )
            .await
            .unwrap();
        assert!(scheduler.is_running());
        assert_eq!(scheduler.config().await.max_concurrency, 3);
        assert_eq!(runtime.controller().targets().await, vec!["plugins".to_string()]);
        assert!(runtime.create_scheduler("plugins", None).await.is_err());

        scheduler
            .schedule(Task::from_fn(|_| async { Ok(Value::Null) }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.stats().await.completed, 1);

        assert!(runtime.remove_scheduler("plugins").await);
        assert!(runtime.controller().targets().await.is_empty());
        assert!(runtime.schedulers().await.is_empty());
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_flow_to_dead_letter_queue() {
        let runtime = runtime(LaunchConfig::testing());
        runtime.start().await.unwrap();
        let scheduler = runtime.create_scheduler("s", None).await.unwrap();

        let task = Task::from_fn(|_| async { Err(LaunchError::failure("ECONNRESET")) })
            .with_id("doomed")
            .with_max_retries(1);
        scheduler.schedule(task).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let entry = runtime.dead_letter().get_task("doomed").await.unwrap();
        assert_eq!(entry.reason, DeadLetterReason::MaxRetriesExceeded);
        assert_eq!(entry.error_history.len(), 2);
        assert!(runtime.monitor().metrics("s").is_some());
        runtime.shutdown().await.unwrap();
    }
}
