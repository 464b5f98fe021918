use async_trait::async_trait;
use launchq::config::{
    BackoffStrategy, ConcurrencyConfig, ConcurrencyStrategy, ExecutionMode, LaunchConfig,
    ResourceLimits, RetryConfig, SchedulerConfig,
};
use launchq::core::concurrency::ConcurrencyTarget;
use launchq::core::dead_letter::{categorize, is_reprocessable};
use launchq::core::retry::base_delay;
use launchq::core::scheduler::ExecutionPath;
use launchq::core::{
    ConcurrencyController, DeadLetterReason, ErrorCategory, ResourceUsage, StaticProbe,
    TaskScheduler,
};
use launchq::error::{LaunchError, LaunchResult, RejectReason, TaskFailure};
use launchq::events::{Event, EventBus, SchedulerEvent};
use launchq::store::MemoryStore;
use launchq::{LaunchRuntime, Task};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_test::{assert_err, assert_ok};

fn runtime() -> LaunchRuntime {
    LaunchRuntime::with_parts(
        LaunchConfig::testing(),
        Arc::new(StaticProbe::new(ResourceUsage::default())),
        Arc::new(MemoryStore::new()),
    )
    .unwrap()
}

fn always_failing(message: &'static str, runs: Arc<AtomicU32>) -> Task {
    Task::from_fn(move |_| {
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Err(LaunchError::failure(message))
        }
    })
}

#[tokio::test]
async fn mixed_mode_routes_by_priority_and_completes_everything() {
    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let scheduler = TaskScheduler::new(
        "mixed",
        SchedulerConfig::default()
            .with_mode(ExecutionMode::Mixed)
            .with_max_concurrency(3)
            .without_rate_limit(),
        LaunchConfig::testing().executor,
        bus.clone(),
    )
    .await
    .unwrap();
    scheduler.start().await.unwrap();

    for priority in [1, 9, 5, 2, 8] {
        let task = Task::from_fn(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Value::Null)
        })
        .with_id(format!("p{}", priority))
        .with_priority(priority);
        assert_ok!(scheduler.schedule(task).await);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut paths = HashMap::new();
    loop {
        match events.try_recv() {
            Ok(Event::Scheduler(SchedulerEvent::TaskScheduled { task_id, path, .. })) => {
                paths.insert(task_id, path);
            }
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    assert_eq!(paths["p9"], ExecutionPath::Parallel);
    assert_eq!(paths["p8"], ExecutionPath::Parallel);
    assert_eq!(paths["p1"], ExecutionPath::Serial);
    assert_eq!(paths["p2"], ExecutionPath::Serial);

    let stats = scheduler.stats().await;
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.failed, 0);
    scheduler.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn network_failure_is_retried_then_dead_lettered() {
    let runtime = runtime();
    runtime.start().await.unwrap();
    let scheduler = runtime.create_scheduler("plugins", None).await.unwrap();
    let runs = Arc::new(AtomicU32::new(0));

    scheduler
        .schedule(
            always_failing("ECONNRESET", Arc::clone(&runs))
                .with_id("flaky")
                .with_max_retries(2),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    let entry = runtime.dead_letter().get_task("flaky").await.unwrap();
    assert_eq!(entry.reason, DeadLetterReason::MaxRetriesExceeded);
    assert_eq!(entry.category, ErrorCategory::Temporary);
    assert_eq!(entry.reprocess_count, 0);
    assert!(entry.can_reprocess);
    assert_eq!(entry.error_history.len(), 3);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn unauthorized_failure_is_never_retried() {
    let runtime = runtime();
    runtime.start().await.unwrap();
    let scheduler = runtime.create_scheduler("plugins", None).await.unwrap();
    let runs = Arc::new(AtomicU32::new(0));

    scheduler
        .schedule(
            always_failing("401 unauthorized", Arc::clone(&runs))
                .with_id("denied")
                .with_max_retries(5),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(runtime.retry().stats().await.total_retries, 0);
    let entry = runtime.dead_letter().get_task("denied").await.unwrap();
    assert_eq!(entry.reason, DeadLetterReason::UserError);
    assert!(!entry.can_reprocess);
    runtime.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn rate_limit_window_rejects_then_recovers() {
    let scheduler = TaskScheduler::new(
        "limited",
        SchedulerConfig::default().with_rate_limit(5_000, 3),
        LaunchConfig::testing().executor,
        EventBus::new(),
    )
    .await
    .unwrap();
    scheduler.start().await.unwrap();
    let noop = || Task::from_fn(|_| async { Ok(Value::Null) });

    for _ in 0..3 {
        assert_ok!(scheduler.schedule(noop()).await);
    }
    let rejected = assert_err!(scheduler.schedule(noop()).await);
    assert!(matches!(
        rejected,
        LaunchError::ScheduleRejected {
            reason: RejectReason::RateLimited,
            ..
        }
    ));
    assert_eq!(scheduler.stats().await.rejected, 1);

    tokio::time::advance(Duration::from_millis(5_000)).await;
    assert_ok!(scheduler.schedule(noop()).await);
    scheduler.destroy().await;
}

#[test]
fn dead_letter_categorization() {
    let reason = DeadLetterReason::MaxRetriesExceeded;
    let category = categorize(reason, &TaskFailure::execution("ECONNRESET network error"));
    assert_eq!(category, ErrorCategory::Temporary);
    assert!(is_reprocessable(reason, category));

    let reason = DeadLetterReason::ValidationFailed;
    let category = categorize(reason, &TaskFailure::execution("invalid manifest"));
    assert_eq!(category, ErrorCategory::Permanent);
    assert!(!is_reprocessable(reason, category));
}

#[test]
fn exponential_backoff_without_jitter() {
    let config = RetryConfig {
        strategy: BackoffStrategy::Exponential,
        max_retries: 5,
        base_delay_ms: 100,
        max_delay_ms: 1_000,
        multiplier: 2.0,
        jitter: 0.0,
        ..Default::default()
    };
    let delays: Vec<u64> = (1..=config.max_retries)
        .map(|attempt| base_delay(&config, attempt, None).as_millis() as u64)
        .collect();
    assert_eq!(delays, vec![100, 200, 400, 800, 1_000]);
}

struct BusyTarget {
    active: usize,
    applied: Mutex<Vec<usize>>,
}

#[async_trait]
impl ConcurrencyTarget for BusyTarget {
    fn target_id(&self) -> &str {
        "busy"
    }

    async fn active_tasks(&self) -> usize {
        self.active
    }

    async fn capacity(&self) -> usize {
        self.applied.lock().last().copied().unwrap_or_default()
    }

    async fn apply_concurrency(&self, concurrency: usize) -> LaunchResult<()> {
        self.applied.lock().push(concurrency);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn adaptive_controller_steps_once_per_cooldown() {
    let config = ConcurrencyConfig {
        strategy: ConcurrencyStrategy::Adaptive,
        base_concurrency: 10,
        min_concurrency: 1,
        max_concurrency: 20,
        resources: ResourceLimits {
            enable_auto_adjustment: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let cooldown = config.cooldown();
    let controller = ConcurrencyController::new(
        "adaptive",
        config,
        Arc::new(StaticProbe::new(ResourceUsage {
            cpu: 20.0,
            memory: 30.0,
            ..Default::default()
        })),
        EventBus::new(),
    )
    .unwrap();
    let target = Arc::new(BusyTarget {
        active: 9,
        applied: Mutex::new(Vec::new()),
    });
    controller.register(target.clone()).await.unwrap();

    assert_eq!(controller.sample_once().await, Some(11));
    assert_eq!(controller.sample_once().await, None);
    assert_eq!(controller.current_concurrency().await, 11);

    tokio::time::advance(cooldown).await;
    assert_eq!(controller.sample_once().await, Some(12));
    assert_eq!(*target.applied.lock(), vec![10, 11, 12]);
    controller.destroy().await;
}
