//! In-process event bus.
//!
//! Every component reports its lifecycle through [`Event`]s published on a
//! shared [`EventBus`]. Components never hold references to each other; the
//! retry handler, dead letter queue and queue monitor only react to what they
//! receive here.
//!
//! Two ways of consuming events are offered:
//!
//! - [`EventBus::subscribe`] hands out a `tokio::sync::broadcast` receiver.
//!   Components use this from a spawned loop.
//! - [`EventBus::on`] registers a synchronous callback that runs inside
//!   `publish`, in registration order. Callbacks must be cheap and must not
//!   block.
//!
//! # Examples
//!
//! ```rust
//! use launchq::events::{Event, EventBus, EventFilter, SchedulerEvent, Topic};
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//! bus.on(EventFilter::Topic(Topic::Scheduler), move |_event| {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! bus.publish(Event::Scheduler(SchedulerEvent::Started {
//!     scheduler_id: "main".into(),
//! }));
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use crate::config::ExecutionMode;
use crate::core::dead_letter::{DeadLetterReason, ErrorAnalysis, ErrorCategory};
use crate::core::monitor::{MonitoringAlert, MonitoringReport};
use crate::core::retry::ErrorRecord;
use crate::core::scheduler::ExecutionPath;
use crate::error::TaskFailure;
use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default number of events kept in the history.
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// Event group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Queue and executor lifecycle
    Queue,
    /// Scheduler lifecycle
    Scheduler,
    /// Retry handler decisions
    Retry,
    /// Dead letter queue activity
    DeadLetter,
    /// Monitor alerts and reports
    Monitor,
    /// Concurrency controller adjustments
    Concurrency,
}

impl Topic {
    /// Prefix used in event names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Scheduler => "scheduler",
            Self::Retry => "retry",
            Self::DeadLetter => "deadLetter",
            Self::Monitor => "monitor",
            Self::Concurrency => "concurrency",
        }
    }
}

/// Events emitted by queues and executors. `source` names the queue or
/// executor group that ran the task.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A task entered a queue
    TaskAdded {
        queue_id: String,
        task_id: TaskId,
        priority: i32,
    },
    /// An executor started running a task
    TaskStarted { source: String, task_id: TaskId },
    /// A task finished successfully
    TaskCompleted {
        source: String,
        task_id: TaskId,
        result: Value,
        duration: Duration,
    },
    /// A task failed or timed out; carries the task for retry decisions
    TaskFailed {
        source: String,
        task: Task,
        failure: TaskFailure,
        duration: Duration,
    },
    /// A task was cancelled before or during execution
    TaskCancelled {
        source: String,
        task_id: TaskId,
        /// Whether the task had started running
        was_started: bool,
    },
    /// A queue was started or stopped
    StateChanged { queue_id: String, running: bool },
}

/// Events emitted by schedulers.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Initialized {
        scheduler_id: String,
        mode: ExecutionMode,
    },
    Started {
        scheduler_id: String,
    },
    Stopped {
        scheduler_id: String,
    },
    TaskScheduled {
        scheduler_id: String,
        task_id: TaskId,
        priority: i32,
        path: ExecutionPath,
    },
    TaskCompleted {
        scheduler_id: String,
        task_id: TaskId,
        duration: Duration,
    },
    TaskFailed {
        scheduler_id: String,
        task_id: TaskId,
        failure: TaskFailure,
    },
    TaskCancelled {
        scheduler_id: String,
        task_id: TaskId,
    },
    AllTasksCancelled {
        scheduler_id: String,
        count: usize,
    },
    RateLimitExceeded {
        scheduler_id: String,
        max_tasks: u32,
        window_ms: u64,
    },
    ModeChanged {
        scheduler_id: String,
        from: ExecutionMode,
        to: ExecutionMode,
    },
    ConfigUpdated {
        scheduler_id: String,
    },
    Destroyed {
        scheduler_id: String,
    },
}

/// Events emitted by the retry handler.
#[derive(Debug, Clone)]
pub enum RetryEvent {
    /// A retry timer was armed
    TaskScheduled {
        task_id: TaskId,
        attempt: u32,
        delay: Duration,
    },
    /// A retry timer fired; schedulers pick the task up from here
    TaskStarted { task: Task, attempt: u32 },
    /// Retries are over; the dead letter queue picks the task up from here
    TaskFinallyFailed {
        task: Task,
        reason: DeadLetterReason,
        error_history: Vec<ErrorRecord>,
        final_error: TaskFailure,
        total_attempts: u32,
    },
    TaskSucceededAfterRetry {
        task_id: TaskId,
        attempts: u32,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    StatsReset,
    ConfigUpdated,
}

/// Events emitted by the dead letter queue.
#[derive(Debug, Clone)]
pub enum DeadLetterEvent {
    TaskAdded {
        task_id: TaskId,
        reason: DeadLetterReason,
        category: ErrorCategory,
    },
    /// A dead task was resubmitted; schedulers pick it up from here
    TaskReprocessed {
        task: Task,
        reprocess_count: u32,
    },
    ReprocessFailed {
        task_id: TaskId,
        error: String,
    },
    /// A reprocessed task completed and left the queue
    TaskRecovered {
        task_id: TaskId,
    },
    TasksExpired {
        task_ids: Vec<TaskId>,
    },
    BatchReprocessed {
        category: ErrorCategory,
        succeeded: usize,
        failed: usize,
    },
    AnalysisCompleted {
        analysis: Arc<ErrorAnalysis>,
    },
    QueueCleared {
        count: usize,
    },
}

/// Events emitted by the queue monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    AlertTriggered { alert: MonitoringAlert },
    AlertAcknowledged { alert_id: String },
    ReportGenerated { report: Arc<MonitoringReport> },
    MetricsCollected { sources: usize },
}

/// Events emitted by the concurrency controller.
#[derive(Debug, Clone)]
pub enum ConcurrencyEvent {
    Adjusted {
        from: usize,
        to: usize,
        reason: String,
    },
    SchedulerRegistered {
        scheduler_id: String,
    },
    SchedulerUnregistered {
        scheduler_id: String,
    },
}

/// Any event published on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    Queue(QueueEvent),
    Scheduler(SchedulerEvent),
    Retry(RetryEvent),
    DeadLetter(DeadLetterEvent),
    Monitor(MonitorEvent),
    Concurrency(ConcurrencyEvent),
}

impl Event {
    /// Topic of the event.
    pub fn topic(&self) -> Topic {
        match self {
            Self::Queue(_) => Topic::Queue,
            Self::Scheduler(_) => Topic::Scheduler,
            Self::Retry(_) => Topic::Retry,
            Self::DeadLetter(_) => Topic::DeadLetter,
            Self::Monitor(_) => Topic::Monitor,
            Self::Concurrency(_) => Topic::Concurrency,
        }
    }

    /// Stable `topic:eventName` identifier.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Queue(e) => match e {
                QueueEvent::TaskAdded { .. } => "queue:taskAdded",
                QueueEvent::TaskStarted { .. } => "queue:taskStarted",
                QueueEvent::TaskCompleted { .. } => "queue:taskCompleted",
                QueueEvent::TaskFailed { .. } => "queue:taskFailed",
                QueueEvent::TaskCancelled { .. } => "queue:taskCancelled",
                QueueEvent::StateChanged { .. } => "queue:stateChanged",
            },
            Self::Scheduler(e) => match e {
                SchedulerEvent::Initialized { .. } => "scheduler:initialized",
                SchedulerEvent::Started { .. } => "scheduler:started",
                SchedulerEvent::Stopped { .. } => "scheduler:stopped",
                SchedulerEvent::TaskScheduled { .. } => "scheduler:taskScheduled",
                SchedulerEvent::TaskCompleted { .. } => "scheduler:taskCompleted",
                SchedulerEvent::TaskFailed { .. } => "scheduler:taskFailed",
                SchedulerEvent::TaskCancelled { .. } => "scheduler:taskCancelled",
                SchedulerEvent::AllTasksCancelled { .. } => "scheduler:allTasksCancelled",
                SchedulerEvent::RateLimitExceeded { .. } => "scheduler:rateLimitExceeded",
                SchedulerEvent::ModeChanged { .. } => "scheduler:modeChanged",
                SchedulerEvent::ConfigUpdated { .. } => "scheduler:configUpdated",
                SchedulerEvent::Destroyed { .. } => "scheduler:destroyed",
            },
            Self::Retry(e) => match e {
                RetryEvent::TaskScheduled { .. } => "retry:taskScheduled",
                RetryEvent::TaskStarted { .. } => "retry:taskStarted",
                RetryEvent::TaskFinallyFailed { .. } => "retry:taskFinallyFailed",
                RetryEvent::TaskSucceededAfterRetry { .. } => "retry:taskSucceededAfterRetry",
                RetryEvent::TaskCancelled { .. } => "retry:taskCancelled",
                RetryEvent::StatsReset => "retry:statsReset",
                RetryEvent::ConfigUpdated => "retry:configUpdated",
            },
            Self::DeadLetter(e) => match e {
                DeadLetterEvent::TaskAdded { .. } => "deadLetter:taskAdded",
                DeadLetterEvent::TaskReprocessed { .. } => "deadLetter:taskReprocessed",
                DeadLetterEvent::ReprocessFailed { .. } => "deadLetter:reprocessFailed",
                DeadLetterEvent::TaskRecovered { .. } => "deadLetter:taskRecovered",
                DeadLetterEvent::TasksExpired { .. } => "deadLetter:tasksExpired",
                DeadLetterEvent::BatchReprocessed { .. } => "deadLetter:batchReprocessed",
                DeadLetterEvent::AnalysisCompleted { .. } => "deadLetter:analysisCompleted",
                DeadLetterEvent::QueueCleared { .. } => "deadLetter:queueCleared",
            },
            Self::Monitor(e) => match e {
                MonitorEvent::AlertTriggered { .. } => "monitor:alertTriggered",
                MonitorEvent::AlertAcknowledged { .. } => "monitor:alertAcknowledged",
                MonitorEvent::ReportGenerated { .. } => "monitor:reportGenerated",
                MonitorEvent::MetricsCollected { .. } => "monitor:metricsCollected",
            },
            Self::Concurrency(e) => match e {
                ConcurrencyEvent::Adjusted { .. } => "concurrency:adjusted",
                ConcurrencyEvent::SchedulerRegistered { .. } => "concurrency:schedulerRegistered",
                ConcurrencyEvent::SchedulerUnregistered { .. } => {
                    "concurrency:schedulerUnregistered"
                }
            },
        }
    }
}

/// Selects which events a listener or history query sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    /// Every event
    All,
    /// Every event of one topic
    Topic(Topic),
    /// One event name, e.g. `queue:taskAdded`
    Name(String),
}

impl EventFilter {
    /// Filter on a single event name.
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    /// Whether `event` passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Topic(topic) => event.topic() == *topic,
            Self::Name(name) => event.name() == name,
        }
    }
}

impl From<Topic> for EventFilter {
    fn from(topic: Topic) -> Self {
        Self::Topic(topic)
    }
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Listener {
    filter: EventFilter,
    handler: Handler,
}

/// An event together with the time it was published.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// The event
    pub event: Event,
    /// Publication time
    pub published_at: DateTime<Utc>,
}

struct BusInner {
    sender: broadcast::Sender<Event>,
    listeners: RwLock<Vec<Listener>>,
    history: Mutex<VecDeque<EventRecord>>,
    max_history: usize,
    destroyed: AtomicBool,
}

/// Shared publish/subscribe hub. Cloning is cheap and every clone publishes
/// to the same subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with default channel capacity and history size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY, DEFAULT_HISTORY_SIZE)
    }

    /// Create a bus with explicit channel capacity and history size.
    pub fn with_capacity(channel_capacity: usize, max_history: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                listeners: RwLock::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(max_history)),
                max_history,
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish an event to listeners and subscribers.
    pub fn publish(&self, event: Event) {
        if self.is_destroyed() {
            tracing::debug!(event = event.name(), "Event bus destroyed, dropping event");
            return;
        }

        {
            let mut history = self.inner.history.lock();
            if history.len() >= self.inner.max_history {
                history.pop_front();
            }
            if self.inner.max_history > 0 {
                history.push_back(EventRecord {
                    event: event.clone(),
                    published_at: Utc::now(),
                });
            }
        }

        let handlers: Vec<Handler> = self
            .inner
            .listeners
            .read()
            .iter()
            .filter(|l| l.filter.matches(&event))
            .map(|l| Arc::clone(&l.handler))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::error!(event = event.name(), "Event listener panicked");
            }
        }

        // No receivers is not an error
        let _ = self.inner.sender.send(event);
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.sender.subscribe()
    }

    /// Register a callback listener for the events passing `filter`.
    pub fn on(
        &self,
        filter: impl Into<EventFilter>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) {
        self.inner.listeners.write().push(Listener {
            filter: filter.into(),
            handler: Arc::new(handler),
        });
    }

    /// Recent events matching `filter`, newest first.
    pub fn history(&self, filter: &EventFilter, limit: Option<usize>) -> Vec<EventRecord> {
        let history = self.inner.history.lock();
        history
            .iter()
            .rev()
            .filter(|r| filter.matches(&r.event))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Whether [`destroy`](Self::destroy) was called.
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Drop all listeners and history; later publishes are ignored.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.listeners.write().clear();
        self.inner.history.lock().clear();
        tracing::info!("📣 Event bus destroyed");
    }
}

/// Receive the next event, skipping over lag. Returns `None` when the channel
/// is closed.
pub async fn next_event(receiver: &mut broadcast::Receiver<Event>) -> Option<Event> {
    loop {
        match receiver.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event subscriber lagged behind");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started(id: &str) -> Event {
        Event::Scheduler(SchedulerEvent::Started {
            scheduler_id: id.to_string(),
        })
    }

    fn added(task: &str) -> Event {
        Event::Queue(QueueEvent::TaskAdded {
            queue_id: "q".into(),
            task_id: task.into(),
            priority: 0,
        })
    }

    #[test]
    fn test_event_names() {
        assert_eq!(added("t").name(), "queue:taskAdded");
        assert_eq!(started("s").name(), "scheduler:started");
        assert_eq!(
            Event::Retry(RetryEvent::StatsReset).name(),
            "retry:statsReset"
        );
        assert_eq!(added("t").topic(), Topic::Queue);
    }

    #[test]
    fn test_listeners_see_filtered_events_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, filter) in [
            ("all", EventFilter::All),
            ("scheduler", EventFilter::Topic(Topic::Scheduler)),
            ("added", EventFilter::name("queue:taskAdded")),
        ] {
            let order = Arc::clone(&order);
            bus.on(filter, move |event| order.lock().push((label, event.name())));
        }

        bus.publish(started("s"));
        bus.publish(added("a"));
        assert_eq!(
            *order.lock(),
            vec![
                ("all", "scheduler:started"),
                ("scheduler", "scheduler:started"),
                ("all", "queue:taskAdded"),
                ("added", "queue:taskAdded"),
            ]
        );
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.on(EventFilter::All, |_| panic!("listener bug"));
        let c = Arc::clone(&count);
        bus.on(EventFilter::All, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(started("s"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_history_is_bounded_and_newest_first() {
        let bus = EventBus::with_capacity(16, 3);
        for i in 0..5 {
            bus.publish(added(&format!("t{}", i)));
        }
        bus.publish(started("s"));

        let all = bus.history(&EventFilter::All, None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event.name(), "scheduler:started");

        let queue_only = bus.history(&EventFilter::Topic(Topic::Queue), Some(1));
        assert_eq!(queue_only.len(), 1);
        match &queue_only[0].event {
            Event::Queue(QueueEvent::TaskAdded { task_id, .. }) => assert_eq!(task_id, "t4"),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.publish(added("a"));
        bus.publish(started("s"));

        assert_eq!(next_event(&mut receiver).await.unwrap().name(), "queue:taskAdded");
        assert_eq!(next_event(&mut receiver).await.unwrap().name(), "scheduler:started");
    }

    #[test]
    fn test_destroyed_bus_ignores_publish() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.on(EventFilter::All, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.destroy();
        bus.publish(started("s"));
        assert!(bus.is_destroyed());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(bus.history(&EventFilter::All, None).is_empty());
    }
}
