//! # launchq
//!
//! Task scheduling and queue management for a plugin launcher.
//!
//! ## Features
//!
//! - **Queues**: FIFO, priority, delayed and circular in-memory queues
//! - **Schedulers**: serial, parallel and mixed execution with rate limiting
//!   and an overflow lane
//! - **Retries**: fixed, linear, exponential or custom backoff with jitter
//! - **Dead letters**: categorized, analyzed, persisted and reprocessable
//! - **Monitoring**: per-queue metrics, health, alerts and reports
//! - **Concurrency control**: fixed, adaptive, resource-based or manual
//!
//! ## Architecture
//!
//! Components share one [`EventBus`](events::EventBus) and never call each
//! other. Queues and schedulers publish what happens to tasks; the
//! [`RetryHandler`](core::RetryHandler) re-arms failed tasks, the
//! [`DeadLetterQueue`](core::DeadLetterQueue) keeps the ones that give up,
//! and the [`QueueMonitor`](core::QueueMonitor) turns the same stream into
//! metrics. [`LaunchRuntime`] assembles all of them.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use launchq::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> LaunchResult<()> {
//!     let config = LaunchConfig::development();
//!     launchq::logging::init(&config.logging);
//!
//!     let runtime = LaunchRuntime::new(config)?;
//!     runtime.start().await?;
//!
//!     let scheduler = runtime.create_scheduler("plugins", None).await?;
//!     scheduler
//!         .schedule(
//!             Task::from_fn(|ctx| async move { Ok(ctx.payload) })
//!                 .with_type("plugin.load")
//!                 .with_payload(json!({ "name": "clipboard" })),
//!         )
//!         .await?;
//!
//!     runtime.wait_for_shutdown().await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod logging;
pub mod queue;
pub mod store;
pub mod task;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::{
        ConcurrencyController, DeadLetterQueue, DeadLetterReason, ErrorCategory, LaunchRuntime,
        OperationRegistry, QueueMonitor, ResourceProbe, ResourceUsage, RetryHandler,
        TaskScheduler,
    };
    pub use crate::error::{FailureKind, LaunchError, LaunchResult, TaskFailure};
    pub use crate::events::{Event, EventBus, EventFilter, Topic};
    pub use crate::queue::{QueueFactory, TaskQueue};
    pub use crate::store::{DeadLetterStore, FileStore, MemoryStore};
    pub use crate::task::{Task, TaskContext, TaskId, TaskOperation, TaskState};
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::MetricsExporter;
}

pub use crate::config::LaunchConfig;
pub use crate::core::LaunchRuntime;
pub use crate::error::{LaunchError, LaunchResult};
pub use crate::task::{Task, TaskId};
