//! Configuration types for launchq.
//!
//! Every component takes its own configuration section. [`LaunchConfig`]
//! aggregates them for the [`LaunchRuntime`](crate::LaunchRuntime)
//! and offers environment presets plus validation.
//!
//! Durations are stored in milliseconds (`*_ms` fields) so that configs
//! round-trip cleanly through JSON; accessor methods hand out [`Duration`]s.
//!
//! # Examples
//!
//! ```rust
//! use launchq::config::{ExecutionMode, LaunchConfig, SchedulerConfig};
//!
//! let config = LaunchConfig {
//!     scheduler: SchedulerConfig::default()
//!         .with_mode(ExecutionMode::Mixed)
//!         .with_max_concurrency(8),
//!     ..LaunchConfig::development()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::error::{LaunchError, LaunchResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Aggregate configuration for a full launchq runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Executor defaults shared by every executor the runtime creates
    pub executor: ExecutorConfig,
    /// Default scheduler configuration
    pub scheduler: SchedulerConfig,
    /// Concurrency controller configuration
    pub concurrency: ConcurrencyConfig,
    /// Retry handler configuration
    pub retry: RetryConfig,
    /// Dead letter queue configuration
    pub dead_letter: DeadLetterConfig,
    /// Queue monitor configuration
    pub monitor: MonitorConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Task executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout applied when a task carries none (in milliseconds)
    pub default_timeout_ms: u64,
    /// Track the memory estimate of running payloads
    pub enable_resource_monitoring: bool,
    /// Memory ceiling in bytes above which the executor reports unhealthy
    pub max_memory_bytes: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 10_000,
            enable_resource_monitoring: true,
            max_memory_bytes: None,
        }
    }
}

impl ExecutorConfig {
    /// Default timeout as a [`Duration`].
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Set the default timeout.
    pub fn with_default_timeout(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    /// Set the memory ceiling.
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }
}

/// Ordering and eviction policy of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    /// Strict append order
    Fifo,
    /// Highest priority first, stable for ties
    Priority,
    /// Tasks become visible after the `delay` carried in their metadata
    Delayed,
    /// Fixed capacity, evicting the oldest pending task when full
    Circular,
}

impl QueueKind {
    /// Lowercase name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fifo => "fifo",
            Self::Priority => "priority",
            Self::Delayed => "delayed",
            Self::Circular => "circular",
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Ordering policy
    pub kind: QueueKind,
    /// Number of tasks the queue runs at once
    pub concurrency: usize,
    /// Start dispatching as soon as the queue is created
    pub autostart: bool,
    /// Default timeout handed to the queue's executors (in milliseconds)
    pub timeout_ms: u64,
    /// Capacity of a circular queue
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            kind: QueueKind::Fifo,
            concurrency: 1,
            autostart: false,
            timeout_ms: 30_000,
            capacity: 100,
        }
    }
}

impl QueueConfig {
    /// Configuration for a queue of the given kind.
    pub fn of_kind(kind: QueueKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    /// Set the concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the circular capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Start dispatching on creation.
    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    /// Executor timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Execution topology of a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One single-concurrency queue, strict global ordering
    Serial,
    /// Executor pool with a priority queue as fallback
    Parallel,
    /// Priority-driven routing between a serial lane and the pool
    Mixed,
}

impl ExecutionMode {
    /// Lowercase name of the mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::Parallel => "parallel",
            Self::Mixed => "mixed",
        }
    }
}

/// Fixed-window rate limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length (in milliseconds)
    pub window_ms: u64,
    /// Maximum number of tasks accepted per window
    pub max_tasks: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_tasks: 100,
        }
    }
}

impl RateLimitConfig {
    /// Window length as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Task scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Execution topology
    pub mode: ExecutionMode,
    /// Size of the executor pool and of the parallel fallback queue
    pub max_concurrency: usize,
    /// Optional rate limit applied at schedule time
    pub rate_limit: Option<RateLimitConfig>,
    /// Cancel in-flight work on `cancel`, `cancel_all` and mode switches
    pub enable_cancellation: bool,
    /// Template for the serial lane. The pool's overflow lane is always a
    /// priority queue, so a delayed kind is only accepted in serial mode.
    pub queue: QueueConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Parallel,
            max_concurrency: 5,
            rate_limit: Some(RateLimitConfig::default()),
            enable_cancellation: true,
            queue: QueueConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Set the execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the maximum concurrency.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set the rate limit.
    pub fn with_rate_limit(mut self, window_ms: u64, max_tasks: u32) -> Self {
        self.rate_limit = Some(RateLimitConfig {
            window_ms,
            max_tasks,
        });
        self
    }

    /// Remove the rate limit.
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_concurrency == 0 {
            errors.push("Scheduler max concurrency must be greater than 0".to_string());
        }

        if let Some(limit) = &self.rate_limit {
            if limit.window_ms == 0 {
                errors.push("Rate limit window must be greater than 0".to_string());
            }
            if limit.max_tasks == 0 {
                errors.push("Rate limit task cap must be greater than 0".to_string());
            }
        }

        if self.queue.timeout_ms == 0 {
            errors.push("Queue timeout must be greater than 0".to_string());
        }
        if self.queue.kind == QueueKind::Circular {
            errors.push("Scheduler lanes cannot use a circular queue".to_string());
        }
        if self.queue.kind == QueueKind::Delayed && self.mode != ExecutionMode::Serial {
            errors.push("A delayed queue is only supported in serial mode".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Strategy used by the concurrency controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyStrategy {
    /// No automatic adjustment
    Fixed,
    /// Utilization-driven stepping with cooldown
    Adaptive,
    /// Resource-driven shrinking and growing
    Resource,
    /// Manual adjustment only
    Priority,
}

/// Resource ceilings, in percent, used by the concurrency controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory usage the adaptive strategy must stay under to grow
    pub memory_threshold: f64,
    /// CPU usage the adaptive strategy must stay under to grow
    pub cpu_threshold: f64,
    /// Memory usage above which the resource strategy shrinks
    pub memory_critical: f64,
    /// CPU usage above which the resource strategy shrinks
    pub cpu_critical: f64,
    /// Sampling interval (in milliseconds)
    pub check_interval_ms: u64,
    /// Run the sampling loop at all
    pub enable_auto_adjustment: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_threshold: 80.0,
            cpu_threshold: 70.0,
            memory_critical: 95.0,
            cpu_critical: 90.0,
            check_interval_ms: 5_000,
            enable_auto_adjustment: true,
        }
    }
}

/// Adaptive strategy tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveParams {
    /// Concurrency change per adjustment
    pub step: usize,
    /// Utilization above which concurrency grows; below half of it, it shrinks
    pub threshold: f64,
    /// Minimum time between two automatic adjustments (in milliseconds)
    pub cooldown_ms: u64,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            step: 1,
            threshold: 0.8,
            cooldown_ms: 10_000,
        }
    }
}

/// Concurrency controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Adjustment strategy
    pub strategy: ConcurrencyStrategy,
    /// Initial concurrency applied to registered schedulers
    pub base_concurrency: usize,
    /// Lower bound
    pub min_concurrency: usize,
    /// Upper bound
    pub max_concurrency: usize,
    /// Resource ceilings and sampling
    pub resources: ResourceLimits,
    /// Adaptive tuning
    pub adaptive: AdaptiveParams,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            strategy: ConcurrencyStrategy::Adaptive,
            base_concurrency: 5,
            min_concurrency: 1,
            max_concurrency: 20,
            resources: ResourceLimits::default(),
            adaptive: AdaptiveParams::default(),
        }
    }
}

impl ConcurrencyConfig {
    /// Sampling interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.resources.check_interval_ms)
    }

    /// Cooldown as a [`Duration`].
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.adaptive.cooldown_ms)
    }

    /// Clamp a concurrency value into `[min, max]`.
    pub fn clamp(&self, value: usize) -> usize {
        value.clamp(self.min_concurrency, self.max_concurrency)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base`
    Fixed,
    /// `base * attempt * multiplier`
    Linear,
    /// `base * multiplier^(attempt - 1)`
    Exponential,
    /// Caller-supplied delay function
    Custom,
}

/// Retry handler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry failed tasks at all
    pub enable_retry: bool,
    /// Delay strategy
    pub strategy: BackoffStrategy,
    /// Retries allowed when a task does not carry its own limit
    pub max_retries: u32,
    /// Base delay (in milliseconds)
    pub base_delay_ms: u64,
    /// Delay ceiling (in milliseconds)
    pub max_delay_ms: u64,
    /// Growth factor for linear and exponential strategies
    pub multiplier: f64,
    /// Symmetric jitter as a fraction of the computed delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enable_retry: true,
            strategy: BackoffStrategy::Exponential,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with the given retry limit.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    /// Fixed delays without jitter.
    pub fn fixed(max_retries: u32, delay_ms: u64) -> Self {
        Self {
            max_retries,
            strategy: BackoffStrategy::Fixed,
            base_delay_ms: delay_ms,
            max_delay_ms: delay_ms,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Disable retries completely.
    pub fn none() -> Self {
        Self {
            enable_retry: false,
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Dead letter queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Maximum number of entries; the oldest is evicted on overflow
    pub max_queue_size: usize,
    /// Age after which entries expire (in milliseconds)
    pub retention_ms: u64,
    /// How often expiry runs (in milliseconds)
    pub cleanup_interval_ms: u64,
    /// Persist entries through the configured store
    pub enable_persistence: bool,
    /// Directory used by the default file store
    pub persistence_dir: PathBuf,
    /// Run the periodic error analysis
    pub enable_auto_analysis: bool,
    /// Analysis interval (in milliseconds)
    pub analysis_interval_ms: u64,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            retention_ms: 7 * 24 * 60 * 60 * 1_000,
            cleanup_interval_ms: 60 * 60 * 1_000,
            enable_persistence: true,
            persistence_dir: PathBuf::from(".launchq"),
            enable_auto_analysis: true,
            analysis_interval_ms: 30 * 60 * 1_000,
        }
    }
}

impl DeadLetterConfig {
    /// Retention as a [`Duration`].
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Warning and critical levels for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// Warning level
    pub warning: f64,
    /// Critical level
    pub critical: f64,
}

impl Threshold {
    /// Build a threshold pair.
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Throughput floor, in tasks per second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputThreshold {
    /// Desired minimum
    pub min: f64,
    /// Level below which a warning is raised
    pub warning: f64,
}

/// Resource thresholds, in percent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceThresholds {
    /// CPU usage
    pub cpu: Threshold,
    /// Memory usage
    pub memory: Threshold,
    /// Network I/O
    pub network: Threshold,
    /// Disk I/O
    pub disk: Threshold,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu: Threshold::new(70.0, 90.0),
            memory: Threshold::new(80.0, 95.0),
            network: Threshold::new(80.0, 95.0),
            disk: Threshold::new(80.0, 95.0),
        }
    }
}

/// Alert thresholds used by the queue monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringThresholds {
    /// Pending tasks per source
    pub queue_size: Threshold,
    /// Average processing time (in milliseconds)
    pub processing_time_ms: Threshold,
    /// Failed / finished ratio
    pub error_rate: Threshold,
    /// Tasks per second
    pub throughput: ThroughputThreshold,
    /// Resource axes
    pub resource: ResourceThresholds,
}

impl Default for MonitoringThresholds {
    fn default() -> Self {
        Self {
            queue_size: Threshold::new(100.0, 500.0),
            processing_time_ms: Threshold::new(5_000.0, 10_000.0),
            error_rate: Threshold::new(0.05, 0.1),
            throughput: ThroughputThreshold {
                min: 1.0,
                warning: 0.5,
            },
            resource: ResourceThresholds::default(),
        }
    }
}

/// Queue monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the collection loop
    pub enabled: bool,
    /// Collection interval (in milliseconds)
    pub collection_interval_ms: u64,
    /// History and acknowledged-alert retention (in milliseconds)
    pub data_retention_ms: u64,
    /// History ring size
    pub max_history_records: usize,
    /// Nominal queue size used as the utilization denominator
    pub max_queue_size: usize,
    /// Alert thresholds
    pub thresholds: MonitoringThresholds,
    /// Raise alerts at all
    pub enable_alerts: bool,
    /// Window inside which an identical unacknowledged alert is suppressed (in milliseconds)
    pub alert_dedup_ms: u64,
    /// Generate hourly reports on a timer
    pub enable_auto_reports: bool,
    /// Report interval (in milliseconds)
    pub report_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            collection_interval_ms: 5_000,
            data_retention_ms: 24 * 60 * 60 * 1_000,
            max_history_records: 1_000,
            max_queue_size: 1_000,
            thresholds: MonitoringThresholds::default(),
            enable_alerts: true,
            alert_dedup_ms: 5 * 60 * 1_000,
            enable_auto_reports: true,
            report_interval_ms: 60 * 60 * 1_000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, overridden by `RUST_LOG` when set
    pub level: LogLevel,
    /// Enable structured JSON logging
    pub json_format: bool,
    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,
    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl LaunchConfig {
    /// Create a new configuration optimized for development.
    pub fn development() -> Self {
        Self {
            scheduler: SchedulerConfig {
                max_concurrency: 2,
                ..Default::default()
            },
            concurrency: ConcurrencyConfig {
                base_concurrency: 2,
                max_concurrency: 4,
                ..Default::default()
            },
            dead_letter: DeadLetterConfig {
                enable_persistence: false,
                ..Default::default()
            },
            monitor: MonitorConfig {
                enable_auto_reports: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: true,
                include_targets: true,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a new configuration optimized for production.
    pub fn production() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            executor: ExecutorConfig {
                default_timeout_ms: 30_000,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                max_concurrency: cpus * 2,
                ..Default::default()
            },
            concurrency: ConcurrencyConfig {
                base_concurrency: cpus * 2,
                max_concurrency: cpus * 8,
                ..Default::default()
            },
            retry: RetryConfig::exponential(5),
            logging: LoggingConfig {
                level: LogLevel::Info,
                json_format: true,
                colored: false,
                include_targets: false,
            },
            ..Default::default()
        }
    }

    /// Create a configuration for testing.
    pub fn testing() -> Self {
        Self {
            executor: ExecutorConfig {
                default_timeout_ms: 1_000,
                enable_resource_monitoring: false,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                max_concurrency: 2,
                rate_limit: None,
                ..Default::default()
            },
            concurrency: ConcurrencyConfig {
                strategy: ConcurrencyStrategy::Fixed,
                base_concurrency: 2,
                resources: ResourceLimits {
                    enable_auto_adjustment: false,
                    ..Default::default()
                },
                ..Default::default()
            },
            retry: RetryConfig::fixed(1, 10),
            dead_letter: DeadLetterConfig {
                enable_persistence: false,
                enable_auto_analysis: false,
                ..Default::default()
            },
            monitor: MonitorConfig {
                enabled: false,
                enable_auto_reports: false,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: LogLevel::Debug,
                colored: false,
                include_targets: true,
                ..Default::default()
            },
        }
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> LaunchResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config
            .validate()
            .map_err(|errors| LaunchError::config(errors.join("; ")))?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.executor.default_timeout_ms == 0 {
            errors.push("Executor default timeout must be greater than 0".to_string());
        }

        if let Err(mut scheduler_errors) = self.scheduler.validate() {
            errors.append(&mut scheduler_errors);
        }

        let concurrency = &self.concurrency;
        if concurrency.min_concurrency == 0 {
            errors.push("Minimum concurrency must be greater than 0".to_string());
        }
        if concurrency.max_concurrency < concurrency.min_concurrency {
            errors.push(
                "Maximum concurrency must be greater than or equal to minimum".to_string(),
            );
        }
        if concurrency.base_concurrency < concurrency.min_concurrency
            || concurrency.base_concurrency > concurrency.max_concurrency
        {
            errors.push("Base concurrency must lie within [min, max]".to_string());
        }
        if concurrency.adaptive.step == 0 {
            errors.push("Adaptive step must be greater than 0".to_string());
        }

        if self.retry.base_delay_ms == 0 && self.retry.strategy != BackoffStrategy::Custom {
            errors.push("Retry base delay must be greater than 0".to_string());
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push("Retry max delay must be greater than or equal to base delay".to_string());
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push("Retry jitter must lie within [0, 1]".to_string());
        }

        if self.dead_letter.max_queue_size == 0 {
            errors.push("Dead letter queue size must be greater than 0".to_string());
        }

        if self.monitor.collection_interval_ms == 0 {
            errors.push("Monitor collection interval must be greater than 0".to_string());
        }
        if self.monitor.max_queue_size == 0 {
            errors.push("Monitor nominal queue size must be greater than 0".to_string());
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LaunchConfig::default();
        assert_eq!(config.scheduler.max_concurrency, 5);
        assert_eq!(config.executor.default_timeout_ms, 10_000);
        assert_eq!(config.dead_letter.max_queue_size, 1_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_development_config() {
        let config = LaunchConfig::development();
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert!(!config.dead_letter.enable_persistence);
        assert!(matches!(config.logging.level, LogLevel::Debug));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_config() {
        let config = LaunchConfig::production();
        assert!(config.scheduler.max_concurrency >= 2);
        assert_eq!(config.retry.max_retries, 5);
        assert!(config.logging.json_format);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = LaunchConfig::testing();
        assert!(config.scheduler.rate_limit.is_none());
        assert_eq!(config.concurrency.strategy, ConcurrencyStrategy::Fixed);
        assert!(!config.monitor.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = LaunchConfig::default();
        config.scheduler.max_concurrency = 0;
        config.retry.max_delay_ms = 10;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max concurrency")));
        assert!(errors.iter().any(|e| e.contains("max delay")));
    }

    #[test]
    fn test_delayed_queue_requires_serial_mode() {
        let config = SchedulerConfig {
            queue: QueueConfig::of_kind(QueueKind::Delayed),
            ..Default::default()
        };
        let errors = config.clone().with_mode(ExecutionMode::Parallel).validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("serial mode")));
        assert!(config.clone().with_mode(ExecutionMode::Mixed).validate().is_err());
        assert!(config.with_mode(ExecutionMode::Serial).validate().is_ok());
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = LaunchConfig::from_json_str(
            r#"{ "scheduler": { "mode": "mixed", "max_concurrency": 3 }, "retry": { "jitter": 0.0 } }"#,
        )
        .unwrap();

        assert_eq!(config.scheduler.mode, ExecutionMode::Mixed);
        assert_eq!(config.scheduler.max_concurrency, 3);
        assert_eq!(config.retry.jitter, 0.0);
        assert_eq!(config.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn test_invalid_json_config_is_rejected() {
        let result = LaunchConfig::from_json_str(r#"{ "scheduler": { "max_concurrency": 0 } }"#);
        assert!(matches!(result, Err(LaunchError::ConfigError { .. })));
    }

    #[test]
    fn test_log_level_conversion() {
        let level: tracing::Level = LogLevel::Warn.into();
        assert_eq!(level, tracing::Level::WARN);
    }
}
