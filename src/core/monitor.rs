//! Queue monitor.
//!
//! Maintains one [`QueueMetrics`] per event source (queue lane, executor
//! group or scheduler) from the queue and scheduler events on the bus. Each
//! update recomputes the derived ratios and health status and then checks
//! the alert thresholds. A collection tick refreshes resource usage from a
//! [`ResourceProbe`], appends a snapshot to the history ring and drops
//! expired history and old acknowledged alerts.
//!
//! Health is judged on seven checks, each comparing against its critical
//! threshold: error rate, utilization (0.9), processing time and the four
//! resource axes. All passing is `healthy`, at least 70% passing is
//! `warning`, anything less is `critical`.

use crate::config::{MonitorConfig, MonitoringThresholds, Threshold};
use crate::core::probe::{ResourceProbe, ResourceUsage};
use crate::error::{LaunchError, LaunchResult};
use crate::events::{Event, EventBus, MonitorEvent, QueueEvent, SchedulerEvent, next_event};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};

const DURATION_WINDOW: usize = 100;
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(60);
const UTILIZATION_CRITICAL: f64 = 0.9;

/// What produced a source's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Queue,
    Scheduler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Unknown,
}

/// Live metrics of one source.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMetrics {
    pub source: String,
    pub kind: SourceKind,
    /// Tasks waiting to start
    pub current_size: usize,
    pub max_size: usize,
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Rolling mean over the last finished tasks (in milliseconds)
    pub average_processing_time_ms: f64,
    /// Finished tasks per second over the last minute
    pub throughput: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    /// `current_size / max_size`
    pub utilization: f64,
    pub health: HealthStatus,
    pub resource_usage: ResourceUsage,
    pub last_updated: DateTime<Utc>,
}

impl QueueMetrics {
    fn new(source: &str, kind: SourceKind, max_size: usize) -> Self {
        Self {
            source: source.to_string(),
            kind,
            current_size: 0,
            max_size,
            processing: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            average_processing_time_ms: 0.0,
            throughput: 0.0,
            success_rate: 0.0,
            error_rate: 0.0,
            utilization: 0.0,
            health: HealthStatus::Unknown,
            resource_usage: ResourceUsage::default(),
            last_updated: Utc::now(),
        }
    }

    /// Completed plus failed.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Health of a metrics snapshot against the critical thresholds.
pub fn health_status(metrics: &QueueMetrics, thresholds: &MonitoringThresholds) -> HealthStatus {
    let usage = &metrics.resource_usage;
    let resource = &thresholds.resource;
    let checks = [
        metrics.error_rate < thresholds.error_rate.critical,
        metrics.utilization < UTILIZATION_CRITICAL,
        metrics.average_processing_time_ms < thresholds.processing_time_ms.critical,
        usage.cpu < resource.cpu.critical,
        usage.memory < resource.memory.critical,
        usage.network_io < resource.network.critical,
        usage.disk_io < resource.disk.critical,
    ];
    let passed = checks.iter().filter(|c| **c).count();
    if passed == checks.len() {
        HealthStatus::Healthy
    } else if passed as f64 >= checks.len() as f64 * 0.7 {
        HealthStatus::Warning
    } else {
        HealthStatus::Critical
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    QueueSizeExceeded,
    ProcessingTimeExceeded,
    ErrorRateHigh,
    ThroughputLow,
    CpuUsageHigh,
    MemoryUsageHigh,
    NetworkIoHigh,
    DiskIoHigh,
    QueueUnhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringAlert {
    pub id: String,
    pub source: String,
    pub alert_type: AlertType,
    pub level: AlertLevel,
    pub message: String,
    pub current_value: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
}

/// Selection used by [`QueueMonitor::alerts`]. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub source: Option<String>,
    pub alert_type: Option<AlertType>,
    pub level: Option<AlertLevel>,
    pub acknowledged: Option<bool>,
}

impl AlertFilter {
    fn matches(&self, alert: &MonitoringAlert) -> bool {
        self.source.as_deref().is_none_or(|s| s == alert.source)
            && self.alert_type.is_none_or(|t| t == alert.alert_type)
            && self.level.is_none_or(|l| l == alert.level)
            && self.acknowledged.is_none_or(|a| a == alert.acknowledged)
    }
}

/// Time span covered by a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportRange {
    /// Last five minutes
    Realtime,
    Hourly,
    Daily,
    Weekly,
    /// Last thirty days
    Monthly,
}

impl ReportRange {
    pub fn span(&self) -> chrono::Duration {
        match self {
            Self::Realtime => chrono::Duration::minutes(5),
            Self::Hourly => chrono::Duration::hours(1),
            Self::Daily => chrono::Duration::days(1),
            Self::Weekly => chrono::Duration::days(7),
            Self::Monthly => chrono::Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    Volatile,
}

/// Direction of a series: compares the mean of its second half with the
/// mean of its first half. Moves under 10% are stable, unless the series
/// swings widely around its mean.
pub fn trend(series: &[f64]) -> TrendDirection {
    if series.len() < 2 {
        return TrendDirection::Stable;
    }
    let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
    let (first, second) = series.split_at(series.len() / 2);
    let (before, after) = (mean(first), mean(second));
    let overall = mean(series);

    let change = if before.abs() > f64::EPSILON {
        (after - before) / before.abs()
    } else if after.abs() > f64::EPSILON {
        1.0
    } else {
        0.0
    };
    if change > 0.1 {
        return TrendDirection::Increasing;
    }
    if change < -0.1 {
        return TrendDirection::Decreasing;
    }

    if overall.abs() > f64::EPSILON {
        let variance = series.iter().map(|v| (v - overall).powi(2)).sum::<f64>() / series.len() as f64;
        if variance.sqrt() / overall.abs() > 0.5 {
            return TrendDirection::Volatile;
        }
    }
    TrendDirection::Stable
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub total_sources: usize,
    pub total_tasks: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub average_success_rate: f64,
    pub average_processing_time_ms: f64,
    pub total_throughput: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportTrends {
    pub queue_size: TrendDirection,
    pub processing_time: TrendDirection,
    pub throughput: TrendDirection,
    pub error_rate: TrendDirection,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitoringReport {
    pub id: String,
    pub range: ReportRange,
    pub generated_at: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub summary: ReportSummary,
    pub metrics: Vec<QueueMetrics>,
    /// Unacknowledged alerts, newest first
    pub alerts: Vec<MonitoringAlert>,
    pub trends: ReportTrends,
    pub recommendations: Vec<String>,
}

/// Metrics of every source at one collection tick.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub metrics: Vec<QueueMetrics>,
}

struct SourceState {
    metrics: QueueMetrics,
    durations: VecDeque<Duration>,
    finishes: VecDeque<Instant>,
    first_seen: Instant,
}

impl SourceState {
    fn new(source: &str, kind: SourceKind, max_size: usize) -> Self {
        Self {
            metrics: QueueMetrics::new(source, kind, max_size),
            durations: VecDeque::with_capacity(DURATION_WINDOW),
            finishes: VecDeque::new(),
            first_seen: Instant::now(),
        }
    }

    fn record_finish(&mut self, duration: Option<Duration>) {
        let now = Instant::now();
        self.finishes.push_back(now);
        if let Some(duration) = duration {
            if self.durations.len() >= DURATION_WINDOW {
                self.durations.pop_front();
            }
            self.durations.push_back(duration);
        }
    }

    fn recompute(&mut self, thresholds: &MonitoringThresholds) {
        let now = Instant::now();
        while self
            .finishes
            .front()
            .is_some_and(|t| now.duration_since(*t) > THROUGHPUT_WINDOW)
        {
            self.finishes.pop_front();
        }

        let m = &mut self.metrics;
        let finished = m.finished();
        if finished > 0 {
            m.success_rate = m.completed as f64 / finished as f64;
            m.error_rate = m.failed as f64 / finished as f64;
        } else {
            m.success_rate = 0.0;
            m.error_rate = 0.0;
        }
        if !self.durations.is_empty() {
            let total: Duration = self.durations.iter().sum();
            m.average_processing_time_ms =
                total.as_micros() as f64 / 1_000.0 / self.durations.len() as f64;
        }
        let span = now
            .duration_since(self.first_seen)
            .clamp(Duration::from_secs(1), THROUGHPUT_WINDOW);
        m.throughput = self.finishes.len() as f64 / span.as_secs_f64();
        m.utilization = if m.max_size > 0 {
            m.current_size as f64 / m.max_size as f64
        } else {
            0.0
        };
        m.health = health_status(m, thresholds);
        m.last_updated = Utc::now();
    }
}

struct AlertSlot {
    alert: MonitoringAlert,
    raised: Instant,
}

struct MonitorState {
    sources: HashMap<String, SourceState>,
    alerts: Vec<AlertSlot>,
    history: VecDeque<HistoryRecord>,
}

struct MonitorInner {
    id: String,
    bus: EventBus,
    probe: Arc<dyn ResourceProbe>,
    config: parking_lot::RwLock<MonitorConfig>,
    state: Mutex<MonitorState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    destroyed: AtomicBool,
}

/// Event-driven queue monitor. Cloning shares the same monitor.
#[derive(Clone)]
pub struct QueueMonitor {
    inner: Arc<MonitorInner>,
}

impl QueueMonitor {
    pub fn new(
        id: impl Into<String>,
        config: MonitorConfig,
        probe: Arc<dyn ResourceProbe>,
        bus: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                id: id.into(),
                bus,
                probe,
                config: parking_lot::RwLock::new(config),
                state: Mutex::new(MonitorState {
                    sources: HashMap::new(),
                    alerts: Vec::new(),
                    history: VecDeque::new(),
                }),
                handles: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Subscribe to queue and scheduler events and arm the collection and
    /// report timers the configuration enables.
    pub fn start(&self) -> LaunchResult<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(LaunchError::AlreadyRunning);
        }
        let events = self.inner.bus.subscribe();
        self.inner
            .handles
            .lock()
            .push(tokio::spawn(listen(Arc::downgrade(&self.inner), events)));
        let config = self.config();
        self.inner.spawn_timers(&config);
        tracing::info!("📊 Queue monitor {} started", self.inner.id);
        Ok(())
    }

    pub fn config(&self) -> MonitorConfig {
        self.inner.config.read().clone()
    }

    pub fn metrics(&self, source: &str) -> Option<QueueMetrics> {
        self.inner
            .state
            .lock()
            .sources
            .get(source)
            .map(|s| s.metrics.clone())
    }

    /// Metrics of every source, keyed by source name.
    pub fn all_metrics(&self) -> BTreeMap<String, QueueMetrics> {
        self.inner
            .state
            .lock()
            .sources
            .iter()
            .map(|(id, s)| (id.clone(), s.metrics.clone()))
            .collect()
    }

    /// Alerts matching `filter`, newest first.
    pub fn alerts(&self, filter: &AlertFilter) -> Vec<MonitoringAlert> {
        let mut alerts: Vec<MonitoringAlert> = self
            .inner
            .state
            .lock()
            .alerts
            .iter()
            .filter(|s| filter.matches(&s.alert))
            .map(|s| s.alert.clone())
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts
    }

    /// Acknowledge an alert. Returns false for unknown or already
    /// acknowledged alerts.
    pub fn acknowledge_alert(&self, alert_id: &str, by: Option<&str>) -> bool {
        {
            let mut state = self.inner.state.lock();
            let Some(slot) = state
                .alerts
                .iter_mut()
                .find(|s| s.alert.id == alert_id && !s.alert.acknowledged)
            else {
                return false;
            };
            slot.alert.acknowledged = true;
            slot.alert.acknowledged_at = Some(Utc::now());
            slot.alert.acknowledged_by = by.map(str::to_string);
        }
        self.inner
            .bus
            .publish(Event::Monitor(MonitorEvent::AlertAcknowledged {
                alert_id: alert_id.to_string(),
            }));
        true
    }

    /// History records inside the range ending now, oldest first.
    pub fn history(&self, range: ReportRange) -> Vec<HistoryRecord> {
        let start = Utc::now() - range.span();
        self.inner
            .state
            .lock()
            .history
            .iter()
            .filter(|r| r.timestamp >= start)
            .cloned()
            .collect()
    }

    /// Sample resources, save a history record and clean up expired data.
    pub async fn collect(&self) {
        self.inner.collect().await;
    }

    /// Build a report over `range` and publish it.
    pub fn generate_report(&self, range: ReportRange) -> Arc<MonitoringReport> {
        self.inner.generate_report(range)
    }

    /// Apply a partial configuration update; timers restart with the new
    /// intervals.
    pub fn update_config(&self, update: impl FnOnce(&mut MonitorConfig)) -> LaunchResult<()> {
        let mut next = self.config();
        update(&mut next);
        if next.collection_interval_ms == 0 || next.report_interval_ms == 0 {
            return Err(LaunchError::config("Monitor intervals must be greater than 0"));
        }
        if next.max_history_records == 0 {
            return Err(LaunchError::config("Monitor history size must be greater than 0"));
        }
        *self.inner.config.write() = next.clone();
        {
            let mut state = self.inner.state.lock();
            for source in state.sources.values_mut() {
                source.metrics.max_size = next.max_queue_size;
                source.recompute(&next.thresholds);
            }
            while state.history.len() > next.max_history_records {
                state.history.pop_front();
            }
        }
        if self.inner.running.load(Ordering::Acquire) {
            self.inner.abort_timers();
            self.inner.spawn_timers(&next);
        }
        Ok(())
    }

    /// Forget one source's metrics.
    pub fn remove_source(&self, source: &str) -> bool {
        self.inner.state.lock().sources.remove(source).is_some()
    }

    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        for handle in self.inner.handles.lock().drain(..) {
            handle.abort();
        }
        tracing::info!("📊 Queue monitor {} destroyed", self.inner.id);
    }
}

/// How one event changes a source.
enum Delta {
    Added,
    Started,
    Finished {
        ok: bool,
        duration: Option<Duration>,
        was_started: bool,
    },
    Cancelled {
        was_started: bool,
    },
}

impl MonitorInner {
    fn apply(&self, source: &str, kind: SourceKind, delta: Delta) {
        let config = self.config.read().clone();
        let alerts = {
            let mut state = self.state.lock();
            let entry = state
                .sources
                .entry(source.to_string())
                .or_insert_with(|| SourceState::new(source, kind, config.max_queue_size));
            let m = &mut entry.metrics;
            match delta {
                Delta::Added => m.current_size += 1,
                Delta::Started => {
                    m.current_size = m.current_size.saturating_sub(1);
                    m.processing += 1;
                }
                Delta::Finished {
                    ok,
                    duration,
                    was_started,
                } => {
                    if was_started {
                        m.processing = m.processing.saturating_sub(1);
                    } else {
                        m.current_size = m.current_size.saturating_sub(1);
                    }
                    if ok {
                        m.completed += 1;
                    } else {
                        m.failed += 1;
                    }
                    entry.record_finish(duration);
                }
                Delta::Cancelled { was_started } => {
                    if was_started {
                        m.processing = m.processing.saturating_sub(1);
                    } else {
                        m.current_size = m.current_size.saturating_sub(1);
                    }
                    m.cancelled += 1;
                }
            }
            entry.recompute(&config.thresholds);
            let metrics = entry.metrics.clone();
            self.check_thresholds(&mut state, &metrics, &config)
        };
        self.publish_alerts(alerts);
    }

    fn check_thresholds(
        &self,
        state: &mut MonitorState,
        metrics: &QueueMetrics,
        config: &MonitorConfig,
    ) -> Vec<MonitoringAlert> {
        if !config.enable_alerts {
            return Vec::new();
        }
        let t = &config.thresholds;
        let usage = &metrics.resource_usage;
        let mut candidates: Vec<(AlertType, AlertLevel, &str, f64, f64)> = Vec::new();

        let mut graded = |kind: AlertType, label: &'static str, value: f64, threshold: &Threshold| {
            if value >= threshold.critical {
                candidates.push((kind, AlertLevel::Critical, label, value, threshold.critical));
            } else if value >= threshold.warning {
                candidates.push((kind, AlertLevel::Warning, label, value, threshold.warning));
            }
        };
        graded(
            AlertType::QueueSizeExceeded,
            "Queue size",
            metrics.current_size as f64,
            &t.queue_size,
        );
        graded(
            AlertType::ProcessingTimeExceeded,
            "Average processing time",
            metrics.average_processing_time_ms,
            &t.processing_time_ms,
        );
        graded(AlertType::ErrorRateHigh, "Error rate", metrics.error_rate, &t.error_rate);
        graded(AlertType::CpuUsageHigh, "CPU usage", usage.cpu, &t.resource.cpu);
        graded(AlertType::MemoryUsageHigh, "Memory usage", usage.memory, &t.resource.memory);
        graded(AlertType::NetworkIoHigh, "Network I/O", usage.network_io, &t.resource.network);
        graded(AlertType::DiskIoHigh, "Disk I/O", usage.disk_io, &t.resource.disk);

        if metrics.finished() > 0 && metrics.throughput < t.throughput.warning {
            candidates.push((
                AlertType::ThroughputLow,
                AlertLevel::Warning,
                "Throughput",
                metrics.throughput,
                t.throughput.warning,
            ));
        }
        if metrics.health == HealthStatus::Critical {
            candidates.push((
                AlertType::QueueUnhealthy,
                AlertLevel::Critical,
                "Health",
                0.0,
                0.0,
            ));
        }

        let dedup = Duration::from_millis(config.alert_dedup_ms);
        let now = Instant::now();
        let mut raised = Vec::new();
        for (alert_type, level, label, value, threshold) in candidates {
            let duplicate = state.alerts.iter().any(|s| {
                s.alert.source == metrics.source
                    && s.alert.alert_type == alert_type
                    && s.alert.level == level
                    && !s.alert.acknowledged
                    && now.duration_since(s.raised) < dedup
            });
            if duplicate {
                continue;
            }

            let message = match alert_type {
                AlertType::QueueUnhealthy => format!("{} is unhealthy", metrics.source),
                AlertType::ThroughputLow => format!(
                    "{} on {} is {:.2}/s, below {:.2}/s",
                    label, metrics.source, value, threshold
                ),
                _ => format!(
                    "{} on {} is {:.2}, at or above {:.2}",
                    label, metrics.source, value, threshold
                ),
            };
            let alert = MonitoringAlert {
                id: uuid::Uuid::new_v4().to_string(),
                source: metrics.source.clone(),
                alert_type,
                level,
                message,
                current_value: value,
                threshold,
                timestamp: Utc::now(),
                acknowledged: false,
                acknowledged_at: None,
                acknowledged_by: None,
            };
            state.alerts.push(AlertSlot {
                alert: alert.clone(),
                raised: now,
            });
            raised.push(alert);
        }
        raised
    }

    fn publish_alerts(&self, alerts: Vec<MonitoringAlert>) {
        for alert in alerts {
            match alert.level {
                AlertLevel::Critical => tracing::error!("📊 {}", alert.message),
                AlertLevel::Warning => tracing::warn!("📊 {}", alert.message),
                AlertLevel::Info => tracing::info!("📊 {}", alert.message),
            }
            self.bus
                .publish(Event::Monitor(MonitorEvent::AlertTriggered { alert }));
        }
    }

    async fn collect(&self) {
        let usage = self.probe.sample().await;
        let config = self.config.read().clone();
        let retention = chrono::Duration::milliseconds(config.data_retention_ms as i64);

        let (alerts, sources) = {
            let mut state = self.state.lock();
            let mut snapshots = Vec::with_capacity(state.sources.len());
            for source in state.sources.values_mut() {
                source.metrics.resource_usage = usage;
                source.recompute(&config.thresholds);
                snapshots.push(source.metrics.clone());
            }
            snapshots.sort_by(|a, b| a.source.cmp(&b.source));

            let mut alerts = Vec::new();
            for metrics in &snapshots {
                alerts.extend(self.check_thresholds(&mut state, metrics, &config));
            }

            let now = Utc::now();
            state.history.push_back(HistoryRecord {
                timestamp: now,
                metrics: snapshots,
            });
            while state.history.len() > config.max_history_records {
                state.history.pop_front();
            }
            while state
                .history
                .front()
                .is_some_and(|r| now - r.timestamp > retention)
            {
                state.history.pop_front();
            }
            state.alerts.retain(|s| {
                s.alert
                    .acknowledged_at
                    .is_none_or(|at| now - at <= retention)
            });
            (alerts, state.sources.len())
        };

        self.publish_alerts(alerts);
        self.bus
            .publish(Event::Monitor(MonitorEvent::MetricsCollected { sources }));
    }

    fn generate_report(&self, range: ReportRange) -> Arc<MonitoringReport> {
        let config = self.config.read().clone();
        let end = Utc::now();
        let start = end - range.span();

        let report = {
            let state = self.state.lock();
            let mut metrics: Vec<QueueMetrics> =
                state.sources.values().map(|s| s.metrics.clone()).collect();
            metrics.sort_by(|a, b| a.source.cmp(&b.source));

            let mut alerts: Vec<MonitoringAlert> = state
                .alerts
                .iter()
                .filter(|s| !s.alert.acknowledged)
                .map(|s| s.alert.clone())
                .collect();
            alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

            let window: Vec<&HistoryRecord> = state
                .history
                .iter()
                .filter(|r| r.timestamp >= start)
                .collect();
            let trends = ReportTrends {
                queue_size: trend(&series(&window, |m| {
                    m.iter().map(|q| q.current_size as f64).sum()
                })),
                processing_time: trend(&series(&window, |m| {
                    mean(m.iter().map(|q| q.average_processing_time_ms))
                })),
                throughput: trend(&series(&window, |m| m.iter().map(|q| q.throughput).sum())),
                error_rate: trend(&series(&window, |m| mean(m.iter().map(|q| q.error_rate)))),
            };

            MonitoringReport {
                id: uuid::Uuid::new_v4().to_string(),
                range,
                generated_at: end,
                start,
                end,
                summary: summarize(&metrics),
                recommendations: recommend(&metrics, &config.thresholds),
                metrics,
                alerts,
                trends,
            }
        };

        let report = Arc::new(report);
        self.bus
            .publish(Event::Monitor(MonitorEvent::ReportGenerated {
                report: Arc::clone(&report),
            }));
        tracing::info!(
            "📊 {:?} report: {} sources, {} active alerts",
            range,
            report.summary.total_sources,
            report.alerts.len()
        );
        report
    }

    fn spawn_timers(self: &Arc<Self>, config: &MonitorConfig) {
        let mut handles = self.handles.lock();
        if config.enabled {
            let period = Duration::from_millis(config.collection_interval_ms);
            let weak = Arc::downgrade(self);
            handles.push(tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                loop {
                    ticks.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.collect().await;
                }
            }));
        }
        if config.enable_auto_reports {
            let period = Duration::from_millis(config.report_interval_ms);
            let weak = Arc::downgrade(self);
            handles.push(tokio::spawn(async move {
                let mut ticks = interval_at(Instant::now() + period, period);
                loop {
                    ticks.tick().await;
                    let Some(inner) = weak.upgrade() else { break };
                    inner.generate_report(ReportRange::Hourly);
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

/// One aggregate value per history record.
fn series(window: &[&HistoryRecord], f: impl Fn(&[QueueMetrics]) -> f64) -> Vec<f64> {
    window.iter().map(|r| f(&r.metrics)).collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}

fn summarize(metrics: &[QueueMetrics]) -> ReportSummary {
    ReportSummary {
        total_sources: metrics.len(),
        total_tasks: metrics.iter().map(QueueMetrics::finished).sum(),
        total_completed: metrics.iter().map(|m| m.completed).sum(),
        total_failed: metrics.iter().map(|m| m.failed).sum(),
        average_success_rate: mean(metrics.iter().map(|m| m.success_rate)),
        average_processing_time_ms: mean(metrics.iter().map(|m| m.average_processing_time_ms)),
        total_throughput: metrics.iter().map(|m| m.throughput).sum(),
    }
}

fn recommend(metrics: &[QueueMetrics], thresholds: &MonitoringThresholds) -> Vec<String> {
    let mut recommendations = Vec::new();
    if metrics.iter().any(|m| m.error_rate > thresholds.error_rate.warning) {
        recommendations.push("Some queues fail often, review task logic and error handling".to_string());
    }
    if metrics.iter().any(|m| m.utilization > 0.8) {
        recommendations.push("Some queues are nearly full, raise capacity or concurrency".to_string());
    }
    if metrics
        .iter()
        .any(|m| m.average_processing_time_ms > thresholds.processing_time_ms.warning)
    {
        recommendations.push("Some queues process slowly, optimize the task bodies".to_string());
    }
    recommendations
}

async fn listen(inner: Weak<MonitorInner>, mut events: tokio::sync::broadcast::Receiver<Event>) {
    while let Some(event) = next_event(&mut events).await {
        let Some(inner) = inner.upgrade() else { break };
        let (source, kind, delta) = match event {
            Event::Queue(QueueEvent::TaskAdded { queue_id, .. }) => {
                (queue_id, SourceKind::Queue, Delta::Added)
            }
            Event::Queue(QueueEvent::TaskStarted { source, .. }) => {
                (source, SourceKind::Queue, Delta::Started)
            }
            Event::Queue(QueueEvent::TaskCompleted { source, duration, .. }) => (
                source,
                SourceKind::Queue,
                Delta::Finished {
                    ok: true,
                    duration: Some(duration),
                    was_started: true,
                },
            ),
            Event::Queue(QueueEvent::TaskFailed { source, duration, .. }) => (
                source,
                SourceKind::Queue,
                Delta::Finished {
                    ok: false,
                    duration: Some(duration),
                    was_started: true,
                },
            ),
            Event::Queue(QueueEvent::TaskCancelled {
                source,
                was_started,
                ..
            }) => (source, SourceKind::Queue, Delta::Cancelled { was_started }),
            Event::Scheduler(SchedulerEvent::TaskScheduled { scheduler_id, .. }) => {
                (scheduler_id, SourceKind::Scheduler, Delta::Added)
            }
            Event::Scheduler(SchedulerEvent::TaskCompleted {
                scheduler_id,
                duration,
                ..
            }) => (
                scheduler_id,
                SourceKind::Scheduler,
                Delta::Finished {
                    ok: true,
                    duration: Some(duration),
                    was_started: false,
                },
            ),
            Event::Scheduler(SchedulerEvent::TaskFailed { scheduler_id, .. }) => (
                scheduler_id,
                SourceKind::Scheduler,
                Delta::Finished {
                    ok: false,
                    duration: None,
                    was_started: false,
                },
            ),
            Event::Scheduler(SchedulerEvent::TaskCancelled { scheduler_id, .. }) => {
                (
                    scheduler_id,
                    SourceKind::Scheduler,
                    Delta::Cancelled { was_started: false },
                )
            }
            _ => continue,
        };
        inner.apply(&source, kind, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::StaticProbe;
    use crate::events::EventFilter;
    use crate::error::TaskFailure;
    use crate::task::{Task, TaskId};
    use serde_json::Value;

    fn monitor(config: MonitorConfig, bus: &EventBus) -> (QueueMonitor, Arc<StaticProbe>) {
        let probe = Arc::new(StaticProbe::new(ResourceUsage::default()));
        let monitor = QueueMonitor::new("m", config, probe.clone(), bus.clone());
        monitor.start().unwrap();
        (monitor, probe)
    }

    fn quiet() -> MonitorConfig {
        MonitorConfig {
            enable_auto_reports: false,
            ..Default::default()
        }
    }

    fn completed(source: &str, id: &str, ms: u64) -> Event {
        Event::Queue(QueueEvent::TaskCompleted {
            source: source.to_string(),
            task_id: TaskId::from(id),
            result: Value::Null,
            duration: Duration::from_millis(ms),
        })
    }

    fn failed(source: &str, message: &str) -> Event {
        Event::Queue(QueueEvent::TaskFailed {
            source: source.to_string(),
            task: Task::from_fn(|_| async { Ok(Value::Null) }),
            failure: TaskFailure::execution(message),
            duration: Duration::from_millis(5),
        })
    }

    fn started(source: &str, id: &str) -> Event {
        Event::Queue(QueueEvent::TaskStarted {
            source: source.to_string(),
            task_id: TaskId::from(id),
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn metrics_with(usage: ResourceUsage, error_rate: f64) -> QueueMetrics {
        let mut m = QueueMetrics::new("q", SourceKind::Queue, 1_000);
        m.resource_usage = usage;
        m.error_rate = error_rate;
        m
    }

    #[test]
    fn test_health_status_checks() {
        let t = MonitoringThresholds::default();
        assert_eq!(
            health_status(&metrics_with(ResourceUsage::default(), 0.0), &t),
            HealthStatus::Healthy
        );
        // 6 of 7 checks pass
        assert_eq!(
            health_status(&metrics_with(ResourceUsage::default(), 0.5), &t),
            HealthStatus::Warning
        );
        // 4 of 7 checks pass
        let hot = ResourceUsage {
            cpu: 99.0,
            memory: 99.0,
            network_io: 10.0,
            disk_io: 10.0,
        };
        assert_eq!(health_status(&metrics_with(hot, 0.5), &t), HealthStatus::Critical);
    }

    #[test]
    fn test_trend_direction() {
        assert_eq!(trend(&[]), TrendDirection::Stable);
        assert_eq!(trend(&[1.0, 2.0, 3.0, 4.0]), TrendDirection::Increasing);
        assert_eq!(trend(&[4.0, 3.0, 2.0, 1.0]), TrendDirection::Decreasing);
        assert_eq!(trend(&[5.0, 5.0, 5.0, 5.0]), TrendDirection::Stable);
        assert_eq!(trend(&[0.0, 10.0, 0.0, 0.0, 10.0, 0.0]), TrendDirection::Volatile);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_follow_events() {
        let bus = EventBus::new();
        let (monitor, _) = monitor(quiet(), &bus);

        bus.publish(Event::Queue(QueueEvent::TaskAdded {
            queue_id: "q".into(),
            task_id: "a".into(),
            priority: 0,
        }));
        bus.publish(started("q", "a"));
        bus.publish(completed("q", "a", 20));
        bus.publish(started("q", "b"));
        bus.publish(completed("q", "b", 40));
        settle().await;

        let m = monitor.metrics("q").unwrap();
        assert_eq!(m.current_size, 0);
        assert_eq!(m.processing, 0);
        assert_eq!(m.completed, 2);
        assert_eq!(m.success_rate, 1.0);
        assert_eq!(m.average_processing_time_ms, 30.0);
        assert_eq!(m.health, HealthStatus::Healthy);
        assert!(m.throughput > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelling_pending_task_leaves_running_count() {
        let bus = EventBus::new();
        let (monitor, _) = monitor(quiet(), &bus);
        let added = |id: &str| {
            Event::Queue(QueueEvent::TaskAdded {
                queue_id: "q".into(),
                task_id: id.into(),
                priority: 0,
            })
        };
        let cancelled = |id: &str, was_started: bool| {
            Event::Queue(QueueEvent::TaskCancelled {
                source: "q".into(),
                task_id: id.into(),
                was_started,
            })
        };

        bus.publish(added("a"));
        bus.publish(added("b"));
        bus.publish(started("q", "a"));
        bus.publish(cancelled("b", false));
        settle().await;

        let m = monitor.metrics("q").unwrap();
        assert_eq!((m.current_size, m.processing), (0, 1));
        assert_eq!(m.cancelled, 1);

        bus.publish(cancelled("a", true));
        settle().await;
        let m = monitor.metrics("q").unwrap();
        assert_eq!((m.current_size, m.processing), (0, 0));
        assert_eq!(m.cancelled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_rate_alert_is_deduplicated() {
        let bus = EventBus::new();
        let (monitor, _) = monitor(quiet(), &bus);

        for _ in 0..3 {
            bus.publish(started("q", "x"));
            bus.publish(failed("q", "boom"));
        }
        settle().await;

        let alerts = monitor.alerts(&AlertFilter {
            alert_type: Some(AlertType::ErrorRateHigh),
            ..Default::default()
        });
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Critical);

        assert!(monitor.acknowledge_alert(&alerts[0].id, Some("ops")));
        assert!(!monitor.acknowledge_alert(&alerts[0].id, None));

        // acknowledged alerts no longer suppress new ones
        bus.publish(started("q", "y"));
        bus.publish(failed("q", "boom"));
        settle().await;
        let open = monitor.alerts(&AlertFilter {
            alert_type: Some(AlertType::ErrorRateHigh),
            acknowledged: Some(false),
            ..Default::default()
        });
        assert_eq!(open.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_alert_needs_a_finished_task() {
        let bus = EventBus::new();
        let (monitor, _) = monitor(quiet(), &bus);

        bus.publish(Event::Queue(QueueEvent::TaskAdded {
            queue_id: "q".into(),
            task_id: "a".into(),
            priority: 0,
        }));
        settle().await;
        assert!(
            monitor
                .alerts(&AlertFilter {
                    alert_type: Some(AlertType::ThroughputLow),
                    ..Default::default()
                })
                .is_empty()
        );

        tokio::time::sleep(Duration::from_secs(30)).await;
        bus.publish(started("q", "a"));
        bus.publish(completed("q", "a", 5));
        settle().await;
        // one task in thirty seconds
        assert_eq!(
            monitor
                .alerts(&AlertFilter {
                    alert_type: Some(AlertType::ThroughputLow),
                    ..Default::default()
                })
                .len(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_collection_tick_samples_resources() {
        let bus = EventBus::new();
        let config = MonitorConfig {
            collection_interval_ms: 1_000,
            max_history_records: 3,
            ..quiet()
        };
        let (monitor, probe) = monitor(config, &bus);
        bus.publish(started("q", "a"));
        settle().await;

        probe.set(ResourceUsage {
            cpu: 95.0,
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        let m = monitor.metrics("q").unwrap();
        assert_eq!(m.resource_usage.cpu, 95.0);
        assert_eq!(m.health, HealthStatus::Warning);
        assert_eq!(monitor.history(ReportRange::Realtime).len(), 3);
        assert_eq!(
            monitor
                .alerts(&AlertFilter {
                    alert_type: Some(AlertType::CpuUsageHigh),
                    level: Some(AlertLevel::Critical),
                    ..Default::default()
                })
                .len(),
            1
        );
        assert!(!bus.history(&EventFilter::name("monitor:metricsCollected"), None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_summary_and_recommendations() {
        let bus = EventBus::new();
        let (monitor, _) = monitor(quiet(), &bus);

        bus.publish(started("a", "1"));
        bus.publish(completed("a", "1", 10));
        bus.publish(started("b", "2"));
        bus.publish(failed("b", "boom"));
        bus.publish(Event::Scheduler(SchedulerEvent::TaskScheduled {
            scheduler_id: "s".into(),
            task_id: "3".into(),
            priority: 5,
            path: crate::core::scheduler::ExecutionPath::Serial,
        }));
        settle().await;
        monitor.collect().await;

        let report = monitor.generate_report(ReportRange::Hourly);
        assert_eq!(report.summary.total_sources, 3);
        assert_eq!(report.summary.total_completed, 1);
        assert_eq!(report.summary.total_failed, 1);
        assert_eq!(monitor.metrics("s").unwrap().kind, SourceKind::Scheduler);
        assert_eq!(monitor.metrics("s").unwrap().current_size, 1);
        assert!(report.recommendations.iter().any(|r| r.contains("fail often")));
        assert_eq!(report.trends.throughput, TrendDirection::Stable);
        assert_eq!(bus.history(&EventFilter::name("monitor:reportGenerated"), None).len(), 1);
    }

    #[tokio::test]
    async fn test_update_config_and_destroy() {
        let bus = EventBus::new();
        let (monitor, _) = monitor(quiet(), &bus);
        assert!(monitor.update_config(|c| c.collection_interval_ms = 0).is_err());
        monitor.update_config(|c| c.max_queue_size = 10).unwrap();
        assert_eq!(monitor.config().max_queue_size, 10);
        monitor.destroy();
        assert!(matches!(monitor.start(), Err(LaunchError::Destroyed)));
    }
}
