//! Concurrency controller.
//!
//! Samples utilization (running tasks over the current limit) and resource
//! usage on a fixed interval and moves the concurrency limit of every
//! registered [`ConcurrencyTarget`] according to a [`ConcurrencyStrategy`].
//! All targets share one limit; an adjustment is broadcast to each of them.

use crate::config::{ConcurrencyConfig, ConcurrencyStrategy};
use crate::core::probe::{ResourceProbe, ResourceUsage};
use crate::error::{LaunchError, LaunchResult};
use crate::events::{ConcurrencyEvent, Event, EventBus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const HISTORY_LIMIT: usize = 100;
const HISTORY_KEEP: usize = 50;

/// Something whose concurrency limit the controller can drive.
#[async_trait]
pub trait ConcurrencyTarget: Send + Sync {
    fn target_id(&self) -> &str;

    /// Tasks currently running.
    async fn active_tasks(&self) -> usize;

    /// Current concurrency limit.
    async fn capacity(&self) -> usize;

    async fn apply_concurrency(&self, concurrency: usize) -> LaunchResult<()>;
}

/// Adaptive step: grow by `step` above the utilization threshold while
/// resources stay under their ceilings, shrink by `step` below half the
/// threshold.
pub fn adaptive_target(
    current: usize,
    utilization: f64,
    usage: &ResourceUsage,
    config: &ConcurrencyConfig,
) -> usize {
    let threshold = config.adaptive.threshold;
    let step = config.adaptive.step;
    let limits = &config.resources;

    if utilization > threshold {
        if usage.memory < limits.memory_threshold && usage.cpu < limits.cpu_threshold {
            return (current + step).min(config.max_concurrency);
        }
        current
    } else if utilization < threshold * 0.5 {
        current.saturating_sub(step).max(config.min_concurrency)
    } else {
        current
    }
}

/// Resource step: shrink to 80% (rounded up) when any axis is critical,
/// grow by one when every axis sits under 60% of its warning level.
pub fn resource_target(current: usize, usage: &ResourceUsage, config: &ConcurrencyConfig) -> usize {
    let limits = &config.resources;

    if usage.memory > limits.memory_critical || usage.cpu > limits.cpu_critical {
        ((current as f64 * 0.8).ceil() as usize).max(config.min_concurrency)
    } else if usage.memory < limits.memory_threshold * 0.6 && usage.cpu < limits.cpu_threshold * 0.6
    {
        (current + 1).min(config.max_concurrency)
    } else {
        current
    }
}

/// Controller statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConcurrencyStats {
    pub current_concurrency: usize,
    /// Mean of the recent adjustment targets
    pub average_concurrency: f64,
    pub peak_concurrency: usize,
    /// Utilization at the last sample
    pub utilization: f64,
    /// Resource usage at the last sample
    pub resource_usage: ResourceUsage,
    pub adjustment_count: u64,
    pub last_adjustment: Option<DateTime<Utc>>,
}

struct ControllerState {
    stats: ConcurrencyStats,
    history: Vec<usize>,
    last_adjusted: Option<Instant>,
}

struct ControllerInner {
    id: String,
    bus: EventBus,
    probe: Arc<dyn ResourceProbe>,
    config: RwLock<ConcurrencyConfig>,
    targets: RwLock<HashMap<String, Arc<dyn ConcurrencyTarget>>>,
    state: Mutex<ControllerState>,
    sampler: parking_lot::Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

/// Shared concurrency limit for a set of schedulers.
#[derive(Clone)]
pub struct ConcurrencyController {
    inner: Arc<ControllerInner>,
}

impl ConcurrencyController {
    /// Create a controller at `base_concurrency`. Call [`start`](Self::start)
    /// to begin sampling.
    pub fn new(
        id: impl Into<String>,
        config: ConcurrencyConfig,
        probe: Arc<dyn ResourceProbe>,
        bus: EventBus,
    ) -> LaunchResult<Self> {
        if config.min_concurrency == 0
            || config.max_concurrency < config.min_concurrency
            || config.adaptive.step == 0
        {
            return Err(LaunchError::config(
                "Concurrency bounds must satisfy 0 < min <= max and step > 0",
            ));
        }

        let base = config.clamp(config.base_concurrency);
        let state = ControllerState {
            stats: ConcurrencyStats {
                current_concurrency: base,
                peak_concurrency: base,
                average_concurrency: base as f64,
                ..Default::default()
            },
            history: Vec::new(),
            last_adjusted: None,
        };

        Ok(Self {
            inner: Arc::new(ControllerInner {
                id: id.into(),
                bus,
                probe,
                config: RwLock::new(config),
                targets: RwLock::new(HashMap::new()),
                state: Mutex::new(state),
                sampler: parking_lot::Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Start the sampling loop when automatic adjustment is enabled.
    pub async fn start(&self) -> LaunchResult<()> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(LaunchError::Destroyed);
        }
        let config = self.inner.config.read().await.clone();
        if !config.resources.enable_auto_adjustment {
            tracing::debug!("🎚️ Controller {} auto adjustment disabled", self.inner.id);
            return Ok(());
        }

        let mut sampler = self.inner.sampler.lock();
        if sampler.is_some() {
            return Err(LaunchError::AlreadyRunning);
        }

        let controller = self.clone();
        let period = config.check_interval();
        *sampler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.sample_once().await;
            }
        }));
        tracing::info!(
            "🎚️ Controller {} sampling every {:?} ({:?})",
            self.inner.id,
            period,
            config.strategy
        );
        Ok(())
    }

    /// Stop the sampling loop.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.sampler.lock().take() {
            handle.abort();
        }
    }

    /// Add a target and bring it to the current limit.
    pub async fn register(&self, target: Arc<dyn ConcurrencyTarget>) -> LaunchResult<()> {
        let current = self.current_concurrency().await;
        target.apply_concurrency(current).await?;

        let target_id = target.target_id().to_string();
        self.inner
            .targets
            .write()
            .await
            .insert(target_id.clone(), target);
        self.inner
            .bus
            .publish(Event::Concurrency(ConcurrencyEvent::SchedulerRegistered {
                scheduler_id: target_id.clone(),
            }));
        tracing::debug!("🎚️ Controller {} registered {}", self.inner.id, target_id);
        Ok(())
    }

    /// Remove a target. Returns whether it was registered.
    pub async fn unregister(&self, target_id: &str) -> bool {
        let removed = self.inner.targets.write().await.remove(target_id).is_some();
        if removed {
            self.inner
                .bus
                .publish(Event::Concurrency(ConcurrencyEvent::SchedulerUnregistered {
                    scheduler_id: target_id.to_string(),
                }));
        }
        removed
    }

    /// Registered target ids, sorted.
    pub async fn targets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.targets.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn current_concurrency(&self) -> usize {
        self.inner.state.lock().await.stats.current_concurrency
    }

    /// Set the limit manually, clamped to the configured bounds. Returns the
    /// applied value.
    pub async fn set_concurrency(&self, concurrency: usize) -> usize {
        let target = self.inner.config.read().await.clamp(concurrency);
        if target != self.current_concurrency().await {
            self.adjust(target, "manual").await;
        }
        target
    }

    /// Take one sample and adjust if the strategy calls for it. Returns the
    /// new limit when an adjustment happened.
    pub async fn sample_once(&self) -> Option<usize> {
        let config = self.inner.config.read().await.clone();
        let usage = self.inner.probe.sample().await;

        let targets: Vec<_> = self.inner.targets.read().await.values().cloned().collect();
        let active: usize = join_all(targets.iter().map(|t| t.active_tasks()))
            .await
            .into_iter()
            .sum();

        let (current, cooling_down) = {
            let mut state = self.inner.state.lock().await;
            let current = state.stats.current_concurrency;
            state.stats.utilization = active as f64 / current.max(1) as f64;
            state.stats.resource_usage = usage;
            let cooling_down = state
                .last_adjusted
                .is_some_and(|at| at.elapsed() < config.cooldown());
            (current, cooling_down)
        };
        let utilization = active as f64 / current.max(1) as f64;

        let target = match config.strategy {
            ConcurrencyStrategy::Fixed | ConcurrencyStrategy::Priority => return None,
            ConcurrencyStrategy::Adaptive if cooling_down => {
                tracing::trace!("🎚️ Controller {} in cooldown", self.inner.id);
                return None;
            }
            ConcurrencyStrategy::Adaptive => adaptive_target(current, utilization, &usage, &config),
            ConcurrencyStrategy::Resource => resource_target(current, &usage, &config),
        };

        if target == current {
            return None;
        }
        let reason = match config.strategy {
            ConcurrencyStrategy::Resource => "resource",
            _ => "adaptive",
        };
        self.adjust(target, reason).await;
        Some(target)
    }

    async fn adjust(&self, concurrency: usize, reason: &str) {
        let from = {
            let mut state = self.inner.state.lock().await;
            let from = state.stats.current_concurrency;
            state.stats.current_concurrency = concurrency;
            state.stats.peak_concurrency = state.stats.peak_concurrency.max(concurrency);
            state.history.push(concurrency);
            if state.history.len() > HISTORY_LIMIT {
                let excess = state.history.len() - HISTORY_KEEP;
                state.history.drain(..excess);
            }
            state.stats.average_concurrency =
                state.history.iter().sum::<usize>() as f64 / state.history.len() as f64;
            state.stats.adjustment_count += 1;
            state.stats.last_adjustment = Some(Utc::now());
            state.last_adjusted = Some(Instant::now());
            from
        };

        let targets: Vec<_> = self.inner.targets.read().await.values().cloned().collect();
        let results = join_all(targets.iter().map(|t| t.apply_concurrency(concurrency))).await;
        for (target, result) in targets.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(
                    "🎚️ Controller {} could not resize {}: {}",
                    self.inner.id,
                    target.target_id(),
                    e
                );
            }
        }

        self.inner
            .bus
            .publish(Event::Concurrency(ConcurrencyEvent::Adjusted {
                from,
                to: concurrency,
                reason: reason.to_string(),
            }));
        tracing::info!(
            "🎚️ Controller {} concurrency {} -> {} ({})",
            self.inner.id,
            from,
            concurrency,
            reason
        );
    }

    pub async fn stats(&self) -> ConcurrencyStats {
        self.inner.state.lock().await.stats.clone()
    }

    pub async fn config(&self) -> ConcurrencyConfig {
        self.inner.config.read().await.clone()
    }

    /// Apply a partial configuration update. The current limit is clamped
    /// into the new bounds and the sampler restarts if it was running.
    pub async fn update_config(
        &self,
        update: impl FnOnce(&mut ConcurrencyConfig),
    ) -> LaunchResult<()> {
        let mut next = self.config().await;
        update(&mut next);
        if next.min_concurrency == 0
            || next.max_concurrency < next.min_concurrency
            || next.adaptive.step == 0
        {
            return Err(LaunchError::config(
                "Concurrency bounds must satisfy 0 < min <= max and step > 0",
            ));
        }
        *self.inner.config.write().await = next.clone();

        let current = self.current_concurrency().await;
        let clamped = next.clamp(current);
        if clamped != current {
            self.adjust(clamped, "config").await;
        }

        let was_sampling = self.inner.sampler.lock().is_some();
        if was_sampling {
            self.stop();
            self.start().await?;
        }
        Ok(())
    }

    /// Stop sampling and forget every target.
    pub async fn destroy(&self) {
        self.stop();
        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.targets.write().await.clear();
        tracing::info!("🎚️ Controller {} destroyed", self.inner.id);
    }
}
