//! Prometheus export of runtime metrics.
//!
//! The exporter holds gauges only. Every [`MetricsExporter::update`] copies
//! the current monitor, dead letter, retry and concurrency figures into the
//! registry, so scraping is a plain [`MetricsExporter::gather_text`].

use crate::core::LaunchRuntime;
use crate::core::monitor::QueueMetrics;
use crate::error::LaunchResult;
use prometheus::{Encoder, Gauge, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;

const NAMESPACE: &str = "launchq";

/// Gauges for queues, schedulers and the shared components.
#[derive(Clone)]
pub struct MetricsExporter {
    registry: Registry,
    queue_size: GaugeVec,
    processing: GaugeVec,
    finished: GaugeVec,
    throughput: GaugeVec,
    success_rate: GaugeVec,
    average_processing_ms: GaugeVec,
    utilization: GaugeVec,
    dead_letters: Gauge,
    retries_total: Gauge,
    final_failures: Gauge,
    concurrency_limit: Gauge,
}

impl std::fmt::Debug for MetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsExporter").finish_non_exhaustive()
    }
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> LaunchResult<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> LaunchResult<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl MetricsExporter {
    /// Register every gauge in a fresh registry.
    pub fn new() -> LaunchResult<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register every gauge in an existing registry.
    pub fn with_registry(registry: Registry) -> LaunchResult<Self> {
        let source = &["source"];
        let outcome = &["source", "outcome"];
        Ok(Self {
            queue_size: gauge_vec(&registry, "queue_size", "Tasks waiting to start", source)?,
            processing: gauge_vec(&registry, "processing", "Tasks currently running", source)?,
            finished: gauge_vec(&registry, "finished", "Finished tasks by outcome", outcome)?,
            throughput: gauge_vec(
                &registry,
                "throughput",
                "Finished tasks per second over the last minute",
                source,
            )?,
            success_rate: gauge_vec(&registry, "success_rate", "Completed over finished (0.0 to 1.0)", source)?,
            average_processing_ms: gauge_vec(
                &registry,
                "average_processing_milliseconds",
                "Rolling mean processing time",
                source,
            )?,
            utilization: gauge_vec(&registry, "utilization", "Queue size over capacity", source)?,
            dead_letters: gauge(&registry, "dead_letters", "Entries in the dead letter queue")?,
            retries_total: gauge(&registry, "retries_total", "Retry timers armed")?,
            final_failures: gauge(&registry, "final_failures", "Tasks handed to the dead letter queue")?,
            concurrency_limit: gauge(&registry, "concurrency_limit", "Current concurrency limit")?,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Copy the current figures of every runtime component.
    pub async fn update(&self, runtime: &LaunchRuntime) {
        self.update_sources(&runtime.monitor().all_metrics());
        self.dead_letters.set(runtime.dead_letter().len().await as f64);
        let retry = runtime.retry().stats().await;
        self.retries_total.set(retry.total_retries as f64);
        self.final_failures.set(retry.final_failures as f64);
        self.concurrency_limit
            .set(runtime.controller().current_concurrency().await as f64);
    }

    /// Replace the per-source gauges. Sources missing from `metrics` are
    /// dropped from the export.
    pub fn update_sources(&self, metrics: &BTreeMap<String, QueueMetrics>) {
        for vec in [
            &self.queue_size,
            &self.processing,
            &self.finished,
            &self.throughput,
            &self.success_rate,
            &self.average_processing_ms,
            &self.utilization,
        ] {
            vec.reset();
        }

        for (source, m) in metrics {
            let label = [source.as_str()];
            self.queue_size.with_label_values(&label).set(m.current_size as f64);
            self.processing.with_label_values(&label).set(m.processing as f64);
            self.throughput.with_label_values(&label).set(m.throughput);
            self.success_rate.with_label_values(&label).set(m.success_rate);
            self.average_processing_ms
                .with_label_values(&label)
                .set(m.average_processing_time_ms);
            self.utilization.with_label_values(&label).set(m.utilization);
            for (outcome, value) in [
                ("completed", m.completed),
                ("failed", m.failed),
                ("cancelled", m.cancelled),
            ] {
                self.finished
                    .with_label_values(&[source.as_str(), outcome])
                    .set(value as f64);
            }
        }
    }

    /// Render the registry in the Prometheus text format.
    pub fn gather_text(&self) -> LaunchResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchConfig;
    use crate::core::{ResourceUsage, StaticProbe};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let registry = Registry::new();
        MetricsExporter::with_registry(registry.clone()).unwrap();
        assert!(MetricsExporter::with_registry(registry).is_err());
    }

    #[tokio::test]
    async fn test_export_follows_runtime() {
        let runtime = LaunchRuntime::with_parts(
            LaunchConfig::testing(),
            Arc::new(StaticProbe::new(ResourceUsage::default())),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        runtime.start().await.unwrap();
        runtime.create_scheduler("plugins", None).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&runtime).await;
        let text = exporter.gather_text().unwrap();
        assert!(text.contains("launchq_concurrency_limit 2"));
        assert!(text.contains("launchq_dead_letters 0"));

        exporter.update_sources(&BTreeMap::new());
        assert!(!exporter.gather_text().unwrap().contains("launchq_queue_size{"));
        runtime.shutdown().await.unwrap();
    }
}
