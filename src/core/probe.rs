//! Best-effort resource sampling.
//!
//! Readings are percentages in `[0, 100]`. [`SystemProbe`] reads Linux
//! `/proc` files and reports zero wherever they are unavailable; exact
//! OS-level accounting is out of scope.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Resource usage in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    pub network_io: f64,
    pub disk_io: f64,
}

/// Source of resource readings.
#[async_trait]
pub trait ResourceProbe: Send + Sync {
    async fn sample(&self) -> ResourceUsage;
}

/// Reads `/proc/meminfo` and `/proc/loadavg`. Load average is normalised by
/// the number of CPUs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl SystemProbe {
    fn memory_percent(meminfo: &str) -> Option<f64> {
        let field = |name: &str| {
            meminfo
                .lines()
                .find(|line| line.starts_with(name))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|value| value.parse::<f64>().ok())
        };
        let total = field("MemTotal:")?;
        let available = field("MemAvailable:")?;
        if total <= 0.0 {
            return None;
        }
        Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
    }

    fn cpu_percent(loadavg: &str, cpus: usize) -> Option<f64> {
        let load: f64 = loadavg.split_whitespace().next()?.parse().ok()?;
        Some((load / cpus.max(1) as f64 * 100.0).clamp(0.0, 100.0))
    }
}

#[async_trait]
impl ResourceProbe for SystemProbe {
    async fn sample(&self) -> ResourceUsage {
        let memory = tokio::fs::read_to_string("/proc/meminfo")
            .await
            .ok()
            .and_then(|raw| Self::memory_percent(&raw))
            .unwrap_or(0.0);
        let cpu = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .ok()
            .and_then(|raw| Self::cpu_percent(&raw, num_cpus::get()))
            .unwrap_or(0.0);

        ResourceUsage {
            cpu,
            memory,
            ..Default::default()
        }
    }
}

/// Probe returning whatever was last set. Used by tests and embedders that
/// measure resources themselves.
#[derive(Debug, Default)]
pub struct StaticProbe {
    usage: Mutex<ResourceUsage>,
}

impl StaticProbe {
    pub fn new(usage: ResourceUsage) -> Self {
        Self {
            usage: Mutex::new(usage),
        }
    }

    pub fn set(&self, usage: ResourceUsage) {
        *self.usage.lock() = usage;
    }
}

#[async_trait]
impl ResourceProbe for StaticProbe {
    async fn sample(&self) -> ResourceUsage {
        *self.usage.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_percent_from_meminfo() {
        let raw = "MemTotal:       1000 kB\nMemFree:         100 kB\nMemAvailable:    250 kB\n";
        assert_eq!(SystemProbe::memory_percent(raw), Some(75.0));
        assert_eq!(SystemProbe::memory_percent("garbage"), None);
    }

    #[test]
    fn test_cpu_percent_from_loadavg() {
        assert_eq!(
            SystemProbe::cpu_percent("2.00 1.50 1.00 3/400 1234", 4),
            Some(50.0)
        );
        assert_eq!(
            SystemProbe::cpu_percent("9.00 1.50 1.00 3/400 1234", 4),
            Some(100.0)
        );
    }

    #[tokio::test]
    async fn test_static_probe() {
        let probe = StaticProbe::new(ResourceUsage {
            cpu: 10.0,
            ..Default::default()
        });
        assert_eq!(probe.sample().await.cpu, 10.0);
        probe.set(ResourceUsage {
            memory: 42.0,
            ..Default::default()
        });
        let usage = probe.sample().await;
        assert_eq!(usage.memory, 42.0);
        assert_eq!(usage.cpu, 0.0);
    }
}
