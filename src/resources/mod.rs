//! Resource sampling and adaptive concurrency.

mod gate;
mod monitor;

pub use gate::ConcurrencyGate;
pub use monitor::{ResourceLimits, ResourceMonitor};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};

/// One point-in-time resource reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub rss_mb: f64,
    pub worker_budget: usize,
}

/// Raw usage figures returned by a probe, before the monitor stamps them.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub rss_mb: f64,
}

/// Source of resource readings. Implementations must not fail: report zeros
/// when nothing can be read.
pub trait ResourceProbe: Send {
    fn probe(&mut self) -> RawUsage;
}

/// Last CPU figure and when it was taken.
///
/// Two CPU refreshes closer than `min_interval` apart yield a meaningless
/// figure, so callers in between get the cached value.
#[derive(Debug, Clone)]
struct CpuCache {
    min_interval: Duration,
    last_refresh: Instant,
    value: Option<f64>,
}

impl CpuCache {
    fn new(min_interval: Duration, primed_at: Instant) -> Self {
        Self {
            min_interval,
            last_refresh: primed_at,
            value: None,
        }
    }

    /// Cached reading, refreshed through `refresh` once `min_interval` has
    /// passed since the previous refresh. `None` until the first refresh.
    fn read(&mut self, now: Instant, refresh: impl FnOnce() -> Option<f64>) -> Option<f64> {
        if now.saturating_duration_since(self.last_refresh) >= self.min_interval {
            self.value = refresh().filter(|v| v.is_finite());
            self.last_refresh = now;
        }
        self.value
    }
}

/// Probe backed by `sysinfo`, falling back to the OS load average for CPU.
pub struct SysinfoProbe {
    system: System,
    pid: Pid,
    cpu: CpuCache,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters so the first real reading has a baseline.
        system.refresh_cpu_usage();
        Self {
            system,
            pid: Pid::from(std::process::id() as usize),
            cpu: CpuCache::new(MINIMUM_CPU_UPDATE_INTERVAL, Instant::now()),
        }
    }

    fn load_average_percent() -> f64 {
        let load = System::load_average();
        if load.one.is_finite() && load.one > 0.0 {
            (load.one * 100.0).min(100.0)
        } else {
            0.0
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn probe(&mut self) -> RawUsage {
        let system = &mut self.system;
        let cpu_percent = self
            .cpu
            .read(Instant::now(), || {
                system.refresh_cpu_usage();
                if system.cpus().is_empty() {
                    None
                } else {
                    Some(f64::from(system.global_cpu_usage()))
                }
            })
            .unwrap_or_else(Self::load_average_percent);

        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);

        let total = self.system.total_memory();
        let memory_percent = if total > 0 {
            self.system.used_memory() as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        let rss_mb = self
            .system
            .process(self.pid)
            .map_or(0.0, |p| p.memory() as f64 / (1024.0 * 1024.0));

        RawUsage {
            cpu_percent,
            memory_percent,
            rss_mb,
        }
    }
}

/// Probe that always reports the same figures. Useful for deterministic runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub RawUsage);

impl StaticProbe {
    pub fn new(cpu_percent: f64, memory_percent: f64, rss_mb: f64) -> Self {
        Self(RawUsage {
            cpu_percent,
            memory_percent,
            rss_mb,
        })
    }
}

impl ResourceProbe for StaticProbe {
    fn probe(&mut self) -> RawUsage {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_probe_never_negative() {
        let mut probe = SysinfoProbe::new();
        let usage = probe.probe();
        assert!(usage.cpu_percent >= 0.0);
        assert!(usage.memory_percent >= 0.0 && usage.memory_percent <= 100.0);
        assert!(usage.rss_mb >= 0.0);
    }

    #[test]
    fn test_cpu_cache_waits_for_minimum_interval() {
        let start = Instant::now();
        let at = |ms: u64| start + Duration::from_millis(ms);
        let mut cache = CpuCache::new(Duration::from_millis(200), start);
        let mut refreshes = 0;

        // too soon after priming
        assert_eq!(cache.read(at(50), || { refreshes += 1; Some(10.0) }), None);

        assert_eq!(cache.read(at(200), || { refreshes += 1; Some(95.0) }), Some(95.0));

        // back-to-back reads reuse the cached figure
        for ms in [201, 250, 399] {
            assert_eq!(cache.read(at(ms), || { refreshes += 1; Some(5.0) }), Some(95.0));
        }

        assert_eq!(cache.read(at(400), || { refreshes += 1; Some(97.0) }), Some(97.0));
        assert_eq!(refreshes, 2);
    }

    #[test]
    fn test_cpu_cache_drops_non_finite_readings() {
        let start = Instant::now();
        let mut cache = CpuCache::new(Duration::from_millis(10), start);
        let later = start + Duration::from_millis(10);
        assert_eq!(cache.read(later, || Some(f64::NAN)), None);
        assert_eq!(cache.read(later + Duration::from_millis(10), || None), None);
    }

    #[test]
    fn test_sysinfo_rapid_samples_stay_in_range() {
        let mut probe = SysinfoProbe::new();
        for _ in 0..10 {
            let usage = probe.probe();
            assert!((0.0..=100.0).contains(&usage.cpu_percent));
        }
    }

    #[test]
    fn test_static_probe() {
        let mut probe = StaticProbe::new(10.0, 20.0, 30.0);
        assert_eq!(probe.probe().memory_percent, 20.0);
        assert_eq!(probe.probe().rss_mb, 30.0);
    }
}
