//! Resource monitor with adaptive worker-budget prediction.

use super::{ConcurrencyGate, ResourceProbe, ResourceSample, SysinfoProbe};
use crate::config::ResourceConfig;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Number of most recent samples averaged for budget prediction.
const PREDICTION_WINDOW: usize = 5;

/// Normalized resource ceilings.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<f64>,
    pub max_cpu_percent: f64,
    pub min_workers: usize,
    /// Initial worker budget, clamped to `[min_workers, hard_max_workers]`.
    pub max_workers: usize,
    pub hard_max_workers: usize,
    pub history: usize,
}

impl From<&ResourceConfig> for ResourceLimits {
    fn from(config: &ResourceConfig) -> Self {
        let min_workers = config.min_workers.max(1);
        let hard_max_workers = config.hard_max_workers.max(min_workers);
        Self {
            max_memory_mb: config.max_memory_mb,
            max_cpu_percent: config.max_cpu_percent,
            min_workers,
            max_workers: config.max_workers.clamp(min_workers, hard_max_workers),
            hard_max_workers,
            history: config.history.max(PREDICTION_WINDOW),
        }
    }
}

impl ResourceLimits {
    /// Next worker budget given the sample history.
    ///
    /// With fewer than five samples the budget is unchanged. Otherwise the
    /// mean of the last five decides: shrink by one under pressure, grow by one
    /// when there is clear headroom.
    pub fn predict_budget(&self, history: &VecDeque<ResourceSample>, current: usize) -> usize {
        if history.len() < PREDICTION_WINDOW {
            return current.clamp(self.min_workers, self.hard_max_workers);
        }

        let recent = history.iter().skip(history.len() - PREDICTION_WINDOW);
        let (cpu_sum, mem_sum) = recent.fold((0.0, 0.0), |(cpu, mem), s| {
            (cpu + s.cpu_percent, mem + s.memory_percent)
        });
        let avg_cpu = cpu_sum / PREDICTION_WINDOW as f64;
        let avg_mem = mem_sum / PREDICTION_WINDOW as f64;

        let cpu_pressure = self.max_cpu_percent > 0.0 && avg_cpu > self.max_cpu_percent * 0.95;
        let mem_pressure = self.max_memory_mb.is_some() && avg_mem > 90.0;

        let next = if cpu_pressure || mem_pressure {
            current.saturating_sub(1).max(self.min_workers)
        } else if avg_cpu < self.max_cpu_percent * 0.6 && avg_mem < 70.0 {
            (current + 1).min(self.hard_max_workers)
        } else {
            current
        };

        next.clamp(self.min_workers, self.hard_max_workers)
    }
}

struct MonitorState {
    probe: Box<dyn ResourceProbe>,
    history: VecDeque<ResourceSample>,
}

/// Samples resources, keeps a bounded history and drives the concurrency gate.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    state: Mutex<MonitorState>,
    budget: AtomicUsize,
    gate: ConcurrencyGate,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("limits", &self.limits)
            .field("budget", &self.worker_budget())
            .field("gate", &self.gate)
            .finish()
    }
}

impl ResourceMonitor {
    /// Monitor backed by live `sysinfo` readings.
    pub fn new(config: &ResourceConfig) -> Self {
        Self::with_probe(config, SysinfoProbe::new())
    }

    pub fn with_probe(config: &ResourceConfig, probe: impl ResourceProbe + 'static) -> Self {
        let limits = ResourceLimits::from(config);
        let budget = limits.max_workers;
        Self {
            state: Mutex::new(MonitorState {
                probe: Box::new(probe),
                history: VecDeque::with_capacity(limits.history),
            }),
            budget: AtomicUsize::new(budget),
            gate: ConcurrencyGate::new(budget),
            limits,
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// Current predicted worker budget.
    pub fn worker_budget(&self) -> usize {
        self.budget.load(Ordering::Acquire)
    }

    /// Take a reading, append it to history and recompute the budget.
    pub fn sample(&self) -> ResourceSample {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let usage = state.probe.probe();
        let current = self.budget.load(Ordering::Acquire);

        let sample = ResourceSample {
            timestamp: Utc::now(),
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            rss_mb: usage.rss_mb,
            worker_budget: current,
        };

        if state.history.len() == self.limits.history {
            state.history.pop_front();
        }
        state.history.push_back(sample.clone());

        let next = self.limits.predict_budget(&state.history, current);
        if next != current {
            tracing::debug!(
                "Worker budget {} -> {} (cpu {:.1}%, mem {:.1}%)",
                current,
                next,
                sample.cpu_percent,
                sample.memory_percent
            );
            self.budget.store(next, Ordering::Release);
        }

        sample
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<ResourceSample> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .back()
            .cloned()
    }

    pub fn history(&self) -> Vec<ResourceSample> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }

    /// Resize the gate to the current budget.
    pub async fn apply_budget(&self) -> usize {
        self.gate.resize(self.worker_budget()).await
    }

    /// Whether process RSS is above the memory ceiling. Samples if `sample` is `None`.
    pub fn check_memory_exceeded(&self, sample: Option<&ResourceSample>) -> (bool, ResourceSample) {
        let sample = sample.cloned().unwrap_or_else(|| self.sample());
        let exceeded = self
            .limits
            .max_memory_mb
            .is_some_and(|limit| sample.rss_mb > limit);
        (exceeded, sample)
    }

    /// Whether CPU usage is above the CPU ceiling. Samples if `sample` is `None`.
    pub fn check_cpu_exceeded(&self, sample: Option<&ResourceSample>) -> (bool, ResourceSample) {
        let sample = sample.cloned().unwrap_or_else(|| self.sample());
        let exceeded =
            self.limits.max_cpu_percent > 0.0 && sample.cpu_percent > self.limits.max_cpu_percent;
        (exceeded, sample)
    }

    /// Drop history and restore the initial budget.
    pub async fn reset(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clear();
        self.budget.store(self.limits.max_workers, Ordering::Release);
        self.apply_budget().await;
    }
}
