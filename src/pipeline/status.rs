//! Pollable status, health and metrics-export views of a run.

use super::circuit::CircuitState;
use super::instrumentation::PhaseMetrics;
use super::stage::{RunOutcome, StageStatus};
use crate::abort::AbortState;
use crate::resources::{ResourceLimits, ResourceSample};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Run-level state as seen by an external poller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    /// Whether the run has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Aborted)
    }
}

impl From<RunOutcome> for RunStatus {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Completed => RunStatus::Completed,
            RunOutcome::Failed => RunStatus::Failed,
            RunOutcome::Aborted => RunStatus::Aborted,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::NotStarted => "not_started",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Non-blocking snapshot of a run in progress.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingStatus {
    /// Runs started so far, 0 before the first run
    pub run: u64,
    pub status: RunStatus,
    /// Fraction of stages completed
    pub overall_progress: f64,
    pub current_stage: Option<u32>,
    /// Item progress per started stage, `None` when the stage has no item target
    pub stage_progress: BTreeMap<u32, Option<f64>>,
    pub stage_status: BTreeMap<u32, StageStatus>,
    pub completed_stages: usize,
    pub total_stages: usize,
    pub elapsed_secs: f64,
    pub resource_usage: Option<ResourceSample>,
    pub abort: AbortState,
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:.1}%] {} | stages {}/{}",
            self.overall_progress * 100.0,
            self.status,
            self.completed_stages,
            self.total_stages
        )?;

        if let Some(stage) = self.current_stage {
            match self.stage_progress.get(&stage).copied().flatten() {
                Some(p) => write!(f, " | stage {} {:.1}%", stage, p * 100.0)?,
                None => write!(f, " | stage {}", stage)?,
            }
        }

        if let Some(usage) = &self.resource_usage {
            write!(
                f,
                " | cpu {:.1}% mem {:.1}% rss {:.0}MB | budget {}",
                usage.cpu_percent, usage.memory_percent, usage.rss_mb, usage.worker_budget
            )?;
        }

        write!(f, " | elapsed {:.1}s", self.elapsed_secs)?;

        if let Some(reason) = &self.abort.reason {
            write!(f, " | aborted: {}", reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health score and the reading it was computed from.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// 0-100, higher is healthier
    pub score: f64,
    pub resource_usage: ResourceSample,
    pub open_circuits: usize,
    pub abort: AbortState,
}

impl HealthReport {
    /// Score from CPU and memory headroom, 50 points each.
    ///
    /// Memory only contributes when a memory ceiling is configured. An aborted
    /// run scores at most 20.
    pub fn score(limits: &ResourceLimits, usage: &ResourceSample, aborted: bool) -> f64 {
        let cpu_headroom = (limits.max_cpu_percent - usage.cpu_percent).max(0.0);
        let mut score = (cpu_headroom / limits.max_cpu_percent.max(1.0) * 50.0).clamp(0.0, 100.0);

        if let Some(max_memory) = limits.max_memory_mb.filter(|m| *m > 0.0) {
            let mem_headroom = (max_memory - usage.rss_mb).max(0.0);
            score += (mem_headroom / max_memory.max(1.0) * 50.0).clamp(0.0, 50.0);
        }

        let score = score.min(100.0);
        if aborted {
            score.min(20.0)
        } else {
            score
        }
    }
}

/// Everything worth shipping to an external monitor after a run.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsExport {
    pub timestamp: DateTime<Utc>,
    pub phase_metrics: BTreeMap<u32, PhaseMetrics>,
    pub resource_history: Vec<ResourceSample>,
    pub circuits: Vec<CircuitState>,
    pub stage_status: BTreeMap<u32, StageStatus>,
    pub abort: AbortState,
}

impl MetricsExport {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;

    fn usage(cpu: f64, rss: f64) -> ResourceSample {
        ResourceSample {
            timestamp: Utc::now(),
            cpu_percent: cpu,
            memory_percent: 10.0,
            rss_mb: rss,
            worker_budget: 4,
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RunStatus::NotStarted.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_health_score() {
        let limits = ResourceLimits::from(&ResourceConfig {
            max_cpu_percent: 80.0,
            max_memory_mb: Some(1000.0),
            ..ResourceConfig::default()
        });

        // idle: full headroom on both
        assert_eq!(HealthReport::score(&limits, &usage(0.0, 0.0), false), 100.0);
        // half cpu, quarter memory used
        assert_eq!(HealthReport::score(&limits, &usage(40.0, 250.0), false), 25.0 + 37.5);
        // saturated
        assert_eq!(HealthReport::score(&limits, &usage(95.0, 2000.0), false), 0.0);
        // aborted cap
        assert_eq!(HealthReport::score(&limits, &usage(0.0, 0.0), true), 20.0);
    }

    #[test]
    fn test_health_score_without_memory_ceiling() {
        let limits = ResourceLimits::from(&ResourceConfig {
            max_cpu_percent: 50.0,
            max_memory_mb: None,
            ..ResourceConfig::default()
        });
        assert_eq!(HealthReport::score(&limits, &usage(0.0, 1e6), false), 50.0);
    }

    #[test]
    fn test_status_display() {
        let status = ProcessingStatus {
            run: 1,
            status: RunStatus::Running,
            overall_progress: 1.0 / 3.0,
            current_stage: Some(1),
            stage_progress: BTreeMap::from([(0, None), (1, Some(0.5))]),
            stage_status: BTreeMap::new(),
            completed_stages: 1,
            total_stages: 3,
            elapsed_secs: 2.0,
            resource_usage: Some(usage(12.0, 64.0)),
            abort: AbortState::default(),
        };
        let display = format!("{}", status);
        assert!(display.starts_with("[33.3%] running"));
        assert!(display.contains("stages 1/3"));
        assert!(display.contains("stage 1 50.0%"));
        assert!(display.contains("budget 4"));
    }

    #[test]
    fn test_run_status_from_outcome() {
        assert_eq!(RunStatus::from(RunOutcome::Aborted), RunStatus::Aborted);
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }
}
