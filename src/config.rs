//! Configuration for the phase pipeline.

use crate::pipeline::StageDescriptor;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Ordered stage declarations
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Resource ceilings and worker budget bounds
    #[serde(default)]
    pub resources: ResourceConfig,

    /// Per-work-class circuit breaker settings
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Per-stage telemetry settings
    #[serde(default)]
    pub instrumentation: InstrumentationConfig,

    /// Progress reporting and metrics export
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Stage list configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in execution order. Ids must run 0..n without gaps.
    #[serde(default)]
    pub stages: Vec<StageDescriptor>,
}

/// Resource ceilings used by the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Process RSS ceiling in MB. `null` disables memory checks.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: Option<f64>,

    /// CPU ceiling in percent
    #[serde(default = "default_max_cpu_percent")]
    pub max_cpu_percent: f64,

    /// Lower bound for the worker budget
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    /// Initial worker budget
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Upper bound the budget may grow to
    #[serde(default = "default_hard_max_workers")]
    pub hard_max_workers: usize,

    /// Number of resource samples retained
    #[serde(default = "default_history")]
    pub history: usize,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_cpu_percent: default_max_cpu_percent(),
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            hard_max_workers: default_hard_max_workers(),
            history: default_history(),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a work class's circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Instrumentation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentationConfig {
    /// Capture a resource snapshot every N processed items
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval: u64,

    /// Record a progress event every N processed work items
    #[serde(default = "default_progress_log_interval")]
    pub progress_log_interval: u64,
}

impl Default for InstrumentationConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: default_snapshot_interval(),
            progress_log_interval: default_progress_log_interval(),
        }
    }
}

/// Monitoring configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    /// Log periodic progress while a run is active
    #[serde(default = "default_true")]
    pub enable_progress: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_progress_interval")]
    pub progress_interval_secs: u64,

    /// Optional path to save the metrics export JSON after each run
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enable_progress: true,
            progress_interval_secs: default_progress_interval(),
            metrics_output_path: None,
        }
    }
}

impl Config {
    /// Configuration with the given stages and default settings elsewhere.
    pub fn with_stages(stages: Vec<StageDescriptor>) -> Self {
        Self {
            pipeline: PipelineConfig { stages },
            ..Self::default()
        }
    }

    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate settings that do not depend on registered handlers.
    ///
    /// Stage-list structure is checked when the orchestrator is built.
    pub fn validate(&self) -> anyhow::Result<()> {
        let res = &self.resources;
        if let Some(limit) = res.max_memory_mb {
            if !(limit > 0.0) {
                anyhow::bail!("max_memory_mb must be > 0 when set");
            }
        }
        if !(0.0..=100.0).contains(&res.max_cpu_percent) {
            anyhow::bail!("max_cpu_percent must be within 0-100");
        }
        if res.history == 0 {
            anyhow::bail!("Resource history must be > 0");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            anyhow::bail!("Circuit breaker failure_threshold must be > 0");
        }
        if self.instrumentation.snapshot_interval == 0 {
            anyhow::bail!("snapshot_interval must be > 0");
        }
        if self.instrumentation.progress_log_interval == 0 {
            anyhow::bail!("progress_log_interval must be > 0");
        }
        if self.monitoring.enable_progress && self.monitoring.progress_interval_secs == 0 {
            anyhow::bail!("progress_interval_secs must be > 0 when progress is enabled");
        }
        for stage in &self.pipeline.stages {
            if stage.timeout_ms == Some(0) {
                anyhow::bail!("Stage {} ({}) has a zero timeout", stage.id, stage.label);
            }
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_max_memory_mb() -> Option<f64> { Some(4096.0) }
fn default_max_cpu_percent() -> f64 { 85.0 }
fn default_min_workers() -> usize { 4 }
fn default_max_workers() -> usize { 32 }
fn default_hard_max_workers() -> usize { 64 }
fn default_history() -> usize { 120 }
fn default_failure_threshold() -> u32 { 3 }
fn default_snapshot_interval() -> u64 { 10 }
fn default_progress_log_interval() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_progress_interval() -> u64 { 2 }
