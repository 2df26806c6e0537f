//! Stage declarations, the run context and per-stage results.

use super::handler::WorkItemResult;
use crate::abort::AbortState;
use crate::error::{ContextError, StageError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// How a stage invokes its handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyMode {
    /// One handler call for the whole stage
    #[default]
    Sync,
    /// Fan out over work items under the adaptive worker budget
    BoundedParallel,
}

impl std::fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyMode::Sync => write!(f, "sync"),
            ConcurrencyMode::BoundedParallel => write!(f, "bounded_parallel"),
        }
    }
}

/// Static declaration of one pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Position in the pipeline, starting at 0
    pub id: u32,

    /// Human-readable name used in logs and metrics
    pub label: String,

    #[serde(default)]
    pub mode: ConcurrencyMode,

    /// Name of the handler in the registry
    pub handler: String,

    /// Context keys passed to the handler
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Context key the stage output is stored under
    pub output: String,

    /// Stage deadline in milliseconds. No deadline when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Expected item count, used for progress and snapshot cadence
    #[serde(default)]
    pub item_target: Option<u64>,
}

impl StageDescriptor {
    pub fn new(
        id: u32,
        label: impl Into<String>,
        mode: ConcurrencyMode,
        handler: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            mode,
            handler: handler.into(),
            inputs: Vec::new(),
            output: output.into(),
            timeout_ms: None,
            item_target: None,
        }
    }

    pub fn sync(id: u32, label: impl Into<String>, handler: impl Into<String>, output: impl Into<String>) -> Self {
        Self::new(id, label, ConcurrencyMode::Sync, handler, output)
    }

    pub fn bounded_parallel(
        id: u32,
        label: impl Into<String>,
        handler: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::new(id, label, ConcurrencyMode::BoundedParallel, handler, output)
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_item_target(mut self, item_target: u64) -> Self {
        self.item_target = Some(item_target);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Lifecycle state of a single stage within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    NotStarted,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Failed | StageStatus::Aborted)
    }
}

/// Counts over the work items of a bounded-parallel stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    /// Items returned by the planner
    pub planned: usize,
    /// Items that produced a payload
    pub succeeded: usize,
    /// Items whose handler returned an error
    pub failed: usize,
    /// Items skipped because their circuit was open
    pub short_circuited: usize,
}

impl ItemSummary {
    pub fn from_results(planned: usize, results: &[WorkItemResult]) -> Self {
        let mut summary = Self {
            planned,
            ..Self::default()
        };
        for result in results {
            if result.circuit_open {
                summary.short_circuited += 1;
            } else if result.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
        }
        summary
    }

    /// Items that were dispatched to a worker.
    pub fn dispatched(&self) -> usize {
        self.succeeded + self.failed + self.short_circuited
    }
}

impl std::fmt::Display for ItemSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} planned, {} ok, {} failed, {} short-circuited",
            self.planned, self.succeeded, self.failed, self.short_circuited
        )
    }
}

/// Immutable record of one attempted stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage_id: u32,
    pub label: String,
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<StageError>,
    pub duration_ms: f64,
    pub aborted: bool,
    /// Per-item results in dispatch order (bounded-parallel stages only)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<WorkItemResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_summary: Option<ItemSummary>,
}

impl StageResult {
    pub fn status(&self) -> StageStatus {
        if self.success {
            StageStatus::Completed
        } else if self.aborted {
            StageStatus::Aborted
        } else {
            StageStatus::Failed
        }
    }
}

/// Terminal state of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed,
    Aborted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Failed => write!(f, "failed"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Everything a run produced: the audit trail plus the final context.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// One entry per attempted stage, in stage order
    pub results: Vec<StageResult>,
    pub stage_status: BTreeMap<u32, StageStatus>,
    pub context: PipelineContext,
    pub abort: AbortState,
}

impl RunReport {
    pub fn result(&self, stage_id: u32) -> Option<&StageResult> {
        self.results.iter().find(|r| r.stage_id == stage_id)
    }

    pub fn status(&self, stage_id: u32) -> StageStatus {
        self.stage_status.get(&stage_id).copied().unwrap_or_default()
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Append-only map from output key to stage output.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineContext {
    values: BTreeMap<String, Value>,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value. Existing keys are never overwritten.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), ContextError> {
        let key = key.into();
        if self.values.contains_key(&key) {
            return Err(ContextError::KeyExists { key });
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for PipelineContext {
    fn from_iter<T: IntoIterator<Item = (K, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}
