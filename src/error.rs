//! Typed errors for pipeline construction and stage execution.
//!
//! Construction errors are fatal: no orchestrator is built. Stage errors are
//! values carried in [`StageResult`](crate::pipeline::StageResult) and never
//! unwind across task boundaries.

use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Static stage-list problems detected when an orchestrator is built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConstructionError {
    #[error("stage list is empty")]
    EmptyStageList,

    #[error("duplicate stage id {0}")]
    DuplicateStageId(u32),

    #[error("stage ids are not sorted ascending: {0:?}")]
    UnsortedStageIds(Vec<u32>),

    #[error("first stage id must be 0, got {0}")]
    FirstIdNotZero(u32),

    #[error("stage ids are not contiguous: expected last id {expected_last}, got {actual_last}")]
    NonContiguous { expected_last: u32, actual_last: u32 },

    #[error("stage {stage_id} ({label}) references unknown handler '{handler}'")]
    UnknownHandler {
        stage_id: u32,
        label: String,
        handler: String,
    },

    #[error("stage {stage_id} ({label}) runs {mode} but handler '{handler}' is a {kind} handler")]
    ModeMismatch {
        stage_id: u32,
        label: String,
        handler: String,
        mode: String,
        kind: String,
    },

    #[error("output key '{key}' is produced by both stage {first} and stage {second}")]
    DuplicateOutputKey { key: String, first: u32, second: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A stage exceeded its configured deadline.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Phase {stage_id} ({label}) timed out after {:.3}s", .timeout.as_secs_f64())]
pub struct PhaseTimeoutError {
    pub stage_id: u32,
    pub label: String,
    #[serde(serialize_with = "serialize_duration")]
    pub timeout: Duration,
}

/// Why a stage did not produce its output.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    #[error(transparent)]
    Timeout(PhaseTimeoutError),

    #[error("handler failed: {message}")]
    Handler { message: String },

    #[error("stage {stage_id} is missing input '{key}'")]
    MissingInput { stage_id: u32, key: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("aborted: {reason}")]
    Aborted { reason: String },
}

impl StageError {
    /// True when the stage ran past its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, StageError::Timeout(_))
    }

    /// Short category used when recording the error in instrumentation.
    pub fn category(&self) -> &'static str {
        match self {
            StageError::Timeout(_) => "timeout",
            StageError::Handler { .. } => "exception",
            StageError::MissingInput { .. } => "missing_input",
            StageError::Context(_) => "context",
            StageError::Aborted { .. } => "aborted",
        }
    }
}

/// Errors raised by the append-only pipeline context.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextError {
    #[error("context key '{key}' already holds a value")]
    KeyExists { key: String },
}
