//! Phase Pipeline
//!
//! Orchestration engine that drives a fixed sequence of stages over one unit
//! of work, with per-stage deadlines, adaptive concurrency, per-work-class
//! circuit breaking and cooperative cancellation.
//!
//! # Architecture
//!
//! The engine consists of:
//!
//! - **Abort**: write-once cooperative cancellation flag
//! - **Resources**: sampled CPU/memory readings driving a resizable worker gate
//! - **Pipeline**: stage validation, sequencing, fan-out and circuit breaking
//! - **Instrumentation**: per-stage progress, latency anomalies and resource snapshots
//!
//! Stage work is supplied by the caller through [`StageHandler`] and
//! [`WorkItemHandler`] implementations registered in a [`HandlerRegistry`].
//!
//! # Usage
//!
//! ```no_run
//! use phase_pipeline::{run_pipeline, Config, HandlerRegistry, PipelineContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"pipeline.yaml".into())?;
//!
//!     let mut registry = HandlerRegistry::new();
//!     registry.stage_fn("ingest", |_| Ok(json!({ "pages": 12 })));
//!
//!     let report = run_pipeline(config, registry, PipelineContext::new()).await?;
//!     println!("{}", report.outcome);
//!     Ok(())
//! }
//! ```

pub mod abort;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod resources;

pub use abort::{AbortSignal, AbortState};
pub use config::Config;
pub use error::{ConstructionError, ContextError, PhaseTimeoutError, StageError};
pub use pipeline::{
    ConcurrencyMode, HandlerRegistry, PhaseOrchestrator, PipelineContext, RunOutcome, RunReport,
    StageDescriptor, StageHandler, StageInputs, StageResult, WorkItem, WorkItemHandler,
    WorkItemResult,
};
pub use resources::{ResourceMonitor, ResourceSample};

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Build an orchestrator from `config` and run it once.
pub async fn run_pipeline(
    config: Config,
    registry: HandlerRegistry,
    seed: PipelineContext,
) -> Result<RunReport> {
    tracing::info!("Starting phase pipeline");

    let orchestrator = PhaseOrchestrator::new(config, registry)?;
    let report = orchestrator.run(seed).await;

    tracing::info!(
        "Pipeline {}: {} stages attempted",
        report.outcome,
        report.results.len()
    );

    Ok(report)
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`, defaulting to INFO.
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .try_init();
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_runtime() {
        let runtime = build_runtime(Some(2)).unwrap();
        let value = runtime.block_on(async { 21 * 2 });
        assert_eq!(value, 42);
    }

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }

    #[tokio::test]
    async fn test_run_pipeline_rejects_empty_stage_list() {
        let err = run_pipeline(Config::default(), HandlerRegistry::new(), PipelineContext::new())
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<ConstructionError>().is_some());
    }

    #[tokio::test]
    async fn test_run_pipeline() {
        let mut config = Config::with_stages(vec![StageDescriptor::sync(0, "ingest", "ingest", "doc")]);
        config.monitoring.enable_progress = false;

        let mut registry = HandlerRegistry::new();
        registry.stage_fn("ingest", |_| Ok(json!({ "pages": 12 })));

        let report = run_pipeline(config, registry, PipelineContext::new()).await.unwrap();
        assert!(report.is_completed());
        assert_eq!(report.context.get("doc"), Some(&json!({ "pages": 12 })));
    }
}
