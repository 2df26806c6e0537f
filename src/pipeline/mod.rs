//! Stage sequencing, fan-out execution and run telemetry.

mod circuit;
mod fanout;
mod handler;
mod instrumentation;
mod orchestrator;
mod reporter;
mod stage;
mod status;
mod tracker;


pub use circuit::{CircuitBreaker, CircuitState, CircuitTransition};
pub use fanout::sort_items;
pub use handler::{
    HandlerKind, HandlerRegistry, StageHandler, StageInputs, WorkItem, WorkItemHandler,
    WorkItemResult, CIRCUIT_OPEN_MARKER,
};
pub use instrumentation::{
    EventEntry, LatencyAnomaly, LatencyHistogram, PhaseInstrumentation, PhaseMetrics,
    ResourceSnapshot,
};
pub use orchestrator::{validate_stages, PhaseOrchestrator};
pub use reporter::ProgressReporter;
pub use stage::{
    ConcurrencyMode, ItemSummary, PipelineContext, RunOutcome, RunReport, StageDescriptor,
    StageResult, StageStatus,
};
pub use status::{HealthReport, HealthStatus, MetricsExport, ProcessingStatus, RunStatus};
pub use tracker::RunTracker;
