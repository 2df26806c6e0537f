//! The pipeline state machine.
//!
//! Stages run strictly in ascending id order. Each stage resolves its inputs
//! from the [`PipelineContext`], runs under an optional deadline and either
//! appends its output to the context or stops the run. Every attempted stage
//! leaves a [`StageResult`], so a failed run still carries its audit trail.

use super::circuit::CircuitBreaker;
use super::fanout::{FanOut, ItemSink};
use super::handler::{HandlerKind, HandlerRegistry, StageInputs};
use super::instrumentation::{PhaseInstrumentation, PhaseMetrics};
use super::reporter::ProgressReporter;
use super::stage::{
    ConcurrencyMode, ItemSummary, PipelineContext, RunOutcome, RunReport, StageDescriptor,
    StageResult, StageStatus,
};
use super::status::{HealthReport, HealthStatus, MetricsExport, ProcessingStatus, RunStatus};
use super::tracker::RunTracker;
use crate::abort::AbortSignal;
use crate::config::Config;
use crate::error::{ConstructionError, PhaseTimeoutError, StageError};
use crate::resources::{ResourceMonitor, ResourceProbe};
use chrono::Utc;
use futures::Stream;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Check the static stage list against the registry.
///
/// Any problem here is fatal: no orchestrator is built from an invalid list.
pub fn validate_stages(
    stages: &[StageDescriptor],
    registry: &HandlerRegistry,
) -> Result<(), ConstructionError> {
    if stages.is_empty() {
        return Err(ConstructionError::EmptyStageList);
    }

    let ids: Vec<u32> = stages.iter().map(|s| s.id).collect();

    let mut seen = HashSet::with_capacity(ids.len());
    for id in &ids {
        if !seen.insert(*id) {
            return Err(ConstructionError::DuplicateStageId(*id));
        }
    }

    if ids.windows(2).any(|w| w[0] > w[1]) {
        return Err(ConstructionError::UnsortedStageIds(ids));
    }

    if ids[0] != 0 {
        return Err(ConstructionError::FirstIdNotZero(ids[0]));
    }

    let expected_last = (ids.len() - 1) as u32;
    let actual_last = ids[ids.len() - 1];
    if actual_last != expected_last {
        return Err(ConstructionError::NonContiguous {
            expected_last,
            actual_last,
        });
    }

    for stage in stages {
        let Some(kind) = registry.kind(&stage.handler) else {
            return Err(ConstructionError::UnknownHandler {
                stage_id: stage.id,
                label: stage.label.clone(),
                handler: stage.handler.clone(),
            });
        };

        let expected = match stage.mode {
            ConcurrencyMode::Sync => HandlerKind::Stage,
            ConcurrencyMode::BoundedParallel => HandlerKind::FanOut,
        };
        if kind != expected {
            return Err(ConstructionError::ModeMismatch {
                stage_id: stage.id,
                label: stage.label.clone(),
                handler: stage.handler.clone(),
                mode: stage.mode.to_string(),
                kind: kind.to_string(),
            });
        }
    }

    let mut outputs: HashMap<&str, u32> = HashMap::with_capacity(stages.len());
    for stage in stages {
        if let Some(first) = outputs.insert(stage.output.as_str(), stage.id) {
            return Err(ConstructionError::DuplicateOutputKey {
                key: stage.output.clone(),
                first,
                second: stage.id,
            });
        }
    }

    Ok(())
}

fn handler_error(e: anyhow::Error) -> StageError {
    StageError::Handler {
        message: format!("{:#}", e),
    }
}

/// Run handler code on the blocking pool so the scheduler never stalls on it.
async fn blocking<T, F>(f: F) -> Result<T, StageError>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(outcome) => outcome.map_err(handler_error),
        Err(e) => Err(StageError::Handler {
            message: format!("handler panicked: {}", e),
        }),
    }
}

/// Sequences validated stages over a shared context.
pub struct PhaseOrchestrator {
    config: Arc<Config>,
    registry: Arc<HandlerRegistry>,
    abort: Arc<AbortSignal>,
    monitor: Arc<ResourceMonitor>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<RunTracker>,
    run_lock: Mutex<()>,
}

impl std::fmt::Debug for PhaseOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseOrchestrator")
            .field("stages", &self.config.pipeline.stages.len())
            .field("registry", &self.registry)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl PhaseOrchestrator {
    /// Build an orchestrator that samples live system resources.
    pub fn new(config: Config, registry: HandlerRegistry) -> Result<Self, ConstructionError> {
        Self::check(&config, &registry)?;
        let monitor = ResourceMonitor::new(&config.resources);
        Ok(Self::assemble(config, registry, monitor))
    }

    /// Build an orchestrator with a custom resource probe.
    pub fn with_probe(
        config: Config,
        registry: HandlerRegistry,
        probe: impl ResourceProbe + 'static,
    ) -> Result<Self, ConstructionError> {
        Self::check(&config, &registry)?;
        let monitor = ResourceMonitor::with_probe(&config.resources, probe);
        Ok(Self::assemble(config, registry, monitor))
    }

    fn check(config: &Config, registry: &HandlerRegistry) -> Result<(), ConstructionError> {
        config
            .validate()
            .map_err(|e| ConstructionError::InvalidConfig(format!("{:#}", e)))?;
        validate_stages(&config.pipeline.stages, registry)
    }

    fn assemble(config: Config, registry: HandlerRegistry, monitor: ResourceMonitor) -> Self {
        let breaker = CircuitBreaker::new(config.circuit_breaker.failure_threshold);
        tracing::info!(
            "Pipeline ready: {} stages, {} handlers, worker budget {} ({}..={})",
            config.pipeline.stages.len(),
            registry.len(),
            monitor.worker_budget(),
            monitor.limits().min_workers,
            monitor.limits().hard_max_workers
        );

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            abort: Arc::new(AbortSignal::new()),
            monitor: Arc::new(monitor),
            breaker: Arc::new(breaker),
            tracker: Arc::new(RunTracker::new()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.config.pipeline.stages
    }

    pub fn abort_signal(&self) -> Arc<AbortSignal> {
        self.abort.clone()
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Ask the current run to stop. Returns false if an abort was already set.
    pub fn request_abort(&self, reason: impl Into<String>) -> bool {
        self.abort.abort(reason)
    }

    /// Clear the abort signal and circuit state so the orchestrator can run again.
    pub fn reset(&self) {
        self.abort.reset();
        self.breaker.reset();
        tracing::info!("Orchestrator reset");
    }

    /// Run every stage in order, starting from `seed`.
    ///
    /// A set abort signal is not cleared here; call [`reset`](Self::reset)
    /// between runs.
    pub async fn run(&self, seed: PipelineContext) -> RunReport {
        let _guard = self.run_lock.lock().await;

        self.breaker.reset();
        self.monitor.reset().await;

        let stages = &self.config.pipeline.stages;
        self.tracker.begin(stages.iter().map(|s| s.id));

        tracing::info!("Starting pipeline run with {} stages", stages.len());
        let run_start = Instant::now();

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.monitoring.enable_progress {
            let reporter = ProgressReporter::new(
                self.tracker.clone(),
                self.monitor.clone(),
                self.abort.clone(),
                self.config.monitoring.progress_interval_secs,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let mut context = seed;
        let mut results = Vec::with_capacity(stages.len());
        let mut outcome = RunOutcome::Completed;

        for stage in stages {
            if self.abort.is_aborted() {
                tracing::warn!(
                    "Abort observed before stage {} ({}): {}",
                    stage.id,
                    stage.label,
                    self.abort.reason().unwrap_or_default()
                );
                outcome = RunOutcome::Aborted;
                break;
            }

            let result = self.run_stage(stage, &mut context).await;
            let status = result.status();
            self.tracker.set_stage_status(stage.id, status);
            results.push(result);

            match status {
                StageStatus::Failed => {
                    outcome = RunOutcome::Failed;
                    break;
                }
                StageStatus::Aborted => {
                    outcome = RunOutcome::Aborted;
                    break;
                }
                _ => {}
            }
        }

        self.tracker.finish(RunStatus::from(outcome));

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if let Some(path) = &self.config.monitoring.metrics_output_path {
            if let Err(e) = self.export_metrics().save_to_file(path) {
                tracing::warn!("Failed to save metrics to {}: {:#}", path, e);
            }
        }

        tracing::info!(
            "Pipeline run {} in {:.1}s ({}/{} stages attempted)",
            outcome,
            run_start.elapsed().as_secs_f64(),
            results.len(),
            stages.len()
        );

        RunReport {
            outcome,
            results,
            stage_status: self.tracker.stage_status(),
            context,
            abort: self.abort.state(),
        }
    }

    async fn run_stage(&self, stage: &StageDescriptor, context: &mut PipelineContext) -> StageResult {
        let instrumentation = Arc::new(PhaseInstrumentation::new(
            stage.id,
            stage.label.clone(),
            self.config.instrumentation.snapshot_interval,
            Some(self.monitor.clone()),
        ));
        self.tracker.stage_started(stage.id, instrumentation.clone());
        instrumentation.start(stage.item_target);

        tracing::info!("Stage {} ({}) started [{}]", stage.id, stage.label, stage.mode);

        let sink = Arc::new(ItemSink::default());
        let outcome = match resolve_inputs(stage, context) {
            Ok(inputs) => self.invoke_with_deadline(stage, inputs, &instrumentation, &sink).await,
            Err(e) => Err(e),
        };
        instrumentation.complete();

        let outcome = outcome.and_then(|payload| {
            if self.abort.is_aborted() {
                return Err(self.aborted());
            }
            context.insert(stage.output.clone(), payload.clone())?;
            Ok(payload)
        });

        let duration_ms = instrumentation.duration_ms().unwrap_or_default();
        let items = sink.sorted();
        let item_summary = (stage.mode == ConcurrencyMode::BoundedParallel)
            .then(|| ItemSummary::from_results(sink.planned(), &items));

        let mut result = StageResult {
            stage_id: stage.id,
            label: stage.label.clone(),
            success: false,
            payload: None,
            error: None,
            duration_ms,
            aborted: false,
            items,
            item_summary,
        };

        match outcome {
            Ok(payload) => {
                match &result.item_summary {
                    Some(summary) => tracing::info!(
                        "Stage {} ({}) completed in {:.1}ms: {}",
                        stage.id,
                        stage.label,
                        duration_ms,
                        summary
                    ),
                    None => tracing::info!(
                        "Stage {} ({}) completed in {:.1}ms",
                        stage.id,
                        stage.label,
                        duration_ms
                    ),
                }
                result.success = true;
                result.payload = Some(payload);
            }
            Err(err @ StageError::Aborted { .. }) => {
                instrumentation.record_warning(
                    "abort",
                    err.to_string(),
                    json!({ "stage_id": stage.id }),
                );
                result.aborted = true;
                result.error = Some(err);
            }
            Err(err) => {
                instrumentation.record_error(
                    err.category(),
                    err.to_string(),
                    json!({ "stage_id": stage.id, "handler": stage.handler }),
                );
                tracing::error!("Stage {} ({}) failed: {}", stage.id, stage.label, err);
                self.abort.abort(err.to_string());
                result.error = Some(err);
            }
        }

        result
    }

    async fn invoke_with_deadline(
        &self,
        stage: &StageDescriptor,
        inputs: StageInputs,
        instrumentation: &Arc<PhaseInstrumentation>,
        sink: &Arc<ItemSink>,
    ) -> Result<Value, StageError> {
        let work = self.invoke(stage, inputs, instrumentation, sink);
        match stage.timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, work).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StageError::Timeout(PhaseTimeoutError {
                    stage_id: stage.id,
                    label: stage.label.clone(),
                    timeout,
                })),
            },
            None => work.await,
        }
    }

    async fn invoke(
        &self,
        stage: &StageDescriptor,
        inputs: StageInputs,
        instrumentation: &Arc<PhaseInstrumentation>,
        sink: &Arc<ItemSink>,
    ) -> Result<Value, StageError> {
        let inputs = Arc::new(inputs);

        match stage.mode {
            ConcurrencyMode::Sync => {
                let handler = self
                    .registry
                    .resolve_stage(&stage.handler)
                    .map_err(handler_error)?;
                blocking(move || handler.handle(&inputs)).await
            }
            ConcurrencyMode::BoundedParallel => {
                let handler = self
                    .registry
                    .resolve_fan_out(&stage.handler)
                    .map_err(handler_error)?;

                let planner = handler.clone();
                let plan_inputs = inputs.clone();
                let items = blocking(move || planner.plan(&plan_inputs)).await?;

                sink.set_planned(items.len());
                if stage.item_target.is_none() {
                    instrumentation.set_items_total(items.len() as u64);
                }

                let fan_out = FanOut {
                    stage_id: stage.id,
                    handler: handler.clone(),
                    inputs,
                    monitor: self.monitor.clone(),
                    breaker: self.breaker.clone(),
                    abort: self.abort.clone(),
                    instrumentation: instrumentation.clone(),
                    progress_log_interval: self.config.instrumentation.progress_log_interval,
                    sink: sink.clone(),
                };
                let completed = fan_out.run(items).await;
                tracing::debug!(
                    "Stage {}: {}/{} items completed",
                    stage.id,
                    completed,
                    sink.planned()
                );

                if self.abort.is_aborted() {
                    return Err(self.aborted());
                }

                let results = sink.sorted();
                blocking(move || handler.reduce(&results)).await
            }
        }
    }

    fn aborted(&self) -> StageError {
        StageError::Aborted {
            reason: self
                .abort
                .reason()
                .unwrap_or_else(|| "Abort requested".to_string()),
        }
    }

    /// Non-blocking snapshot of the current or last run.
    pub fn status(&self) -> ProcessingStatus {
        self.tracker
            .snapshot(self.monitor.latest(), self.abort.state())
    }

    /// Poll [`status`](Self::status) every `poll_interval`.
    ///
    /// The first snapshot is yielded immediately. The stream ends after the
    /// first snapshot taken once the followed run has finished. If the stream
    /// is created after a run already finished, it follows the next run
    /// instead of ending on the stale terminal snapshot.
    pub fn monitor_progress(
        &self,
        poll_interval: Duration,
    ) -> impl Stream<Item = ProcessingStatus> + '_ {
        let initial = self.status();
        let stale_run = initial.status.is_terminal().then_some(initial.run);

        futures::stream::unfold((Some(initial), false), move |(pending, done)| async move {
            if done {
                return None;
            }
            let status = match pending {
                Some(status) => status,
                None => {
                    tokio::time::sleep(poll_interval).await;
                    self.status()
                }
            };
            let done = status.status.is_terminal() && stale_run != Some(status.run);
            Some((status, (None, done)))
        })
    }

    /// Take a fresh resource reading and score it.
    pub fn health_check(&self) -> HealthReport {
        let (memory_exceeded, sample) = self.monitor.check_memory_exceeded(None);
        let (cpu_exceeded, sample) = self.monitor.check_cpu_exceeded(Some(&sample));
        let abort = self.abort.state();
        let score = HealthReport::score(self.monitor.limits(), &sample, abort.is_set);

        let status = if abort.is_set {
            HealthStatus::Unhealthy
        } else if memory_exceeded || cpu_exceeded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            score,
            resource_usage: sample,
            open_circuits: self.breaker.open_count(),
            abort,
        }
    }

    pub fn phase_metrics(&self) -> BTreeMap<u32, PhaseMetrics> {
        self.tracker.phase_metrics()
    }

    pub fn export_metrics(&self) -> MetricsExport {
        MetricsExport {
            timestamp: Utc::now(),
            phase_metrics: self.tracker.phase_metrics(),
            resource_history: self.monitor.history(),
            circuits: self.breaker.snapshot(),
            stage_status: self.tracker.stage_status(),
            abort: self.abort.state(),
        }
    }
}

fn resolve_inputs(stage: &StageDescriptor, context: &PipelineContext) -> Result<StageInputs, StageError> {
    let mut values = BTreeMap::new();
    for key in &stage.inputs {
        let value = context.get(key).ok_or_else(|| StageError::MissingInput {
            stage_id: stage.id,
            key: key.clone(),
        })?;
        values.insert(key.clone(), value.clone());
    }
    Ok(StageInputs::new(stage.id, values))
}
