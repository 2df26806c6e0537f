//! Shared run state read by status pollers and the progress reporter.

use super::instrumentation::{PhaseInstrumentation, PhaseMetrics};
use super::stage::StageStatus;
use super::status::{ProcessingStatus, RunStatus};
use crate::abort::AbortState;
use crate::resources::ResourceSample;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Debug, Default)]
struct TrackerState {
    run: u64,
    status: RunStatus,
    started: Option<Instant>,
    finished: Option<Instant>,
    current_stage: Option<u32>,
    stage_status: BTreeMap<u32, StageStatus>,
    instrumentation: BTreeMap<u32, Arc<PhaseInstrumentation>>,
}

/// Per-run bookkeeping owned by the orchestrator.
///
/// Only the orchestrator loop writes; readers take short read locks and never
/// wait on stage work.
#[derive(Debug, Default)]
pub struct RunTracker {
    state: RwLock<TrackerState>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a new run with every stage `NotStarted`.
    pub fn begin(&self, stage_ids: impl IntoIterator<Item = u32>) {
        let mut state = self.write();
        *state = TrackerState {
            run: state.run + 1,
            status: RunStatus::Running,
            started: Some(Instant::now()),
            stage_status: stage_ids
                .into_iter()
                .map(|id| (id, StageStatus::NotStarted))
                .collect(),
            ..TrackerState::default()
        };
    }

    pub fn stage_started(&self, stage_id: u32, instrumentation: Arc<PhaseInstrumentation>) {
        let mut state = self.write();
        state.current_stage = Some(stage_id);
        state.stage_status.insert(stage_id, StageStatus::Running);
        state.instrumentation.insert(stage_id, instrumentation);
    }

    pub fn set_stage_status(&self, stage_id: u32, status: StageStatus) {
        self.write().stage_status.insert(stage_id, status);
    }

    pub fn finish(&self, status: RunStatus) {
        let mut state = self.write();
        state.status = status;
        state.finished = Some(Instant::now());
        state.current_stage = None;
    }

    pub fn status(&self) -> RunStatus {
        self.read().status
    }

    pub fn stage_status(&self) -> BTreeMap<u32, StageStatus> {
        self.read().stage_status.clone()
    }

    pub fn phase_metrics(&self) -> BTreeMap<u32, PhaseMetrics> {
        let instrumentation: Vec<_> = self.read().instrumentation.values().cloned().collect();
        instrumentation
            .into_iter()
            .map(|inst| (inst.stage_id(), inst.build_metrics()))
            .collect()
    }

    pub fn snapshot(&self, resource_usage: Option<ResourceSample>, abort: AbortState) -> ProcessingStatus {
        let state = self.read();

        let total_stages = state.stage_status.len();
        let completed_stages = state
            .stage_status
            .values()
            .filter(|s| **s == StageStatus::Completed)
            .count();
        let overall_progress = if total_stages > 0 {
            completed_stages as f64 / total_stages as f64
        } else {
            0.0
        };

        let elapsed_secs = match state.started {
            Some(start) => state
                .finished
                .unwrap_or_else(Instant::now)
                .duration_since(start)
                .as_secs_f64(),
            None => 0.0,
        };

        ProcessingStatus {
            run: state.run,
            status: state.status,
            overall_progress,
            current_stage: state.current_stage,
            stage_progress: state
                .instrumentation
                .iter()
                .map(|(id, inst)| (*id, inst.progress()))
                .collect(),
            stage_status: state.stage_status.clone(),
            completed_stages,
            total_stages,
            elapsed_secs,
            resource_usage,
            abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_before_run() {
        let tracker = RunTracker::new();
        let status = tracker.snapshot(None, AbortState::default());
        assert_eq!(status.run, 0);
        assert_eq!(status.status, RunStatus::NotStarted);
        assert_eq!(status.overall_progress, 0.0);
        assert_eq!(status.elapsed_secs, 0.0);
    }

    #[test]
    fn test_run_lifecycle() {
        let tracker = RunTracker::new();
        tracker.begin([0, 1, 2]);
        assert_eq!(tracker.status(), RunStatus::Running);

        let inst = Arc::new(PhaseInstrumentation::new(0, "ingest", 10, None));
        inst.start(Some(4));
        inst.increment(2, None);
        tracker.stage_started(0, inst);

        let status = tracker.snapshot(None, AbortState::default());
        assert_eq!(status.current_stage, Some(0));
        assert_eq!(status.stage_progress[&0], Some(0.5));
        assert_eq!(status.stage_status[&1], StageStatus::NotStarted);

        tracker.set_stage_status(0, StageStatus::Completed);
        tracker.finish(RunStatus::Failed);

        let status = tracker.snapshot(None, AbortState::default());
        assert_eq!(status.status, RunStatus::Failed);
        assert_eq!(status.completed_stages, 1);
        assert!((status.overall_progress - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(tracker.phase_metrics().len(), 1);
    }

    #[test]
    fn test_begin_clears_previous_run() {
        let tracker = RunTracker::new();
        tracker.begin([0]);
        tracker.stage_started(0, Arc::new(PhaseInstrumentation::new(0, "a", 10, None)));
        tracker.finish(RunStatus::Completed);

        tracker.begin([0, 1]);
        assert!(tracker.phase_metrics().is_empty());
        assert_eq!(tracker.stage_status().len(), 2);

        let status = tracker.snapshot(None, AbortState::default());
        assert_eq!(status.run, 2);
        assert_eq!(status.status, RunStatus::Running);
    }
}
