//! Per-stage telemetry: counters, latency percentiles, anomalies and
//! resource snapshots.

use crate::resources::{ResourceMonitor, ResourceSample};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Latencies needed before the anomaly check runs.
const MIN_ANOMALY_SAMPLES: usize = 5;

/// A warning or error recorded during a stage.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEntry {
    pub category: String,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Resource sample tagged with the processed count at capture time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    #[serde(flatten)]
    pub sample: ResourceSample,
    pub items_processed: u64,
}

/// Latency that exceeded `mean + 3σ` of the latencies before it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyAnomaly {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub latency_ms: f64,
    pub mean_ms: f64,
    pub std_ms: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyHistogram {
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
}

/// Serializable summary of one stage's instrumentation.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseMetrics {
    pub stage_id: u32,
    pub label: String,
    pub duration_ms: Option<f64>,
    pub items_processed: u64,
    pub items_total: u64,
    pub progress: Option<f64>,
    pub throughput: Option<f64>,
    pub warnings: Vec<EventEntry>,
    pub errors: Vec<EventEntry>,
    pub resource_snapshots: Vec<ResourceSnapshot>,
    pub latency_histogram: LatencyHistogram,
    pub anomalies: Vec<LatencyAnomaly>,
}

#[derive(Debug, Default)]
struct State {
    items_total: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
    warnings: Vec<EventEntry>,
    errors: Vec<EventEntry>,
    snapshots: Vec<ResourceSnapshot>,
    latencies_ms: Vec<f64>,
    anomalies: Vec<LatencyAnomaly>,
}

/// Telemetry collector for one stage of one run.
///
/// `increment` may be called from many workers at once. The processed count
/// is atomic; everything else sits behind a mutex that is never held while
/// sampling resources.
#[derive(Debug)]
pub struct PhaseInstrumentation {
    stage_id: u32,
    label: String,
    snapshot_interval: u64,
    monitor: Option<Arc<ResourceMonitor>>,
    processed: AtomicU64,
    state: Mutex<State>,
}

impl PhaseInstrumentation {
    pub fn new(
        stage_id: u32,
        label: impl Into<String>,
        snapshot_interval: u64,
        monitor: Option<Arc<ResourceMonitor>>,
    ) -> Self {
        Self {
            stage_id,
            label: label.into(),
            snapshot_interval: snapshot_interval.max(1),
            monitor,
            processed: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stage_id(&self) -> u32 {
        self.stage_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Mark the stage as started, optionally setting the item target.
    pub fn start(&self, items_total: Option<u64>) {
        let mut state = self.lock();
        if let Some(total) = items_total {
            state.items_total = total;
        }
        state.started = Some(Instant::now());
        state.finished = None;
    }

    pub fn set_items_total(&self, items_total: u64) {
        self.lock().items_total = items_total;
    }

    pub fn items_total(&self) -> u64 {
        self.lock().items_total
    }

    pub fn items_processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Count processed items and record an optional latency.
    ///
    /// Returns the processed count after the increment.
    pub fn increment(&self, count: u64, latency: Option<Duration>) -> u64 {
        let before = self.processed.fetch_add(count, Ordering::Relaxed);
        let after = before + count;

        let items_total = {
            let mut state = self.lock();
            if let Some(latency) = latency {
                let latency_ms = latency.as_secs_f64() * 1000.0;
                if let Some(anomaly) = detect_anomaly(&state.latencies_ms, latency_ms) {
                    tracing::debug!(
                        "Stage {} latency spike: {:.2}ms (mean {:.2}ms, std {:.2}ms)",
                        self.stage_id,
                        anomaly.latency_ms,
                        anomaly.mean_ms,
                        anomaly.std_ms
                    );
                    state.anomalies.push(anomaly);
                }
                state.latencies_ms.push(latency_ms);
            }
            state.items_total
        };

        // Snapshot whenever the count crosses a multiple of the interval.
        let crossed = before / self.snapshot_interval != after / self.snapshot_interval;
        if items_total > 0 && count > 0 && crossed {
            if let Some(monitor) = &self.monitor {
                let sample = monitor.sample();
                self.lock().snapshots.push(ResourceSnapshot {
                    sample,
                    items_processed: after,
                });
            }
        }

        after
    }

    pub fn record_warning(&self, category: &str, message: impl Into<String>, extra: Value) {
        let entry = event(category, message.into(), extra);
        tracing::warn!("Stage {} [{}] {}", self.stage_id, entry.category, entry.message);
        self.lock().warnings.push(entry);
    }

    pub fn record_error(&self, category: &str, message: impl Into<String>, extra: Value) {
        let entry = event(category, message.into(), extra);
        tracing::error!("Stage {} [{}] {}", self.stage_id, entry.category, entry.message);
        self.lock().errors.push(entry);
    }

    /// Record a progress event alongside the warnings, logged at info level.
    pub fn record_progress(&self, processed: u64) {
        let mut state = self.lock();
        let total = state.items_total;
        let entry = event(
            "progress",
            format!("{}/{} items processed", processed, total),
            serde_json::json!({ "processed": processed, "total": total }),
        );
        tracing::info!("Stage {} [progress] {}", self.stage_id, entry.message);
        state.warnings.push(entry);
    }

    pub fn complete(&self) {
        let mut state = self.lock();
        if state.finished.is_none() {
            state.finished = Some(Instant::now());
        }
    }

    pub fn is_complete(&self) -> bool {
        self.lock().finished.is_some()
    }

    /// Elapsed time since `start`, frozen at `complete`.
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.lock();
        let started = state.started?;
        Some(state.finished.unwrap_or_else(Instant::now).duration_since(started))
    }

    /// Duration of a completed stage.
    pub fn duration_ms(&self) -> Option<f64> {
        let state = self.lock();
        match (state.started, state.finished) {
            (Some(start), Some(end)) => Some(end.duration_since(start).as_secs_f64() * 1000.0),
            _ => None,
        }
    }

    /// Fraction of the item target processed, capped at 1.0.
    pub fn progress(&self) -> Option<f64> {
        let total = self.items_total();
        if total == 0 {
            return None;
        }
        Some((self.items_processed() as f64 / total as f64).min(1.0))
    }

    /// Items per second.
    pub fn throughput(&self) -> Option<f64> {
        let elapsed = self.elapsed()?.as_secs_f64();
        if elapsed > 0.0 {
            Some(self.items_processed() as f64 / elapsed)
        } else {
            None
        }
    }

    pub fn latency_histogram(&self) -> LatencyHistogram {
        let mut sorted = self.lock().latencies_ms.clone();
        if sorted.is_empty() {
            return LatencyHistogram::default();
        }
        sorted.sort_by(f64::total_cmp);
        LatencyHistogram {
            p50: Some(percentile(&sorted, 50.0)),
            p95: Some(percentile(&sorted, 95.0)),
            p99: Some(percentile(&sorted, 99.0)),
        }
    }

    pub fn warnings(&self) -> Vec<EventEntry> {
        self.lock().warnings.clone()
    }

    pub fn errors(&self) -> Vec<EventEntry> {
        self.lock().errors.clone()
    }

    pub fn anomalies(&self) -> Vec<LatencyAnomaly> {
        self.lock().anomalies.clone()
    }

    pub fn resource_snapshots(&self) -> Vec<ResourceSnapshot> {
        self.lock().snapshots.clone()
    }

    pub fn build_metrics(&self) -> PhaseMetrics {
        let latency_histogram = self.latency_histogram();
        let duration_ms = self.duration_ms();
        let progress = self.progress();
        let throughput = self.throughput();
        let state = self.lock();
        PhaseMetrics {
            stage_id: self.stage_id,
            label: self.label.clone(),
            duration_ms,
            items_processed: self.items_processed(),
            items_total: state.items_total,
            progress,
            throughput,
            warnings: state.warnings.clone(),
            errors: state.errors.clone(),
            resource_snapshots: state.snapshots.clone(),
            latency_histogram,
            anomalies: state.anomalies.clone(),
        }
    }
}

fn event(category: &str, message: String, extra: Value) -> EventEntry {
    let extra = match extra {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("detail".to_string(), other);
            map
        }
    };
    EventEntry {
        category: category.to_string(),
        message,
        extra,
        timestamp: Utc::now(),
    }
}

/// Flag `latency_ms` against the latencies recorded before it.
fn detect_anomaly(priors: &[f64], latency_ms: f64) -> Option<LatencyAnomaly> {
    if priors.len() < MIN_ANOMALY_SAMPLES {
        return None;
    }
    let n = priors.len() as f64;
    let mean = priors.iter().sum::<f64>() / n;
    let variance = priors.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    if latency_ms > mean + 3.0 * std {
        Some(LatencyAnomaly {
            kind: "latency_spike",
            latency_ms,
            mean_ms: mean,
            std_ms: std,
            timestamp: Utc::now(),
        })
    } else {
        None
    }
}

/// Linear interpolation between the closest ranks of a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let k = (sorted.len() - 1) as f64 * (p / 100.0);
    let f = k.floor() as usize;
    let c = (f + 1).min(sorted.len() - 1);
    if f == c {
        return sorted[f];
    }
    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::resources::StaticProbe;
    use serde_json::json;

    fn ms(v: u64) -> Option<Duration> {
        Some(Duration::from_millis(v))
    }

    #[test]
    fn test_progress_and_counts() {
        let inst = PhaseInstrumentation::new(1, "questions", 10, None);
        assert_eq!(inst.progress(), None);

        inst.start(Some(4));
        inst.increment(1, None);
        assert_eq!(inst.progress(), Some(0.25));
        assert_eq!(inst.increment(5, None), 6);
        assert_eq!(inst.progress(), Some(1.0));
    }

    #[test]
    fn test_duration_only_after_complete() {
        let inst = PhaseInstrumentation::new(0, "ingest", 10, None);
        assert_eq!(inst.duration_ms(), None);
        inst.start(None);
        assert_eq!(inst.duration_ms(), None);
        std::thread::sleep(Duration::from_millis(5));
        inst.complete();
        let d = inst.duration_ms().unwrap();
        assert!(d >= 5.0);
        // frozen after completion
        assert_eq!(inst.duration_ms(), Some(d));
    }

    #[test]
    fn test_percentiles_interpolate() {
        let inst = PhaseInstrumentation::new(0, "s", 10, None);
        for v in [10, 20, 30, 40] {
            inst.increment(1, ms(v));
        }
        let hist = inst.latency_histogram();
        // k = 3 * 0.5 = 1.5 -> 20 * 0.5 + 30 * 0.5
        assert!((hist.p50.unwrap() - 25.0).abs() < 1e-9);
        // k = 3 * 0.95 = 2.85 -> 30 * 0.15 + 40 * 0.85
        assert!((hist.p95.unwrap() - 38.5).abs() < 1e-9);
        assert!(hist.p99.unwrap() <= 40.0);

        let empty = PhaseInstrumentation::new(0, "s", 10, None);
        assert_eq!(empty.latency_histogram(), LatencyHistogram::default());
    }

    #[test]
    fn test_anomaly_requires_five_priors() {
        let inst = PhaseInstrumentation::new(0, "s", 10, None);
        for v in [10, 10, 10, 10] {
            inst.increment(1, ms(v));
        }
        inst.increment(1, ms(1000));
        assert!(inst.anomalies().is_empty());

        inst.increment(1, ms(5000));
        assert_eq!(inst.anomalies().len(), 1);
        assert_eq!(inst.anomalies()[0].kind, "latency_spike");
    }

    #[test]
    fn test_anomaly_threshold_boundary() {
        // priors 10, 20, 10, 20, 10, 20: mean 15, pstdev 5, threshold 30
        let priors = [10.0, 20.0, 10.0, 20.0, 10.0, 20.0];
        assert!(detect_anomaly(&priors, 30.0).is_none());
        assert!(detect_anomaly(&priors, 30.5).is_some());

        // zero spread still flags anything above the mean
        let flat = [5.0; 5];
        assert!(detect_anomaly(&flat, 5.0).is_none());
        assert!(detect_anomaly(&flat, 5.1).is_some());
    }

    #[test]
    fn test_warnings_and_errors_carry_extra() {
        let inst = PhaseInstrumentation::new(2, "agg", 10, None);
        inst.record_warning("circuit_breaker", "circuit open", json!({"work_class": "X"}));
        inst.record_error("timeout", "too slow", json!(100));
        inst.record_error("exception", "boom", Value::Null);

        let warnings = inst.warnings();
        assert_eq!(warnings[0].extra["work_class"], "X");

        let errors = inst.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].extra["detail"], 100);
        assert!(errors[1].extra.is_empty());

        let json = serde_json::to_value(&warnings[0]).unwrap();
        assert_eq!(json["category"], "circuit_breaker");
        assert_eq!(json["work_class"], "X");
    }

    #[test]
    fn test_progress_event() {
        let inst = PhaseInstrumentation::new(1, "q", 10, None);
        inst.start(Some(20));
        inst.record_progress(10);
        let warnings = inst.warnings();
        assert_eq!(warnings[0].category, "progress");
        assert_eq!(warnings[0].extra["total"], 20);
        assert_eq!(warnings[0].message, "10/20 items processed");
    }

    #[test]
    fn test_snapshots_on_interval() {
        let monitor = Arc::new(ResourceMonitor::with_probe(
            &ResourceConfig::default(),
            StaticProbe::new(10.0, 20.0, 30.0),
        ));
        let inst = PhaseInstrumentation::new(1, "q", 10, Some(monitor.clone()));
        inst.start(Some(25));
        for _ in 0..25 {
            inst.increment(1, None);
        }
        let snaps = inst.resource_snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].items_processed, 10);
        assert_eq!(snaps[1].items_processed, 20);

        // batch increments crossing a boundary also snapshot
        inst.increment(7, None);
        assert_eq!(inst.resource_snapshots().len(), 3);
    }

    #[test]
    fn test_no_snapshots_without_target() {
        let monitor = Arc::new(ResourceMonitor::with_probe(
            &ResourceConfig::default(),
            StaticProbe::default(),
        ));
        let inst = PhaseInstrumentation::new(1, "q", 1, Some(monitor));
        inst.start(None);
        inst.increment(3, None);
        assert!(inst.resource_snapshots().is_empty());
    }

    #[test]
    fn test_build_metrics_serializes() {
        let inst = PhaseInstrumentation::new(3, "report", 10, None);
        inst.start(Some(2));
        inst.increment(2, ms(4));
        inst.complete();

        let metrics = inst.build_metrics();
        assert_eq!(metrics.stage_id, 3);
        assert_eq!(metrics.items_processed, 2);
        assert_eq!(metrics.progress, Some(1.0));

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["label"], "report");
        assert!(json["latency_histogram"]["p50"].is_number());
    }
}
