//! Bounded-parallel execution of one stage's work items.
//!
//! ```text
//! ┌────────┐  async_channel   ┌──────────┐  gate permit   ┌────────────────┐
//! │ Feeder │ ───────────────▶ │ Worker×N │ ─────────────▶ │ spawn_blocking │
//! └────────┘  (sorted items)  └──────────┘  (budget)      └────────────────┘
//!                                   │
//!                                   ▼
//!                        shared result sink
//! ```
//!
//! Items are sent in sort-key order and may complete in any order. Results
//! land in a shared sink as they complete so a stage deadline still leaves
//! the finished items visible to the caller.

use super::circuit::{CircuitBreaker, CircuitTransition};
use super::handler::{StageInputs, WorkItem, WorkItemHandler, WorkItemResult};
use super::instrumentation::PhaseInstrumentation;
use crate::abort::AbortSignal;
use crate::resources::ResourceMonitor;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinSet;

/// Collects item results as they complete.
#[derive(Debug, Default)]
pub(crate) struct ItemSink {
    planned: AtomicUsize,
    results: Mutex<Vec<WorkItemResult>>,
}

impl ItemSink {
    pub fn set_planned(&self, planned: usize) {
        self.planned.store(planned, Ordering::Relaxed);
    }

    pub fn planned(&self) -> usize {
        self.planned.load(Ordering::Relaxed)
    }

    fn push(&self, result: WorkItemResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    pub fn len(&self) -> usize {
        self.results.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Results collected so far, in dispatch order.
    pub fn sorted(&self) -> Vec<WorkItemResult> {
        let mut results = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        results.sort_by_key(|r| r.sequence);
        results
    }
}

/// Shared state every fan-out worker needs.
#[derive(Clone)]
pub(crate) struct FanOut {
    pub stage_id: u32,
    pub handler: Arc<dyn WorkItemHandler>,
    pub inputs: Arc<StageInputs>,
    pub monitor: Arc<ResourceMonitor>,
    pub breaker: Arc<CircuitBreaker>,
    pub abort: Arc<AbortSignal>,
    pub instrumentation: Arc<PhaseInstrumentation>,
    pub progress_log_interval: u64,
    pub sink: Arc<ItemSink>,
}

/// Stable dispatch order: sort key first, item id as tie-break.
pub fn sort_items(items: &mut [WorkItem]) {
    items.sort_by(|a, b| a.sort_key.cmp(&b.sort_key).then_with(|| a.id.cmp(&b.id)));
}

impl FanOut {
    /// Dispatch `items` across the worker pool and wait for all workers.
    ///
    /// Returns the number of items handed to a worker.
    pub async fn run(&self, mut items: Vec<WorkItem>) -> usize {
        if items.is_empty() {
            return 0;
        }

        sort_items(&mut items);

        let total = items.len();
        let workers = self.monitor.limits().hard_max_workers.min(total).max(1);

        tracing::info!(
            "Stage {}: dispatching {} items to {} workers (budget {})",
            self.stage_id,
            total,
            workers,
            self.monitor.worker_budget()
        );

        let (work_tx, work_rx) = async_channel::bounded::<(usize, WorkItem)>(workers * 2);
        let mut tasks = JoinSet::new();

        let abort = self.abort.clone();
        let stage_id = self.stage_id;
        tasks.spawn(async move {
            for (sequence, item) in items.into_iter().enumerate() {
                if abort.is_aborted() {
                    tracing::debug!("Stage {}: abort observed, stopping dispatch at {}", stage_id, sequence);
                    break;
                }
                if work_tx.send((sequence, item)).await.is_err() {
                    break;
                }
            }
            work_tx.close();
        });

        for _ in 0..workers {
            let worker = self.clone();
            let work_rx = work_rx.clone();
            tasks.spawn(async move {
                while let Ok((sequence, item)) = work_rx.recv().await {
                    if !worker.process_item(sequence, item).await {
                        break;
                    }
                }
            });
        }
        drop(work_rx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("Stage {} worker task failed: {}", self.stage_id, e);
            }
        }

        self.sink.len()
    }

    /// Handle one item. Returns false when the worker should stop.
    ///
    /// The circuit is checked once, after the gate permit is acquired. An item
    /// that passed the check is still invoked if a sibling worker trips its
    /// circuit meanwhile, so a class sees at most `threshold + workers - 1`
    /// invocations per run. Items checked after the trip are never invoked.
    async fn process_item(&self, sequence: usize, item: WorkItem) -> bool {
        if self.abort.is_aborted() {
            return false;
        }

        self.monitor.apply_budget().await;
        let Some(permit) = self.monitor.gate().acquire().await else {
            return false;
        };
        if self.abort.is_aborted() {
            return false;
        }

        if self.breaker.is_open(&item.work_class) {
            self.instrumentation.record_warning(
                "circuit_breaker",
                format!("Circuit open, skipping item {}", item.id),
                json!({ "work_class": item.work_class, "item_id": item.id }),
            );
            self.instrumentation.increment(1, None);
            self.sink.push(WorkItemResult::short_circuited(&item, sequence));
            return true;
        }

        self.check_resources();

        let handler = self.handler.clone();
        let inputs = self.inputs.clone();
        let job = item.clone();
        let started = Instant::now();
        let outcome = tokio::task::spawn_blocking(move || handler.process(&job, &inputs)).await;
        let elapsed = started.elapsed();
        drop(permit);

        let outcome = match outcome {
            Ok(outcome) => outcome.map_err(|e| format!("{:#}", e)),
            Err(e) => Err(format!("handler panicked: {}", e)),
        };

        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        let result = match outcome {
            Ok(payload) => {
                self.breaker.record_success(&item.work_class);
                WorkItemResult::success(&item, sequence, payload, duration_ms)
            }
            Err(message) => {
                self.instrumentation.record_error(
                    "work_item",
                    message.clone(),
                    json!({ "work_class": item.work_class, "item_id": item.id }),
                );
                if self.breaker.record_failure(&item.work_class) == CircuitTransition::Tripped {
                    self.instrumentation.record_warning(
                        "circuit_breaker",
                        format!("Circuit opened for work class '{}'", item.work_class),
                        json!({ "work_class": item.work_class }),
                    );
                }
                WorkItemResult::failure(&item, sequence, message, duration_ms)
            }
        };
        self.sink.push(result);

        let processed = self.instrumentation.increment(1, Some(elapsed));
        if processed % self.progress_log_interval.max(1) == 0 {
            self.instrumentation.record_progress(processed);
        }

        true
    }

    /// Soft per-item resource checks. Exceeding a ceiling only records a warning.
    fn check_resources(&self) {
        let sample = self.monitor.sample();
        let (memory_exceeded, sample) = self.monitor.check_memory_exceeded(Some(&sample));
        let (cpu_exceeded, sample) = self.monitor.check_cpu_exceeded(Some(&sample));
        if memory_exceeded {
            self.instrumentation.record_warning(
                "resource",
                "Memory limit exceeded",
                json!({ "rss_mb": sample.rss_mb, "memory_percent": sample.memory_percent }),
            );
        }
        if cpu_exceeded {
            self.instrumentation.record_warning(
                "resource",
                "CPU limit exceeded",
                json!({ "cpu_percent": sample.cpu_percent }),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceConfig;
    use crate::resources::StaticProbe;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails every item of class "X"; tracks concurrency seen by each call.
    struct Flaky {
        calls: AtomicUsize,
        x_calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        observed: std::sync::Mutex<Vec<usize>>,
        delay: Duration,
    }

    impl Flaky {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                x_calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                observed: std::sync::Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    impl WorkItemHandler for Flaky {
        fn plan(&self, _inputs: &StageInputs) -> anyhow::Result<Vec<WorkItem>> {
            Ok(Vec::new())
        }

        fn process(&self, item: &WorkItem, _inputs: &StageInputs) -> anyhow::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.observed.lock().unwrap().push(now);
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if item.work_class == "X" {
                self.x_calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("class X always fails");
            }
            Ok(json!(item.id))
        }
    }

    fn fan_out(handler: Arc<Flaky>, workers: usize, threshold: u32) -> FanOut {
        let resources = ResourceConfig {
            min_workers: workers,
            max_workers: workers,
            hard_max_workers: workers,
            ..ResourceConfig::default()
        };
        fan_out_with(handler, &resources, StaticProbe::new(50.0, 50.0, 10.0), threshold)
    }

    fn fan_out_with(
        handler: Arc<Flaky>,
        resources: &ResourceConfig,
        probe: StaticProbe,
        threshold: u32,
    ) -> FanOut {
        let monitor = Arc::new(ResourceMonitor::with_probe(resources, probe));
        FanOut {
            stage_id: 1,
            handler,
            inputs: Arc::new(StageInputs::new(1, BTreeMap::new())),
            instrumentation: Arc::new(PhaseInstrumentation::new(1, "items", 10, Some(monitor.clone()))),
            monitor,
            breaker: Arc::new(CircuitBreaker::new(threshold)),
            abort: Arc::new(AbortSignal::new()),
            progress_log_interval: 10,
            sink: Arc::new(ItemSink::default()),
        }
    }

    fn items(classes: &[&str]) -> Vec<WorkItem> {
        classes
            .iter()
            .enumerate()
            .map(|(i, class)| WorkItem::new(format!("item-{:02}", i), *class).with_sort_key((i as u32, 0, 0)))
            .collect()
    }

    #[test]
    fn test_sort_items_stable_with_id_tiebreak() {
        let mut items = vec![
            WorkItem::new("b", "c").with_sort_key((1, 0, 0)),
            WorkItem::new("a", "c").with_sort_key((1, 0, 0)),
            WorkItem::new("z", "c").with_sort_key((0, 5, 0)),
        ];
        sort_items(&mut items);
        let ids: Vec<_> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a", "b"]);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_handler() {
        let handler = Arc::new(Flaky::new(Duration::ZERO));
        let fan = fan_out(handler.clone(), 1, 3);

        let dispatched = fan.run(items(&["X", "A", "X", "X", "B", "X", "X"])).await;
        assert_eq!(dispatched, 7);
        assert_eq!(handler.x_calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);

        let results = fan.sink.sorted();
        assert!(results[5].circuit_open);
        assert!(results[6].circuit_open);
        assert!(results[1].is_success());
        assert!(fan.breaker.is_open("X"));
        assert_eq!(fan.instrumentation.items_processed(), 7);
    }

    #[tokio::test]
    async fn test_respects_worker_budget() {
        let handler = Arc::new(Flaky::new(Duration::from_millis(20)));
        let fan = fan_out(handler.clone(), 2, 3);

        fan.run(items(&["A"; 8])).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 8);
        assert!(handler.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_budget_shrinks_mid_stage() {
        let handler = Arc::new(Flaky::new(Duration::from_millis(50)));
        let resources = ResourceConfig {
            min_workers: 1,
            max_workers: 4,
            hard_max_workers: 4,
            ..ResourceConfig::default()
        };
        // cpu above 0.95 * 85 shrinks the budget by one per sample
        let fan = fan_out_with(handler.clone(), &resources, StaticProbe::new(99.0, 10.0, 10.0), 3);

        fan.run(items(&["A"; 16])).await;

        let observed = handler.observed.lock().unwrap().clone();
        assert_eq!(observed.len(), 16);
        assert_eq!(observed[..4].iter().max(), Some(&4));
        assert!(observed[12..].iter().all(|n| *n == 1), "in flight per call: {:?}", observed);

        assert_eq!(fan.monitor.worker_budget(), 1);
        assert_eq!(fan.monitor.gate().limit(), 1);
    }

    #[tokio::test]
    async fn test_trip_with_many_workers_bounds_invocations() {
        let handler = Arc::new(Flaky::new(Duration::from_millis(20)));
        let (workers, threshold) = (4, 2);
        let fan = fan_out(handler.clone(), workers, threshold);

        fan.run(items(&["X"; 12])).await;

        let x_calls = handler.x_calls.load(Ordering::SeqCst);
        assert!(x_calls >= threshold as usize);
        assert!(x_calls <= threshold as usize + workers - 1, "x calls: {}", x_calls);

        let summary = crate::pipeline::ItemSummary::from_results(12, &fan.sink.sorted());
        assert_eq!(summary.failed, x_calls);
        assert_eq!(summary.short_circuited, 12 - x_calls);
        assert!(fan.breaker.is_open("X"));
    }

    #[tokio::test]
    async fn test_abort_stops_dispatch() {
        let handler = Arc::new(Flaky::new(Duration::ZERO));
        let fan = fan_out(handler.clone(), 1, 3);
        fan.abort.abort("stop");

        let dispatched = fan.run(items(&["A", "B", "C"])).await;
        assert_eq!(dispatched, 0);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failures_recorded_in_instrumentation() {
        let handler = Arc::new(Flaky::new(Duration::ZERO));
        let fan = fan_out(handler, 1, 2);
        fan.run(items(&["X", "X", "X"])).await;

        let errors = fan.instrumentation.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.category == "work_item"));

        let warnings = fan.instrumentation.warnings();
        let breaker_warnings = warnings.iter().filter(|w| w.category == "circuit_breaker").count();
        // one for tripping, one for the skipped third item
        assert_eq!(breaker_warnings, 2);
    }
}
