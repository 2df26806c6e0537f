//! Handler contracts and the lazy handler registry.
//!
//! Stage handlers run once per stage. Work-item handlers plan a list of items,
//! process each one independently and reduce the per-item results into the
//! stage output. Both run on tokio's blocking pool and must not touch
//! orchestrator state.

use once_cell::sync::OnceCell;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Error marker carried by items skipped because their circuit is open.
pub const CIRCUIT_OPEN_MARKER: &str = "circuit_open";

/// Named inputs resolved from the pipeline context for one stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageInputs {
    stage_id: u32,
    values: BTreeMap<String, Value>,
}

impl StageInputs {
    pub fn new(stage_id: u32, values: BTreeMap<String, Value>) -> Self {
        Self { stage_id, values }
    }

    pub fn stage_id(&self) -> u32 {
        self.stage_id
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Like `get`, but a missing key is an error.
    pub fn require(&self, key: &str) -> anyhow::Result<&Value> {
        self.values
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("stage {} has no input '{}'", self.stage_id, key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A stage that runs its handler once.
pub trait StageHandler: Send + Sync {
    fn handle(&self, inputs: &StageInputs) -> anyhow::Result<Value>;
}

/// A stage that fans out over independent work items.
pub trait WorkItemHandler: Send + Sync {
    /// Produce the items for this stage. Order does not matter; items are
    /// sorted by `sort_key` before dispatch.
    fn plan(&self, inputs: &StageInputs) -> anyhow::Result<Vec<WorkItem>>;

    /// Process one item. May be called concurrently.
    fn process(&self, item: &WorkItem, inputs: &StageInputs) -> anyhow::Result<Value>;

    /// Combine per-item results (in dispatch order) into the stage output.
    fn reduce(&self, results: &[WorkItemResult]) -> anyhow::Result<Value> {
        Ok(serde_json::to_value(results)?)
    }
}

struct FnStageHandler<F>(F);

impl<F> StageHandler for FnStageHandler<F>
where
    F: Fn(&StageInputs) -> anyhow::Result<Value> + Send + Sync,
{
    fn handle(&self, inputs: &StageInputs) -> anyhow::Result<Value> {
        (self.0)(inputs)
    }
}

/// One unit of fan-out work.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItem {
    pub id: String,
    /// Grouping key for circuit breaking
    pub work_class: String,
    /// Dispatch order key; ties are broken by `id`
    pub sort_key: (u32, u32, u32),
    pub payload: Value,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, work_class: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            work_class: work_class.into(),
            sort_key: (0, 0, 0),
            payload: Value::Null,
        }
    }

    pub fn with_sort_key(mut self, sort_key: (u32, u32, u32)) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Outcome of one dispatched work item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkItemResult {
    pub item_id: String,
    pub work_class: String,
    /// Position in dispatch order
    pub sequence: usize,
    pub payload: Option<Value>,
    pub error: Option<String>,
    pub duration_ms: f64,
    /// Skipped without invoking the handler
    pub circuit_open: bool,
}

impl WorkItemResult {
    pub(crate) fn success(item: &WorkItem, sequence: usize, payload: Value, duration_ms: f64) -> Self {
        Self {
            item_id: item.id.clone(),
            work_class: item.work_class.clone(),
            sequence,
            payload: Some(payload),
            error: None,
            duration_ms,
            circuit_open: false,
        }
    }

    pub(crate) fn failure(item: &WorkItem, sequence: usize, error: String, duration_ms: f64) -> Self {
        Self {
            item_id: item.id.clone(),
            work_class: item.work_class.clone(),
            sequence,
            payload: None,
            error: Some(error),
            duration_ms,
            circuit_open: false,
        }
    }

    pub(crate) fn short_circuited(item: &WorkItem, sequence: usize) -> Self {
        Self {
            item_id: item.id.clone(),
            work_class: item.work_class.clone(),
            sequence,
            payload: None,
            error: Some(CIRCUIT_OPEN_MARKER.to_string()),
            duration_ms: 0.0,
            circuit_open: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.circuit_open
    }
}

/// Which contract a registered handler implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerKind {
    Stage,
    FanOut,
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerKind::Stage => write!(f, "stage"),
            HandlerKind::FanOut => write!(f, "fan-out"),
        }
    }
}

type Factory<T> = Box<dyn Fn() -> anyhow::Result<Arc<T>> + Send + Sync>;

/// Handler built on first use and cached for the registry's lifetime.
struct Lazy<T: ?Sized> {
    factory: Option<Factory<T>>,
    cell: OnceCell<Arc<T>>,
}

impl<T: ?Sized> Lazy<T> {
    fn new(factory: Factory<T>) -> Self {
        Self {
            factory: Some(factory),
            cell: OnceCell::new(),
        }
    }

    fn ready(handler: Arc<T>) -> Self {
        Self {
            factory: None,
            cell: OnceCell::with_value(handler),
        }
    }

    fn get(&self) -> anyhow::Result<Arc<T>> {
        self.cell
            .get_or_try_init(|| match &self.factory {
                Some(factory) => factory(),
                None => Err(anyhow::anyhow!("handler has no factory")),
            })
            .cloned()
    }

    fn is_constructed(&self) -> bool {
        self.cell.get().is_some()
    }
}

enum Entry {
    Stage(Lazy<dyn StageHandler>),
    FanOut(Lazy<dyn WorkItemHandler>),
}

impl Entry {
    fn kind(&self) -> HandlerKind {
        match self {
            Entry::Stage(_) => HandlerKind::Stage,
            Entry::FanOut(_) => HandlerKind::FanOut,
        }
    }
}

/// Name-to-handler map consulted when an orchestrator is built.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Entry>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.entries.iter().map(|(n, e)| (n.as_str(), e.kind())).collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: String, entry: Entry) {
        if self.entries.insert(name.clone(), entry).is_some() {
            tracing::warn!("Handler '{}' registered twice, keeping the latest", name);
        }
    }

    /// Register an already-built stage handler.
    pub fn stage<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: StageHandler + 'static,
    {
        self.insert(name.into(), Entry::Stage(Lazy::ready(Arc::new(handler))));
        self
    }

    /// Register a closure as a stage handler.
    pub fn stage_fn<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&StageInputs) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.stage(name, FnStageHandler(handler))
    }

    /// Register a stage handler that is built on first use.
    pub fn register_stage<H, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        H: StageHandler + 'static,
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: Factory<dyn StageHandler> =
            Box::new(move || -> anyhow::Result<Arc<dyn StageHandler>> {
                Ok(Arc::new(factory()?) as Arc<dyn StageHandler>)
            });
        self.insert(name.into(), Entry::Stage(Lazy::new(factory)));
        self
    }

    /// Register an already-built work-item handler.
    pub fn fan_out<H>(&mut self, name: impl Into<String>, handler: H) -> &mut Self
    where
        H: WorkItemHandler + 'static,
    {
        self.insert(name.into(), Entry::FanOut(Lazy::ready(Arc::new(handler))));
        self
    }

    /// Register a work-item handler that is built on first use.
    pub fn register_fan_out<H, F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        H: WorkItemHandler + 'static,
        F: Fn() -> anyhow::Result<H> + Send + Sync + 'static,
    {
        let factory: Factory<dyn WorkItemHandler> =
            Box::new(move || -> anyhow::Result<Arc<dyn WorkItemHandler>> {
                Ok(Arc::new(factory()?) as Arc<dyn WorkItemHandler>)
            });
        self.insert(name.into(), Entry::FanOut(Lazy::new(factory)));
        self
    }

    pub fn kind(&self, name: &str) -> Option<HandlerKind> {
        self.entries.get(name).map(Entry::kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the named handler has been built.
    pub fn is_constructed(&self, name: &str) -> bool {
        match self.entries.get(name) {
            Some(Entry::Stage(lazy)) => lazy.is_constructed(),
            Some(Entry::FanOut(lazy)) => lazy.is_constructed(),
            None => false,
        }
    }

    pub fn resolve_stage(&self, name: &str) -> anyhow::Result<Arc<dyn StageHandler>> {
        match self.entries.get(name) {
            Some(Entry::Stage(lazy)) => lazy.get(),
            Some(Entry::FanOut(_)) => anyhow::bail!("handler '{}' is a fan-out handler", name),
            None => anyhow::bail!("handler '{}' is not registered", name),
        }
    }

    pub fn resolve_fan_out(&self, name: &str) -> anyhow::Result<Arc<dyn WorkItemHandler>> {
        match self.entries.get(name) {
            Some(Entry::FanOut(lazy)) => lazy.get(),
            Some(Entry::Stage(_)) => anyhow::bail!("handler '{}' is a stage handler", name),
            None => anyhow::bail!("handler '{}' is not registered", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo;

    impl WorkItemHandler for Echo {
        fn plan(&self, _inputs: &StageInputs) -> anyhow::Result<Vec<WorkItem>> {
            Ok(vec![WorkItem::new("a", "echo")])
        }

        fn process(&self, item: &WorkItem, _inputs: &StageInputs) -> anyhow::Result<Value> {
            Ok(json!(item.id))
        }
    }

    #[test]
    fn test_stage_fn_handler() {
        let mut registry = HandlerRegistry::new();
        registry.stage_fn("double", |inputs: &StageInputs| {
            let n = inputs.require("n")?.as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        });

        let handler = registry.resolve_stage("double").unwrap();
        let inputs = StageInputs::new(0, BTreeMap::from([("n".to_string(), json!(21))]));
        assert_eq!(handler.handle(&inputs).unwrap(), json!(42));

        let empty = StageInputs::new(0, BTreeMap::new());
        assert!(handler.handle(&empty).is_err());
    }

    #[test]
    fn test_lazy_construction_happens_once() {
        let built = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let built = built.clone();
            registry.register_fan_out("echo", move || {
                built.fetch_add(1, Ordering::SeqCst);
                Ok(Echo)
            });
        }

        assert_eq!(registry.kind("echo"), Some(HandlerKind::FanOut));
        assert!(!registry.is_constructed("echo"));
        assert_eq!(built.load(Ordering::SeqCst), 0);

        registry.resolve_fan_out("echo").unwrap();
        registry.resolve_fan_out("echo").unwrap();
        assert!(registry.is_constructed("echo"));
        assert_eq!(built.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_factory_retries_on_next_resolve() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();
        {
            let attempts = attempts.clone();
            registry.register_fan_out("flaky", move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("not ready");
                }
                Ok(Echo)
            });
        }

        assert!(registry.resolve_fan_out("flaky").is_err());
        assert!(registry.resolve_fan_out("flaky").is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resolve_wrong_kind_or_missing() {
        let mut registry = HandlerRegistry::new();
        registry.fan_out("echo", Echo);

        assert!(registry.resolve_stage("echo").is_err());
        assert!(registry.resolve_stage("missing").is_err());
        assert!(registry.resolve_fan_out("echo").is_ok());
        assert!(!registry.contains("missing"));
    }

    #[test]
    fn test_default_reduce_keeps_dispatch_order() {
        let item_a = WorkItem::new("a", "x");
        let item_b = WorkItem::new("b", "y");
        let results = vec![
            WorkItemResult::success(&item_a, 0, json!(1), 1.0),
            WorkItemResult::short_circuited(&item_b, 1),
        ];

        let reduced = Echo.reduce(&results).unwrap();
        assert_eq!(reduced[0]["item_id"], "a");
        assert_eq!(reduced[1]["error"], CIRCUIT_OPEN_MARKER);
        assert_eq!(reduced[1]["circuit_open"], true);
    }
}
