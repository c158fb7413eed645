//! Shared fixtures for runtime tests: a scriptable async adapter, a fixed
//! plan translator, and a fully wired engine + runner + ingester harness.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use dirigent_core::adapter::{
    Adapter, AdapterContext, AdapterError, AdapterResult, StaticContextProvider,
};
use dirigent_core::engine::Engine;
use dirigent_core::policy::{PolicyGate, PolicyMode};
use dirigent_core::registry::Registry;
use dirigent_core::telemetry::Metrics;
use dirigent_core::translator::{TranslateContext, TranslateError, Translator};
use dirigent_core::types::{ExecutionPlan, ExecutionTask};
use dirigent_stores::{InMemoryAuditSink, InMemoryRequestStore};

use crate::callback::CallbackIngester;
use crate::runner::Runner;

/// Per-task scripted behavior for `execute`.
#[derive(Clone)]
pub(crate) enum Behavior {
    Succeed,
    Running(String),
}

/// Adapter whose `execute` and `check_status` outcomes are scripted.
pub(crate) struct AsyncAdapter {
    behaviors: Mutex<HashMap<String, Behavior>>,
    polls: Mutex<HashMap<String, Result<AdapterResult, String>>>,
}

impl AsyncAdapter {
    fn new(behaviors: Vec<(&'static str, Behavior)>) -> Self {
        Self {
            behaviors: Mutex::new(
                behaviors
                    .into_iter()
                    .map(|(id, behavior)| (id.to_string(), behavior))
                    .collect(),
            ),
            polls: Mutex::new(HashMap::new()),
        }
    }

    /// Script the next `check_status` response for an external id.
    pub(crate) fn set_poll(
        &self,
        external_id: &str,
        outcome: Result<AdapterResult, AdapterError>,
    ) {
        self.polls.lock().insert(
            external_id.to_string(),
            outcome.map_err(|e| e.to_string()),
        );
    }
}

#[async_trait]
impl Adapter for AsyncAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        task: &ExecutionTask,
        _ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        match self.behaviors.lock().get(&task.id) {
            Some(Behavior::Running(external_id)) => {
                Ok(AdapterResult::running(external_id.clone()))
            }
            Some(Behavior::Succeed) | None => Ok(AdapterResult::succeeded()),
        }
    }

    async fn check_status(
        &self,
        external_id: &str,
        _ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        match self.polls.lock().get(external_id) {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(message)) => Err(AdapterError::Backend(message.clone())),
            None => Err(AdapterError::Backend("job state not yet known".to_string())),
        }
    }
}

/// Translator emitting a fixed plan of `(task_id, depends_on)` tasks, all
/// bound to the `mock` backend.
struct FixedPlanTranslator {
    tasks: Vec<(String, Vec<String>)>,
}

#[async_trait]
impl Translator for FixedPlanTranslator {
    async fn translate(
        &self,
        _ctx: &TranslateContext,
        _payload: &Value,
    ) -> Result<ExecutionPlan, TranslateError> {
        Ok(ExecutionPlan::new(
            self.tasks
                .iter()
                .map(|(id, deps)| {
                    ExecutionTask::new(id, "mock", "op").with_depends_on(deps.clone())
                })
                .collect(),
        ))
    }
}

/// Fully wired runtime under test.
pub(crate) struct Harness {
    pub(crate) engine: Arc<Engine>,
    pub(crate) store: Arc<InMemoryRequestStore>,
    pub(crate) runner: Arc<Runner>,
    pub(crate) ingester: CallbackIngester,
    pub(crate) adapter: Arc<AsyncAdapter>,
}

impl Harness {
    pub(crate) fn body(&self, key: &str, payload: Value) -> Value {
        json!({
            "api_version": "1",
            "type": "test.kind",
            "type_version": "1",
            "operation": "apply",
            "idempotency_key": key,
            "payload": payload,
        })
    }
}

pub(crate) async fn harness(
    behaviors: Vec<(&'static str, Behavior)>,
    tasks: Vec<(&'static str, Vec<&'static str>)>,
) -> Harness {
    let adapter = Arc::new(AsyncAdapter::new(behaviors));
    let mut registry = Registry::new();
    registry.register_translator(
        "test.kind",
        "1",
        Arc::new(FixedPlanTranslator {
            tasks: tasks
                .into_iter()
                .map(|(id, deps)| {
                    (
                        id.to_string(),
                        deps.into_iter().map(str::to_string).collect(),
                    )
                })
                .collect(),
        }),
    );
    registry.register_adapter(adapter.clone());

    let store = Arc::new(InMemoryRequestStore::new());
    let audit = Arc::new(InMemoryAuditSink::new());
    let metrics = Arc::new(Metrics::new());

    let engine = Arc::new(Engine::new(
        Arc::new(registry),
        store.clone(),
        audit.clone(),
        PolicyGate::new(PolicyMode::Enforce),
        Arc::new(StaticContextProvider::new()),
        metrics.clone(),
    ));
    let runner = Arc::new(Runner::new(engine.clone(), store.clone(), metrics.clone()));
    let ingester = CallbackIngester::new(
        store.clone(),
        audit,
        engine.locks(),
        metrics,
        runner.clone(),
    );

    Harness {
        engine,
        store,
        runner,
        ingester,
        adapter,
    }
}
