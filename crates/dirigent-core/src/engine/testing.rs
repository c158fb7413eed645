//! Test fixtures for engine tests: an in-memory store, a recording audit
//! sink, scripted adapters, and canned translators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::adapter::{
    Adapter, AdapterContext, AdapterError, AdapterResult, StaticContextProvider,
};
use crate::policy::{PolicyGate, PolicyMode};
use crate::registry::Registry;
use crate::store::{AuditSink, RecordPatch, RequestStore, StoreError};
use crate::telemetry::Metrics;
use crate::translator::{TranslateContext, TranslateError, Translator};
use crate::types::{
    AuditEvent, AuditLevel, AuditStage, ExecutionPlan, ExecutionTask, RequestRecord,
    RequestStatus, TaskRef,
};

use super::Engine;

/// Minimal in-memory request store for engine tests.
pub(crate) struct TestStore {
    records: RwLock<HashMap<String, RequestRecord>>,
}

impl TestStore {
    pub(crate) fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl RequestStore for TestStore {
    async fn create(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        if records
            .values()
            .any(|r| r.envelope.idempotency_key == record.envelope.idempotency_key)
        {
            return Err(StoreError::DuplicateKey(
                record.envelope.idempotency_key.clone(),
            ));
        }
        records.insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, request_id: &str, patch: RecordPatch) -> Result<(), StoreError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let record = records
            .get_mut(request_id)
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
        if let Some(plan) = patch.plan {
            record.plan = Some(plan);
        }
        if let Some(results) = patch.results {
            record.results = Some(results);
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(records.get(request_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RequestRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(records
            .values()
            .find(|r| r.envelope.idempotency_key == key)
            .cloned())
    }

    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut matched: Vec<RequestRecord> = records
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn find_task_by_external_id(
        &self,
        backend: &str,
        external_id: &str,
    ) -> Result<Option<TaskRef>, StoreError> {
        let records = self
            .records
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for record in records.values() {
            if let Some(results) = &record.results {
                for result in results {
                    if result.backend == backend
                        && result.external_id.as_deref() == Some(external_id)
                    {
                        return Ok(Some(TaskRef {
                            request_id: record.request_id.clone(),
                            task_id: result.task_id.clone(),
                        }));
                    }
                }
            }
        }
        Ok(None)
    }
}

/// Audit sink that records every event for assertions.
pub(crate) struct RecordingAudit {
    events: RwLock<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub(crate) fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn has_stage_level(&self, stage: AuditStage, level: AuditLevel) -> bool {
        self.events
            .read()
            .unwrap()
            .iter()
            .any(|e| e.stage == stage && e.level == level)
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError> {
        self.events
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .push(event);
        Ok(())
    }
}

/// Per-task scripted behavior for a mock adapter.
#[derive(Clone)]
pub(crate) enum ScriptedOutcome {
    Succeed,
    Fail(String),
    Running(String),
}

/// Adapter whose outcomes are scripted per task id; unscripted tasks succeed.
pub(crate) struct ScriptedAdapter {
    name: String,
    outcomes: HashMap<String, ScriptedOutcome>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcomes: HashMap::new(),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn on(mut self, task_id: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.outcomes.insert(task_id.into(), outcome);
        self
    }

    pub(crate) fn invocations(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        task: &ExecutionTask,
        _ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        self.invocations.lock().unwrap().push(task.id.clone());
        match self.outcomes.get(&task.id) {
            Some(ScriptedOutcome::Fail(message)) => Ok(AdapterResult::failed(message.clone())),
            Some(ScriptedOutcome::Running(external_id)) => {
                Ok(AdapterResult::running(external_id.clone()))
            }
            Some(ScriptedOutcome::Succeed) | None => {
                Ok(AdapterResult::succeeded().with_output(json!({"task": &task.id})))
            }
        }
    }
}

/// Translator producing a fixed flat plan of `(task_id, backend)` tasks.
pub(crate) struct CountingTranslator {
    tasks: Vec<(&'static str, &'static str)>,
    pub(crate) calls: Arc<AtomicUsize>,
}

impl CountingTranslator {
    pub(crate) fn new(tasks: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            tasks,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Translator for CountingTranslator {
    async fn translate(
        &self,
        _ctx: &TranslateContext,
        _payload: &Value,
    ) -> Result<ExecutionPlan, TranslateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionPlan::new(
            self.tasks
                .iter()
                .map(|(id, backend)| ExecutionTask::new(*id, *backend, "op"))
                .collect(),
        ))
    }
}

pub(crate) fn plan_translator(tasks: Vec<(&'static str, &'static str)>) -> Arc<dyn Translator> {
    Arc::new(CountingTranslator::new(tasks))
}

struct RejectingTranslator {
    message: &'static str,
}

#[async_trait]
impl Translator for RejectingTranslator {
    async fn validate(&self, _payload: &Value) -> Result<(), TranslateError> {
        Err(TranslateError::Validation(self.message.to_string()))
    }

    async fn translate(
        &self,
        _ctx: &TranslateContext,
        _payload: &Value,
    ) -> Result<ExecutionPlan, TranslateError> {
        Err(TranslateError::Failed("unreachable".to_string()))
    }
}

pub(crate) fn failing_translator(message: &'static str) -> Arc<dyn Translator> {
    Arc::new(RejectingTranslator { message })
}

/// Raw submission body for the standard test intent type.
pub(crate) fn submit_body(key: &str, payload: Value) -> Value {
    json!({
        "api_version": "1",
        "type": "test.kind",
        "type_version": "1",
        "operation": "apply",
        "idempotency_key": key,
        "payload": payload,
    })
}

/// Engine wired with the given translator at `(test.kind, 1)` and a default
/// succeeding adapter named `mock`.
pub(crate) fn test_engine(
    translator: Arc<dyn Translator>,
) -> (Engine, Arc<TestStore>, Arc<RecordingAudit>) {
    let store = Arc::new(TestStore::new());
    let audit = Arc::new(RecordingAudit::new());
    let mut registry = Registry::new();
    registry.register_translator("test.kind", "1", translator);
    registry.register_adapter(Arc::new(ScriptedAdapter::new("mock")));
    let engine = Engine::new(
        Arc::new(registry),
        store.clone(),
        audit.clone(),
        PolicyGate::new(PolicyMode::Enforce),
        Arc::new(StaticContextProvider::new()),
        Arc::new(Metrics::new()),
    );
    (engine, store, audit)
}

/// Engine wired with the given adapters only (plans are built by hand).
pub(crate) fn scripted_engine(adapters: Vec<Arc<ScriptedAdapter>>) -> Engine {
    let mut registry = Registry::new();
    for adapter in adapters {
        registry.register_adapter(adapter);
    }
    Engine::new(
        Arc::new(registry),
        Arc::new(TestStore::new()),
        Arc::new(RecordingAudit::new()),
        PolicyGate::new(PolicyMode::Enforce),
        Arc::new(StaticContextProvider::new()),
        Arc::new(Metrics::new()),
    )
}
