//! Engine - request lifecycle orchestration
//!
//! The engine drives translate → policy → execute:
//! - admission with idempotent replay and conflict detection
//! - translator resolution and payload validation
//! - policy gating before the record is stored
//! - DAG execution with dependency scheduling (see `execute`)
//! - deterministic request-level status roll-up

mod execute;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::adapter::ContextProvider;
use crate::fingerprint::{envelope_fingerprint, Fingerprint};
use crate::locks::RecordLocks;
use crate::policy::{Decision, PolicyGate, PolicyInput, Violation};
use crate::registry::Registry;
use crate::store::{AuditSink, RecordPatch, RequestStore, StoreError};
use crate::telemetry::Metrics;
use crate::translator::TranslateContext;
use crate::types::{
    AuditEvent, AuditStage, Envelope, EnvelopeError, ExecutionPlan, Operation, RequestRecord,
    RequestStatus, TaskResult, TaskStatus,
};

pub use execute::ExecutionOutcome;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] EnvelopeError),

    #[error("idempotency key '{key}' already used by request {request_id} with a different request")]
    IdempotencyConflict { key: String, request_id: String },

    #[error("no translator registered for {kind} v{kind_version}")]
    NoTranslator { kind: String, kind_version: String },

    #[error("payload validation failed: {0}")]
    ValidationFailed(String),

    #[error("translation failed: {0}")]
    TranslateFailed(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Options for a single `handle` invocation.
#[derive(Debug, Clone)]
pub struct HandleOptions {
    pub request_id: String,
    /// Execute the plan inline instead of parking it for the runner
    pub execute: bool,
}

/// What `handle` returns to the caller.
#[derive(Debug)]
pub struct HandleOutcome {
    pub request_id: String,
    pub plan: ExecutionPlan,
    pub results: Option<Vec<TaskResult>>,
    pub status: RequestStatus,
    pub violations: Vec<Violation>,
}

/// Admission outcome for a raw submission.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub request_id: String,
    pub status: RequestStatus,
    /// True when an equivalent prior submission was matched by key
    pub idempotent_replay: bool,
    pub violations: Vec<Violation>,
}

/// The engine: registry + store + policy + telemetry, explicitly wired.
pub struct Engine {
    pub(crate) registry: Arc<Registry>,
    pub(crate) store: Arc<dyn RequestStore>,
    pub(crate) audit: Arc<dyn AuditSink>,
    pub(crate) policy: PolicyGate,
    pub(crate) provider: Arc<dyn ContextProvider>,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) locks: Arc<RecordLocks>,
}

impl Engine {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn RequestStore>,
        audit: Arc<dyn AuditSink>,
        policy: PolicyGate,
        provider: Arc<dyn ContextProvider>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            store,
            audit,
            policy,
            provider,
            metrics,
            locks: Arc::new(RecordLocks::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The lock table serializing writes per request id.
    ///
    /// The runner and callback ingester must take their locks from this same
    /// table; every write to one record then has a single writer.
    pub fn locks(&self) -> Arc<RecordLocks> {
        self.locks.clone()
    }

    /// Admit a raw submission body.
    ///
    /// Same key + same fingerprint replays the existing record; same key +
    /// different fingerprint is a hard conflict. Fresh keys proceed through
    /// `handle` with a newly generated request id.
    pub async fn submit(&self, raw: Value) -> Result<SubmitOutcome, EngineError> {
        let envelope = Envelope::validate(raw)?;
        let fingerprint = envelope_fingerprint(&envelope);

        if let Some(existing) = self
            .store
            .find_by_idempotency_key(&envelope.idempotency_key)
            .await?
        {
            return self.replay_or_conflict(existing, &envelope, &fingerprint);
        }

        let request_id = Uuid::new_v4().to_string();
        let options = HandleOptions {
            request_id: request_id.clone(),
            execute: false,
        };
        match self.handle(envelope.clone(), options).await {
            Ok(outcome) => Ok(SubmitOutcome {
                request_id,
                status: outcome.status,
                idempotent_replay: false,
                violations: outcome.violations,
            }),
            Err(EngineError::Store(StoreError::DuplicateKey(_))) => {
                // Lost an admission race: resolve against the winner.
                let existing = self
                    .store
                    .find_by_idempotency_key(&envelope.idempotency_key)
                    .await?
                    .ok_or_else(|| {
                        EngineError::Store(StoreError::Internal(
                            "record vanished after duplicate-key conflict".to_string(),
                        ))
                    })?;
                self.replay_or_conflict(existing, &envelope, &fingerprint)
            }
            Err(err) => Err(err),
        }
    }

    fn replay_or_conflict(
        &self,
        existing: RequestRecord,
        envelope: &Envelope,
        fingerprint: &Fingerprint,
    ) -> Result<SubmitOutcome, EngineError> {
        if envelope_fingerprint(&existing.envelope) == *fingerprint {
            self.metrics.incr("requests_replayed_total");
            tracing::info!(
                request_id = %existing.request_id,
                idempotency_key = %envelope.idempotency_key,
                "idempotent replay"
            );
            let violations = if existing.status == RequestStatus::Denied {
                violations_from_denied(&existing)
            } else {
                Vec::new()
            };
            Ok(SubmitOutcome {
                request_id: existing.request_id,
                status: existing.status,
                idempotent_replay: true,
                violations,
            })
        } else {
            self.metrics.incr("idempotency_conflicts_total");
            Err(EngineError::IdempotencyConflict {
                key: envelope.idempotency_key.clone(),
                request_id: existing.request_id,
            })
        }
    }

    /// Translate, gate, and persist one validated envelope.
    pub async fn handle(
        &self,
        envelope: Envelope,
        options: HandleOptions,
    ) -> Result<HandleOutcome, EngineError> {
        let request_id = options.request_id;
        self.metrics.incr("requests_received_total");
        self.audit_log(
            AuditEvent::info(&request_id, AuditStage::Receive, "envelope received").with_data(
                json!({
                    "type": &envelope.kind,
                    "type_version": &envelope.kind_version,
                    "operation": envelope.operation.as_str(),
                    "idempotency_key": &envelope.idempotency_key,
                }),
            ),
        )
        .await;

        let Some(translator) = self.registry.translator(&envelope.kind, &envelope.kind_version)
        else {
            let err = EngineError::NoTranslator {
                kind: envelope.kind.clone(),
                kind_version: envelope.kind_version.clone(),
            };
            self.metrics.incr("translate_failures_total");
            self.audit_log(AuditEvent::error(
                &request_id,
                AuditStage::Translate,
                err.to_string(),
            ))
            .await;
            return Err(err);
        };

        if let Err(err) = translator.validate(&envelope.payload).await {
            self.metrics.incr("validation_failures_total");
            self.audit_log(AuditEvent::error(
                &request_id,
                AuditStage::Validate,
                err.to_string(),
            ))
            .await;
            return Err(EngineError::ValidationFailed(err.to_string()));
        }

        let ctx = TranslateContext {
            request_id: request_id.clone(),
            kind: envelope.kind.clone(),
            kind_version: envelope.kind_version.clone(),
            operation: envelope.operation,
            target: envelope.target.clone(),
            tags: envelope.tags.clone().unwrap_or_default(),
        };
        let plan = match translator.translate(&ctx, &envelope.payload).await {
            Ok(plan) => plan,
            Err(err) => {
                self.metrics.incr("translate_failures_total");
                self.audit_log(AuditEvent::error(
                    &request_id,
                    AuditStage::Translate,
                    err.to_string(),
                ))
                .await;
                return Err(EngineError::TranslateFailed(err.to_string()));
            }
        };
        self.audit_log(
            AuditEvent::info(&request_id, AuditStage::Translate, "plan produced")
                .with_data(json!({"task_count": plan.len()})),
        )
        .await;

        let outcome = self.policy.evaluate(&PolicyInput {
            request_id: &request_id,
            envelope: &envelope,
            plan: &plan,
        });
        let decision_label = match outcome.decision {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        };
        let policy_event = if outcome.violations.is_empty() {
            AuditEvent::info(&request_id, AuditStage::Policy, "policy evaluated")
        } else {
            AuditEvent::warn(&request_id, AuditStage::Policy, "policy evaluated")
        };
        self.audit_log(policy_event.with_data(json!({
            "decision": decision_label,
            "violations": &outcome.violations,
        })))
        .await;

        if outcome.decision == Decision::Deny && envelope.operation == Operation::Apply {
            return self
                .deny_request(request_id, envelope, plan, outcome.violations)
                .await;
        }

        let parked_status = match envelope.operation {
            Operation::Apply => RequestStatus::Queued,
            _ => RequestStatus::Planned,
        };
        let record = RequestRecord::new(&request_id, envelope.clone(), parked_status)
            .with_plan(plan.clone());
        self.store.create(&record).await?;
        tracing::info!(
            request_id = %request_id,
            status = parked_status.as_str(),
            task_count = plan.len(),
            "request stored"
        );

        if options.execute {
            // synchronous execution takes the same per-record lock as the
            // runner and callback ingester; seeding from the stored results
            // keeps a concurrently drained record from executing twice
            let _guard = self.locks.lock(&request_id).await;
            let existing = self
                .store
                .get(&request_id)
                .await?
                .and_then(|record| record.results);
            let execution = self
                .execute_plan(&request_id, &envelope, &plan, existing)
                .await?;
            self.store
                .update(
                    &request_id,
                    RecordPatch::new()
                        .with_results(execution.results.clone())
                        .with_status(execution.status),
                )
                .await?;
            return Ok(HandleOutcome {
                request_id,
                plan,
                results: Some(execution.results),
                status: execution.status,
                violations: outcome.violations,
            });
        }

        Ok(HandleOutcome {
            request_id,
            plan,
            results: None,
            status: parked_status,
            violations: outcome.violations,
        })
    }

    async fn deny_request(
        &self,
        request_id: String,
        envelope: Envelope,
        plan: ExecutionPlan,
        violations: Vec<Violation>,
    ) -> Result<HandleOutcome, EngineError> {
        self.metrics.incr("policy_denied_total");
        let reason = violations
            .first()
            .map(|v| v.message.clone())
            .unwrap_or_else(|| "denied by policy".to_string());
        let results: Vec<TaskResult> = plan
            .tasks
            .iter()
            .map(|task| {
                let mut result = TaskResult::queued(&task.id, &task.backend);
                result.cancel(reason.clone());
                result
            })
            .collect();
        let record = RequestRecord::new(&request_id, envelope, RequestStatus::Denied)
            .with_plan(plan.clone())
            .with_results(results.clone());
        self.store.create(&record).await?;
        tracing::warn!(request_id = %request_id, reason = %reason, "request denied by policy");
        Ok(HandleOutcome {
            request_id,
            plan,
            results: Some(results),
            status: RequestStatus::Denied,
            violations,
        })
    }

    /// Assemble the adapter context for one task.
    ///
    /// Provider failure must not abort the task; the adapter is invoked with
    /// a minimal context instead.
    pub async fn adapter_context(
        &self,
        request_id: &str,
        task: &crate::types::ExecutionTask,
    ) -> crate::adapter::AdapterContext {
        let base = crate::adapter::AdapterContext::new(request_id, task.clone());
        match self.provider.context_for(&task.backend).await {
            Ok(backend_context) => base.with_backend_context(backend_context),
            Err(err) => {
                tracing::error!(
                    request_id = %request_id,
                    backend = %task.backend,
                    error = %err,
                    "context provider failed; invoking adapter with minimal context"
                );
                base
            }
        }
    }

    /// Append an audit event; sink failures are logged, never fatal.
    pub(crate) async fn audit_log(&self, event: AuditEvent) {
        if let Err(err) = self.audit.append(event).await {
            tracing::error!(error = %err, "audit sink append failed");
        }
    }
}

/// Derive the request-level status from per-task results.
///
/// Any failed or canceled task fails the request; a fully succeeded task set
/// is executed; pending work keeps it running; an empty plan is executed.
pub fn rollup(plan: &ExecutionPlan, results: &[TaskResult]) -> RequestStatus {
    let by_id: HashMap<&str, TaskStatus> = results
        .iter()
        .map(|r| (r.task_id.as_str(), r.status))
        .collect();
    rollup_with(plan, |id| by_id.get(id).copied())
}

pub(crate) fn rollup_with<F>(plan: &ExecutionPlan, status_of: F) -> RequestStatus
where
    F: Fn(&str) -> Option<TaskStatus>,
{
    let mut pending = false;
    for task in &plan.tasks {
        match status_of(&task.id) {
            Some(TaskStatus::Failed) | Some(TaskStatus::Canceled) => return RequestStatus::Failed,
            Some(TaskStatus::Succeeded) => {}
            Some(TaskStatus::Running) | Some(TaskStatus::Queued) | None => pending = true,
        }
    }
    if pending {
        RequestStatus::Running
    } else {
        RequestStatus::Executed
    }
}

fn violations_from_denied(record: &RequestRecord) -> Vec<Violation> {
    record
        .results
        .as_deref()
        .and_then(|results| {
            results
                .iter()
                .find_map(|r| r.error.as_ref().map(|e| e.message.clone()))
        })
        .map(|message| {
            vec![Violation {
                id: "policy".to_string(),
                effect: crate::policy::PolicyEffect::Deny,
                message,
                data: None,
            }]
        })
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing;
