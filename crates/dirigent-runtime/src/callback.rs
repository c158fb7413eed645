//! Callback ingestion
//!
//! Backends push async task completions to `/v1/callbacks/{backend}`; the
//! ingester maps `(backend, external_id)` to the owning task, folds the
//! update under the record's write lock, recomputes the roll-up, and pokes
//! the runner so unblocked tasks start promptly.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use dirigent_core::engine::rollup;
use dirigent_core::locks::RecordLocks;
use dirigent_core::store::{AuditSink, RecordPatch, RequestStore, StoreError};
use dirigent_core::telemetry::Metrics;
use dirigent_core::types::{AuditEvent, AuditStage, TaskError, TaskStatus};

use crate::runner::Runner;

/// Callback ingest errors
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("invalid callback body: {0}")]
    Invalid(String),

    #[error("no task known for external id '{external_id}' on backend '{backend}'")]
    UnknownExternalId { backend: String, external_id: String },

    #[error("request record gone: {0}")]
    RequestGone(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// What the ingester reports back for the 202 body.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub request_id: String,
    pub task_id: String,
    pub status: TaskStatus,
}

/// Folds inbound backend callbacks into request records.
pub struct CallbackIngester {
    store: Arc<dyn RequestStore>,
    audit: Arc<dyn AuditSink>,
    locks: Arc<RecordLocks>,
    metrics: Arc<Metrics>,
    runner: Arc<Runner>,
}

impl CallbackIngester {
    /// `locks` must be the engine's table (`Engine::locks()`) so callback
    /// folds serialize with the runner and synchronous execution.
    pub fn new(
        store: Arc<dyn RequestStore>,
        audit: Arc<dyn AuditSink>,
        locks: Arc<RecordLocks>,
        metrics: Arc<Metrics>,
        runner: Arc<Runner>,
    ) -> Self {
        Self {
            store,
            audit,
            locks,
            metrics,
            runner,
        }
    }

    /// Ingest one callback body for `backend`.
    pub async fn ingest(
        &self,
        backend: &str,
        body: &Value,
    ) -> Result<CallbackOutcome, CallbackError> {
        let external_id = body
            .get("external_id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CallbackError::Invalid("missing external_id".to_string()))?;

        let task_ref = self
            .store
            .find_task_by_external_id(backend, external_id)
            .await?
            .ok_or_else(|| CallbackError::UnknownExternalId {
                backend: backend.to_string(),
                external_id: external_id.to_string(),
            })?;

        let _guard = self.locks.lock(&task_ref.request_id).await;
        let record = self
            .store
            .get(&task_ref.request_id)
            .await?
            .ok_or_else(|| CallbackError::RequestGone(task_ref.request_id.clone()))?;
        let (Some(plan), Some(mut results)) = (record.plan.clone(), record.results.clone())
        else {
            return Err(CallbackError::RequestGone(task_ref.request_id.clone()));
        };
        let Some(result) = results.iter_mut().find(|r| r.task_id == task_ref.task_id) else {
            return Err(CallbackError::UnknownExternalId {
                backend: backend.to_string(),
                external_id: external_id.to_string(),
            });
        };

        // late duplicates after a terminal state are dropped idempotently
        if result.status.is_terminal() {
            self.metrics.incr("callbacks_dropped_total");
            tracing::info!(
                request_id = %task_ref.request_id,
                task_id = %task_ref.task_id,
                external_id = %external_id,
                "dropping callback for terminal task"
            );
            return Ok(CallbackOutcome {
                request_id: task_ref.request_id.clone(),
                task_id: task_ref.task_id.clone(),
                status: result.status,
            });
        }

        let status = body
            .get("status")
            .and_then(|v| v.as_str())
            .and_then(TaskStatus::parse)
            .unwrap_or(TaskStatus::Running);
        result.status = status;
        if let Some(output) = body.get("output") {
            if !output.is_null() {
                result.output = Some(output.clone());
            }
        }
        if let Some(error) = parse_callback_error(body.get("error")) {
            result.error = Some(error);
        }
        if status.is_terminal() {
            result.finished_at = Some(Utc::now());
        }

        let new_status = rollup(&plan, &results);
        self.store
            .update(
                &task_ref.request_id,
                RecordPatch::new()
                    .with_results(results)
                    .with_status(new_status),
            )
            .await?;
        self.metrics.incr("callbacks_total");
        if let Err(err) = self
            .audit
            .append(
                AuditEvent::info(
                    &task_ref.request_id,
                    AuditStage::Callback,
                    "callback folded",
                )
                .with_data(serde_json::json!({
                    "backend": backend,
                    "external_id": external_id,
                    "task_id": &task_ref.task_id,
                    "status": status.as_str(),
                })),
            )
            .await
        {
            tracing::error!(error = %err, "audit sink append failed");
        }
        tracing::info!(
            request_id = %task_ref.request_id,
            task_id = %task_ref.task_id,
            status = status.as_str(),
            "callback folded"
        );
        self.runner.poke();

        Ok(CallbackOutcome {
            request_id: task_ref.request_id,
            task_id: task_ref.task_id,
            status,
        })
    }
}

/// Accept both `"error": "message"` and `"error": {"message": ...}` shapes.
fn parse_callback_error(value: Option<&Value>) -> Option<TaskError> {
    let value = value?;
    match value {
        Value::String(message) => Some(TaskError::new(message.clone())),
        Value::Object(map) => {
            let message = map
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("backend reported an error")
                .to_string();
            let mut error = TaskError::new(message);
            error.details = Some(value.clone());
            Some(error)
        }
        _ => None,
    }
}
