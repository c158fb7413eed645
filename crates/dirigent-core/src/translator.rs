//! Translator abstraction
//!
//! A translator turns a validated payload into a backend-neutral execution
//! plan. Translators are registered per `(type, type_version)` and own the
//! payload schema; the engine never inspects payloads itself.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{derive_task_id, ExecutionPlan, Operation};

/// Translation errors
#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("payload validation failed: {0}")]
    Validation(String),

    #[error("translation failed: {0}")]
    Failed(String),
}

/// Context handed to a translator for one request.
#[derive(Debug, Clone)]
pub struct TranslateContext {
    pub request_id: String,
    pub kind: String,
    pub kind_version: String,
    pub operation: Operation,
    pub target: Option<Value>,
    pub tags: HashMap<String, String>,
}

impl TranslateContext {
    /// Derive a stable task id for this request.
    ///
    /// The discriminator distinguishes multiple tasks with the same
    /// backend/action pair within one plan.
    pub fn task_id(&self, backend: &str, action: &str, discriminator: &str) -> String {
        derive_task_id(
            &self.request_id,
            &self.kind,
            &self.kind_version,
            backend,
            action,
            discriminator,
        )
    }
}

/// Translator trait - produces an execution plan from a payload
#[async_trait]
pub trait Translator: Send + Sync {
    /// Optional payload validation, run before `translate`.
    ///
    /// The default accepts everything; translators with a payload schema
    /// override this.
    async fn validate(&self, payload: &Value) -> Result<(), TranslateError> {
        let _ = payload;
        Ok(())
    }

    /// Produce the execution plan for this payload.
    async fn translate(
        &self,
        ctx: &TranslateContext,
        payload: &Value,
    ) -> Result<ExecutionPlan, TranslateError>;
}
