//! Adapter abstraction
//!
//! An adapter executes one task against one backend. Synchronous adapters
//! return a terminal status from `execute`; asynchronous ones return
//! `running` plus an external id and complete later via `check_status`
//! polling or an inbound callback.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{ExecutionTask, TaskError, TaskStatus};

/// Adapter call errors
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("backend call failed: {0}")]
    Backend(String),

    #[error("status polling not supported")]
    PollingUnsupported,
}

/// What an adapter reports back for a task.
#[derive(Debug, Clone)]
pub struct AdapterResult {
    pub status: TaskStatus,
    pub external_id: Option<String>,
    pub output: Option<Value>,
    pub error: Option<TaskError>,
}

impl AdapterResult {
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            status,
            external_id: None,
            output: None,
            error: None,
        }
    }

    pub fn succeeded() -> Self {
        Self::with_status(TaskStatus::Succeeded)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let mut result = Self::with_status(TaskStatus::Failed);
        result.error = Some(TaskError::new(message));
        result
    }

    /// Async acceptance: the backend took the work and handed back a job id.
    pub fn running(external_id: impl Into<String>) -> Self {
        let mut result = Self::with_status(TaskStatus::Running);
        result.external_id = Some(external_id.into());
        result
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Per-backend configuration and secrets assembled for one adapter call.
#[derive(Debug, Clone, Default)]
pub struct BackendContext {
    pub config: Value,
    pub secrets: Value,
}

/// Execution context handed to an adapter.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub request_id: String,
    pub task: ExecutionTask,
    pub config: Value,
    pub secrets: Value,
}

impl AdapterContext {
    pub fn new(request_id: impl Into<String>, task: ExecutionTask) -> Self {
        Self {
            request_id: request_id.into(),
            task,
            config: Value::Null,
            secrets: Value::Null,
        }
    }

    pub fn with_backend_context(mut self, backend: BackendContext) -> Self {
        self.config = backend.config;
        self.secrets = backend.secrets;
        self
    }
}

/// Adapter trait - executes tasks against one backend
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Backend name this adapter serves (must be unique)
    fn name(&self) -> &str;

    /// Execute the task. May return a terminal status or `running` with an
    /// external id for later convergence.
    async fn execute(
        &self,
        task: &ExecutionTask,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError>;

    /// Poll the backend for the state of an async job.
    ///
    /// The default signals that this adapter does not poll; such tasks only
    /// converge through callbacks.
    async fn check_status(
        &self,
        external_id: &str,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult, AdapterError> {
        let _ = (external_id, ctx);
        Err(AdapterError::PollingUnsupported)
    }
}

/// Provider errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("context assembly failed: {0}")]
    Failed(String),
}

/// Pluggable source of per-backend config and secrets.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn context_for(&self, backend: &str) -> Result<BackendContext, ProviderError>;
}

/// Provider backed by static maps, typically loaded from config files.
#[derive(Default)]
pub struct StaticContextProvider {
    entries: HashMap<String, BackendContext>,
}

impl StaticContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, backend: impl Into<String>, context: BackendContext) {
        self.entries.insert(backend.into(), context);
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    async fn context_for(&self, backend: &str) -> Result<BackendContext, ProviderError> {
        Ok(self.entries.get(backend).cloned().unwrap_or_default())
    }
}
