//! Store contracts
//!
//! - RequestStore: durable map from request_id to a request record, with
//!   secondary indexes by idempotency key and by (backend, external_id)
//! - AuditSink: append-only event log keyed by request_id
//!
//! Note: Implementations are in the dirigent-stores crate

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    AuditEvent, ExecutionPlan, RequestRecord, RequestStatus, TaskRef, TaskResult,
};

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("duplicate idempotency key: {0}")]
    DuplicateKey(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Partial update applied to one record.
///
/// Absent fields are left untouched; `updated_at` is maintained by the store.
#[derive(Debug, Clone, Default)]
pub struct RecordPatch {
    pub plan: Option<ExecutionPlan>,
    pub results: Option<Vec<TaskResult>>,
    pub status: Option<RequestStatus>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_results(mut self, results: Vec<TaskResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// RequestStore trait - async interface for request persistence
///
/// Implementations must keep the external-id index consistent with the
/// stored `results` (rebuild on every update) and apply each operation
/// atomically with respect to concurrent readers.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a new record; fails with `DuplicateKey` when the idempotency
    /// key is already held by a live record.
    async fn create(&self, record: &RequestRecord) -> Result<(), StoreError>;

    /// Apply a patch to an existing record.
    async fn update(&self, request_id: &str, patch: RecordPatch) -> Result<(), StoreError>;

    async fn get(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RequestRecord>, StoreError>;

    /// Records in any of the given statuses, ascending `created_at`,
    /// truncated to `limit`.
    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError>;

    async fn find_task_by_external_id(
        &self,
        backend: &str,
        external_id: &str,
    ) -> Result<Option<TaskRef>, StoreError>;
}

/// AuditSink trait - append-only audit log
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError>;

    /// Events for one request in insertion order, truncated to `limit`.
    ///
    /// Sinks that cannot serve reads return `Unsupported`.
    async fn query(&self, request_id: &str, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let _ = (request_id, limit);
        Err(StoreError::Unsupported("audit query"))
    }
}
