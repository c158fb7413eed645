//! In-memory implementations for development and testing
//!
//! A single lock guards the record map and both secondary indexes, so every
//! operation is observed atomically.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use dirigent_core::store::{AuditSink, RecordPatch, RequestStore, StoreError};
use dirigent_core::types::{AuditEvent, RequestRecord, RequestStatus, TaskRef, TaskResult};

#[derive(Default)]
struct Inner {
    records: HashMap<String, RequestRecord>,
    /// idempotency_key → request_id
    by_key: HashMap<String, String>,
    /// (backend, external_id) → owning task
    external: HashMap<(String, String), TaskRef>,
}

impl Inner {
    fn reindex_externals(&mut self, request_id: &str, results: &[TaskResult]) {
        self.external
            .retain(|_, task_ref| task_ref.request_id != request_id);
        for result in results {
            if let Some(external_id) = &result.external_id {
                self.external.insert(
                    (result.backend.clone(), external_id.clone()),
                    TaskRef {
                        request_id: request_id.to_string(),
                        task_id: result.task_id.clone(),
                    },
                );
            }
        }
    }
}

/// In-memory request store
pub struct InMemoryRequestStore {
    inner: RwLock<Inner>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let key = record.envelope.idempotency_key.clone();
        if inner.by_key.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key));
        }
        inner.by_key.insert(key, record.request_id.clone());
        if let Some(results) = &record.results {
            let results = results.clone();
            inner.reindex_externals(&record.request_id, &results);
        }
        inner
            .records
            .insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn update(&self, request_id: &str, patch: RecordPatch) -> Result<(), StoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let record = inner
            .records
            .get_mut(request_id)
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
        if let Some(plan) = patch.plan {
            record.plan = Some(plan);
        }
        let results_for_index = if let Some(results) = patch.results {
            record.results = Some(results.clone());
            Some(results)
        } else {
            None
        };
        if let Some(status) = patch.status {
            record.status = status;
        }
        record.updated_at = Utc::now();
        if let Some(results) = results_for_index {
            inner.reindex_externals(request_id, &results);
        }
        Ok(())
    }

    async fn get(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(inner.records.get(request_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RequestRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(inner
            .by_key
            .get(key)
            .and_then(|id| inner.records.get(id))
            .cloned())
    }

    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let mut matched: Vec<RequestRecord> = inner
            .records
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        matched.truncate(limit);
        Ok(matched)
    }

    async fn find_task_by_external_id(
        &self,
        backend: &str,
        external_id: &str,
    ) -> Result<Option<TaskRef>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(inner
            .external
            .get(&(backend.to_string(), external_id.to_string()))
            .cloned())
    }
}

/// In-memory audit sink with query support
pub struct InMemoryAuditSink {
    events: RwLock<HashMap<String, Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        events
            .entry(event.request_id.clone())
            .or_default()
            .push(event);
        Ok(())
    }

    async fn query(&self, request_id: &str, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let events = self
            .events
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(events
            .get(request_id)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirigent_core::types::{AuditStage, Envelope, TaskStatus};
    use serde_json::json;

    fn record(request_id: &str, key: &str, status: RequestStatus) -> RequestRecord {
        let envelope = Envelope::validate(json!({
            "api_version": "1",
            "type": "t",
            "type_version": "1",
            "operation": "apply",
            "idempotency_key": key,
            "payload": {}
        }))
        .expect("valid");
        RequestRecord::new(request_id, envelope, status)
    }

    fn result_with_external(task_id: &str, backend: &str, external_id: &str) -> TaskResult {
        let mut result = TaskResult::queued(task_id, backend);
        result.status = TaskStatus::Running;
        result.external_id = Some(external_id.to_string());
        result
    }

    #[test]
    fn test_create_rejects_duplicate_idempotency_key() {
        tokio_test::block_on(async {
            let store = InMemoryRequestStore::new();
            store
                .create(&record("r1", "k1", RequestStatus::Queued))
                .await
                .expect("first create");
            let err = store
                .create(&record("r2", "k1", RequestStatus::Queued))
                .await
                .expect_err("duplicate");
            assert!(matches!(err, StoreError::DuplicateKey(_)));
        });
    }

    #[test]
    fn test_external_index_follows_results() {
        tokio_test::block_on(async {
            let store = InMemoryRequestStore::new();
            store
                .create(&record("r1", "k1", RequestStatus::Running))
                .await
                .unwrap();

            store
                .update(
                    "r1",
                    RecordPatch::new()
                        .with_results(vec![result_with_external("t1", "aws", "job-1")]),
                )
                .await
                .unwrap();
            let found = store
                .find_task_by_external_id("aws", "job-1")
                .await
                .unwrap()
                .expect("indexed");
            assert_eq!(found.request_id, "r1");
            assert_eq!(found.task_id, "t1");

            // rewriting results without the external id drops the entry
            store
                .update(
                    "r1",
                    RecordPatch::new().with_results(vec![TaskResult::queued("t1", "aws")]),
                )
                .await
                .unwrap();
            assert!(store
                .find_task_by_external_id("aws", "job-1")
                .await
                .unwrap()
                .is_none());
        });
    }

    #[test]
    fn test_external_index_is_scoped_by_backend() {
        tokio_test::block_on(async {
            let store = InMemoryRequestStore::new();
            store
                .create(&record("r1", "k1", RequestStatus::Running))
                .await
                .unwrap();
            store
                .update(
                    "r1",
                    RecordPatch::new()
                        .with_results(vec![result_with_external("t1", "aws", "job-1")]),
                )
                .await
                .unwrap();
            assert!(store
                .find_task_by_external_id("gcp", "job-1")
                .await
                .unwrap()
                .is_none());
        });
    }

    #[test]
    fn test_list_by_status_is_fifo_and_limited() {
        tokio_test::block_on(async {
            let store = InMemoryRequestStore::new();
            for i in 0..4 {
                let mut rec = record(&format!("r{i}"), &format!("k{i}"), RequestStatus::Queued);
                rec.created_at = chrono::Utc::now() + chrono::Duration::milliseconds(i);
                store.create(&rec).await.unwrap();
            }
            let listed = store
                .list_by_status(&[RequestStatus::Queued], 2)
                .await
                .unwrap();
            assert_eq!(listed.len(), 2);
            assert_eq!(listed[0].request_id, "r0");
            assert_eq!(listed[1].request_id, "r1");
        });
    }

    #[test]
    fn test_update_missing_record_is_not_found() {
        tokio_test::block_on(async {
            let store = InMemoryRequestStore::new();
            let err = store
                .update("ghost", RecordPatch::new().with_status(RequestStatus::Failed))
                .await
                .expect_err("missing");
            assert!(matches!(err, StoreError::NotFound(_)));
        });
    }

    #[test]
    fn test_audit_sink_preserves_insertion_order() {
        tokio_test::block_on(async {
            let sink = InMemoryAuditSink::new();
            sink.append(AuditEvent::info("r1", AuditStage::Receive, "first"))
                .await
                .unwrap();
            sink.append(AuditEvent::info("r1", AuditStage::Translate, "second"))
                .await
                .unwrap();
            sink.append(AuditEvent::info("r2", AuditStage::Receive, "other"))
                .await
                .unwrap();

            let events = sink.query("r1", 10).await.unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].message, "first");
            assert_eq!(events[1].message, "second");

            let limited = sink.query("r1", 1).await.unwrap();
            assert_eq!(limited.len(), 1);
        });
    }
}
