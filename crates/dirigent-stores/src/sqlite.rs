//! SQLite-backed store implementations via sqlx
//!
//! Two logical tables back the request store: `requests` (one row per
//! record, JSON columns as TEXT) and `external_refs` (the external-id
//! index, rebuilt delete-then-insert inside the same transaction as the
//! record update). The audit sink uses an `audit_events` table ordered by
//! rowid.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use dirigent_core::store::{AuditSink, RecordPatch, RequestStore, StoreError};
use dirigent_core::types::{
    AuditEvent, AuditLevel, AuditStage, Envelope, ExecutionPlan, RequestRecord, RequestStatus,
    TaskRef, TaskResult,
};

fn internal(err: sqlx::Error) -> StoreError {
    StoreError::Internal(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(value: &str) -> Result<T, StoreError> {
    serde_json::from_str(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

async fn open_pool(path: &Path) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Connection(e.to_string()))
}

/// Durable request store on SQLite.
pub struct SqliteRequestStore {
    pool: SqlitePool,
}

impl SqliteRequestStore {
    /// Open (creating if missing) the database at `path`.
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        Self::from_pool(open_pool(path).await?).await
    }

    /// Build on an existing pool, ensuring the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS requests (
                request_id TEXT PRIMARY KEY,
                idempotency_key TEXT NOT NULL UNIQUE,
                envelope_json TEXT NOT NULL,
                plan_json TEXT,
                results_json TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_status_created
             ON requests (status, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS external_refs (
                backend TEXT NOT NULL,
                external_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                task_id TEXT NOT NULL,
                PRIMARY KEY (backend, external_id)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_external_refs_request
             ON external_refs (request_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<RequestRecord, StoreError> {
        let envelope: Envelope = from_json(&row.try_get::<String, _>("envelope_json").map_err(internal)?)?;
        let plan: Option<ExecutionPlan> = row
            .try_get::<Option<String>, _>("plan_json")
            .map_err(internal)?
            .map(|json| from_json(&json))
            .transpose()?;
        let results: Option<Vec<TaskResult>> = row
            .try_get::<Option<String>, _>("results_json")
            .map_err(internal)?
            .map(|json| from_json(&json))
            .transpose()?;
        let status_text: String = row.try_get("status").map_err(internal)?;
        let status = RequestStatus::parse(&status_text).ok_or_else(|| {
            StoreError::Serialization(format!("unknown request status '{status_text}'"))
        })?;
        Ok(RequestRecord {
            request_id: row.try_get("request_id").map_err(internal)?,
            envelope,
            plan,
            results,
            status,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(internal)?,
            updated_at: row
                .try_get::<DateTime<Utc>, _>("updated_at")
                .map_err(internal)?,
        })
    }
}

async fn reindex_externals(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    request_id: &str,
    results: &[TaskResult],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM external_refs WHERE request_id = ?")
        .bind(request_id)
        .execute(&mut **tx)
        .await
        .map_err(internal)?;
    for result in results {
        if let Some(external_id) = &result.external_id {
            sqlx::query(
                "INSERT OR REPLACE INTO external_refs (backend, external_id, request_id, task_id)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&result.backend)
            .bind(external_id)
            .bind(request_id)
            .bind(&result.task_id)
            .execute(&mut **tx)
            .await
            .map_err(internal)?;
        }
    }
    Ok(())
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn create(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let insert = sqlx::query(
            "INSERT INTO requests
                (request_id, idempotency_key, envelope_json, plan_json, results_json,
                 status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.request_id)
        .bind(&record.envelope.idempotency_key)
        .bind(to_json(&record.envelope)?)
        .bind(record.plan.as_ref().map(to_json).transpose()?)
        .bind(record.results.as_ref().map(to_json).transpose()?)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await;
        if let Err(err) = insert {
            if is_unique_violation(&err) {
                return Err(StoreError::DuplicateKey(
                    record.envelope.idempotency_key.clone(),
                ));
            }
            return Err(internal(err));
        }
        if let Some(results) = &record.results {
            reindex_externals(&mut tx, &record.request_id, results).await?;
        }
        tx.commit().await.map_err(internal)
    }

    async fn update(&self, request_id: &str, patch: RecordPatch) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(internal)?;
        let row = sqlx::query("SELECT * FROM requests WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(internal)?
            .ok_or_else(|| StoreError::NotFound(request_id.to_string()))?;
        let mut record = Self::row_to_record(&row)?;

        if let Some(plan) = patch.plan {
            record.plan = Some(plan);
        }
        if let Some(results) = patch.results {
            record.results = Some(results);
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        record.updated_at = Utc::now();

        sqlx::query(
            "UPDATE requests
             SET plan_json = ?, results_json = ?, status = ?, updated_at = ?
             WHERE request_id = ?",
        )
        .bind(record.plan.as_ref().map(to_json).transpose()?)
        .bind(record.results.as_ref().map(to_json).transpose()?)
        .bind(record.status.as_str())
        .bind(record.updated_at)
        .bind(request_id)
        .execute(&mut *tx)
        .await
        .map_err(internal)?;

        if let Some(results) = &record.results {
            reindex_externals(&mut tx, request_id, results).await?;
        }
        tx.commit().await.map_err(internal)
    }

    async fn get(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM requests WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| Self::row_to_record(&r)).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<RequestRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM requests WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.map(|r| Self::row_to_record(&r)).transpose()
    }

    async fn list_by_status(
        &self,
        statuses: &[RequestStatus],
        limit: usize,
    ) -> Result<Vec<RequestRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM requests WHERE status IN ({placeholders})
             ORDER BY created_at ASC LIMIT ?"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        query = query.bind(limit as i64);
        let rows = query.fetch_all(&self.pool).await.map_err(internal)?;
        rows.iter().map(Self::row_to_record).collect()
    }

    async fn find_task_by_external_id(
        &self,
        backend: &str,
        external_id: &str,
    ) -> Result<Option<TaskRef>, StoreError> {
        let row = sqlx::query(
            "SELECT request_id, task_id FROM external_refs
             WHERE backend = ? AND external_id = ?",
        )
        .bind(backend)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|r| {
            Ok(TaskRef {
                request_id: r.try_get("request_id").map_err(internal)?,
                task_id: r.try_get("task_id").map_err(internal)?,
            })
        })
        .transpose()
    }
}

/// Durable audit sink on SQLite.
pub struct SqliteAuditSink {
    pool: SqlitePool,
}

impl SqliteAuditSink {
    pub async fn connect(path: &Path) -> Result<Self, StoreError> {
        Self::from_pool(open_pool(path).await?).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let sink = Self { pool };
        sink.ensure_schema().await?;
        Ok(sink)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                request_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                stage TEXT NOT NULL,
                message TEXT NOT NULL,
                data_json TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_events_request
             ON audit_events (request_id, timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for SqliteAuditSink {
    async fn append(&self, event: AuditEvent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO audit_events (request_id, timestamp, level, stage, message, data_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.request_id)
        .bind(event.timestamp)
        .bind(event.level.as_str())
        .bind(event.stage.as_str())
        .bind(&event.message)
        .bind(event.data.as_ref().map(to_json).transpose()?)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn query(&self, request_id: &str, limit: usize) -> Result<Vec<AuditEvent>, StoreError> {
        let rows = sqlx::query(
            "SELECT request_id, timestamp, level, stage, message, data_json
             FROM audit_events WHERE request_id = ? ORDER BY id ASC LIMIT ?",
        )
        .bind(request_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;

        rows.iter()
            .map(|row| {
                let level_text: String = row.try_get("level").map_err(internal)?;
                let stage_text: String = row.try_get("stage").map_err(internal)?;
                let level = AuditLevel::parse(&level_text).ok_or_else(|| {
                    StoreError::Serialization(format!("unknown audit level '{level_text}'"))
                })?;
                let stage = AuditStage::parse(&stage_text).ok_or_else(|| {
                    StoreError::Serialization(format!("unknown audit stage '{stage_text}'"))
                })?;
                let data = row
                    .try_get::<Option<String>, _>("data_json")
                    .map_err(internal)?
                    .map(|json| from_json(&json))
                    .transpose()?;
                Ok(AuditEvent {
                    request_id: row.try_get("request_id").map_err(internal)?,
                    timestamp: row
                        .try_get::<DateTime<Utc>, _>("timestamp")
                        .map_err(internal)?,
                    level,
                    stage,
                    message: row.try_get("message").map_err(internal)?,
                    data,
                })
            })
            .collect()
    }
}
