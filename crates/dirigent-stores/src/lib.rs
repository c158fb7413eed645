//! Store implementations for Dirigent
//!
//! - In-memory: development and testing
//! - SQLite via sqlx: single-node durable deployments
//!
//! Both satisfy the contracts in `dirigent_core::store`; the engine and
//! runner never depend on backend-specific semantics.

mod memory;
mod sqlite;

pub use memory::{InMemoryAuditSink, InMemoryRequestStore};
pub use sqlite::{SqliteAuditSink, SqliteRequestStore};

pub use dirigent_core::store::{AuditSink, RecordPatch, RequestStore, StoreError};
