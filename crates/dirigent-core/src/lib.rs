//! # Dirigent Core
//!
//! Core abstractions and deterministic logic for the Dirigent request
//! lifecycle engine.
//!
//! This crate contains:
//! - Envelope / ExecutionPlan / TaskResult / RequestRecord definitions
//! - Canonical fingerprinting for idempotency comparison
//! - Translator / Adapter / ContextProvider abstractions and the registry
//! - The policy gate and config-driven profile rules
//! - The engine: admission, translation, policy, DAG execution, roll-up
//! - Per-record write locks shared by every record writer
//! - Store contracts (implementations live in dirigent-stores)
//!
//! This crate does NOT care about:
//! - How requests arrive (HTTP framing, auth, routing)
//! - What adapters do against their backends
//! - How records are made durable

pub mod adapter;
pub mod engine;
pub mod fingerprint;
pub mod locks;
pub mod policy;
pub mod registry;
pub mod store;
pub mod telemetry;
pub mod translator;
pub mod types;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::adapter::{
        Adapter, AdapterContext, AdapterError, AdapterResult, BackendContext, ContextProvider,
        ProviderError, StaticContextProvider,
    };
    pub use crate::engine::{
        rollup, Engine, EngineError, ExecutionOutcome, HandleOptions, HandleOutcome,
        SubmitOutcome,
    };
    pub use crate::fingerprint::{canonical_json, envelope_fingerprint, value_fingerprint};
    pub use crate::locks::RecordLocks;
    pub use crate::policy::{
        Decision, PolicyEffect, PolicyGate, PolicyInput, PolicyMode, PolicyOutcome,
        PolicyProfile, PolicyRule, ProfileRule, Violation,
    };
    pub use crate::registry::Registry;
    pub use crate::store::{AuditSink, RecordPatch, RequestStore, StoreError};
    pub use crate::telemetry::{Metrics, MetricsSnapshot};
    pub use crate::translator::{TranslateContext, TranslateError, Translator};
    pub use crate::types::{
        AuditEvent, AuditLevel, AuditStage, Envelope, EnvelopeError, ExecutionPlan,
        ExecutionTask, Operation, RequestRecord, RequestStatus, TaskError, TaskRef, TaskResult,
        TaskStatus,
    };
}

// Re-export key types at crate root
pub use adapter::{Adapter, AdapterContext, AdapterResult, ContextProvider};
pub use engine::{rollup, Engine, EngineError, SubmitOutcome};
pub use fingerprint::envelope_fingerprint;
pub use locks::RecordLocks;
pub use policy::{PolicyGate, PolicyMode};
pub use registry::Registry;
pub use store::{AuditSink, RequestStore, StoreError};
pub use telemetry::Metrics;
pub use translator::Translator;
pub use types::{Envelope, ExecutionPlan, RequestRecord, RequestStatus, TaskResult, TaskStatus};
