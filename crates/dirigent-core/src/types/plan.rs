//! Execution plan definitions
//!
//! A plan is the backend-neutral output of a translator: an ordered set of
//! tasks forming a DAG via `depends_on`. Plans are immutable from the moment
//! they are stored.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One unit of work targeted at a single backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTask {
    /// Unique within the plan; stable across re-translation of the same request
    pub id: String,
    /// Adapter name that will execute this task
    pub backend: String,
    /// Opaque verb the adapter interprets
    pub action: String,
    /// Adapter-specific input
    #[serde(default)]
    pub input: Value,
    /// Ids of tasks that must succeed before this one starts
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
}

impl ExecutionTask {
    pub fn new(
        id: impl Into<String>,
        backend: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            backend: backend.into(),
            action: action.into(),
            input: Value::Null,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// A DAG of backend-neutral tasks produced by a translator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub tasks: Vec<ExecutionTask>,
}

impl ExecutionPlan {
    pub fn new(tasks: Vec<ExecutionTask>) -> Self {
        Self { tasks }
    }

    /// Look up a task by id
    pub fn task(&self, id: &str) -> Option<&ExecutionTask> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Derive a stable task id from the identifying tuple of a task.
///
/// The id is deterministic: re-translating the same request yields the same
/// ids, which keeps existing task results attachable across executions.
pub fn derive_task_id(
    request_id: &str,
    kind: &str,
    kind_version: &str,
    backend: &str,
    action: &str,
    discriminator: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [request_id, kind, kind_version, backend, action, discriminator] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    // 16 hex chars is plenty within a single plan
    let mut id = String::with_capacity(16);
    for byte in &digest[..8] {
        id.push_str(&format!("{:02x}", byte));
    }
    id
}
