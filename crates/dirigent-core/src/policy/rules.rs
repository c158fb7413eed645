//! Config-driven policy profiles
//!
//! A profile is a declarative restriction loaded from `config/policy.json`:
//! it fires when a plan touches a listed backend or action, or exceeds a
//! task budget, scoped to the listed intent types (empty scope = all types).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{PolicyEffect, PolicyInput, PolicyRule};

/// Declarative rule specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub id: String,
    pub effect: PolicyEffect,
    pub message: String,
    /// Intent types this profile applies to; empty means every type
    #[serde(default)]
    pub types: Vec<String>,
    /// Backends that trigger the profile
    #[serde(default)]
    pub backends: Vec<String>,
    /// Actions that trigger the profile
    #[serde(default)]
    pub actions: Vec<String>,
    /// Maximum allowed task count, if bounded
    #[serde(default)]
    pub max_tasks: Option<usize>,
}

/// `PolicyRule` over one profile.
pub struct ProfileRule {
    profile: PolicyProfile,
}

impl ProfileRule {
    pub fn new(profile: PolicyProfile) -> Self {
        Self { profile }
    }

    fn applies_to(&self, kind: &str) -> bool {
        self.profile.types.is_empty() || self.profile.types.iter().any(|t| t == kind)
    }

    fn violation(&self, detail: Value) -> Value {
        json!({
            "id": &self.profile.id,
            "effect": self.profile.effect,
            "message": &self.profile.message,
            "data": detail,
        })
    }
}

impl PolicyRule for ProfileRule {
    fn id(&self) -> &str {
        &self.profile.id
    }

    fn evaluate(&self, input: &PolicyInput<'_>) -> Vec<Value> {
        if !self.applies_to(&input.envelope.kind) {
            return Vec::new();
        }

        let mut violations = Vec::new();

        for task in &input.plan.tasks {
            if self.profile.backends.iter().any(|b| b == &task.backend) {
                violations.push(self.violation(json!({
                    "task_id": &task.id,
                    "backend": &task.backend,
                })));
            } else if self.profile.actions.iter().any(|a| a == &task.action) {
                violations.push(self.violation(json!({
                    "task_id": &task.id,
                    "action": &task.action,
                })));
            }
        }

        if let Some(max) = self.profile.max_tasks {
            if input.plan.len() > max {
                violations.push(self.violation(json!({
                    "task_count": input.plan.len(),
                    "max_tasks": max,
                })));
            }
        }

        violations
    }
}
