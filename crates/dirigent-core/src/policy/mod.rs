//! Policy gate
//!
//! The gate runs once per request, after translation and before the record
//! is stored. Rules see the envelope plus the translated plan and emit raw
//! violations; the gate parses them, drops malformed entries, and derives
//! the allow/deny decision.

mod rules;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Envelope, ExecutionPlan};

pub use rules::{PolicyProfile, ProfileRule};

/// Severity of one violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Warn,
    Deny,
}

/// One policy violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub id: String,
    pub effect: PolicyEffect,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Gate verdict for one request.
#[derive(Debug, Clone)]
pub struct PolicyOutcome {
    pub decision: Decision,
    pub violations: Vec<Violation>,
}

impl PolicyOutcome {
    pub fn allow() -> Self {
        Self {
            decision: Decision::Allow,
            violations: Vec::new(),
        }
    }
}

/// What a rule gets to see.
pub struct PolicyInput<'a> {
    pub request_id: &'a str,
    pub envelope: &'a Envelope,
    pub plan: &'a ExecutionPlan,
}

/// Policy rule hook.
///
/// Rules return violations as raw JSON so that config-driven and scripted
/// rule sources plug in without a recompile; the gate validates the shape.
pub trait PolicyRule: Send + Sync {
    fn id(&self) -> &str;

    fn evaluate(&self, input: &PolicyInput<'_>) -> Vec<Value>;
}

/// Gate operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    /// Deny violations block the request
    Enforce,
    /// Deny violations are reported but the request proceeds
    Warn,
    /// No rules run
    Disabled,
}

/// The policy gate: an ordered rule set plus an operating mode.
pub struct PolicyGate {
    rules: Vec<Arc<dyn PolicyRule>>,
    mode: PolicyMode,
}

impl PolicyGate {
    pub fn new(mode: PolicyMode) -> Self {
        Self {
            rules: Vec::new(),
            mode,
        }
    }

    pub fn with_rules(mode: PolicyMode, rules: Vec<Arc<dyn PolicyRule>>) -> Self {
        Self { rules, mode }
    }

    pub fn add_rule(&mut self, rule: Arc<dyn PolicyRule>) {
        self.rules.push(rule);
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    /// Evaluate every rule and concatenate the surviving violations.
    ///
    /// The decision is deny iff any violation carries a deny effect and the
    /// gate is enforcing.
    pub fn evaluate(&self, input: &PolicyInput<'_>) -> PolicyOutcome {
        if self.mode == PolicyMode::Disabled {
            return PolicyOutcome::allow();
        }

        let mut violations = Vec::new();
        for rule in &self.rules {
            for raw in rule.evaluate(input) {
                match serde_json::from_value::<Violation>(raw) {
                    Ok(violation) => violations.push(violation),
                    Err(err) => {
                        tracing::warn!(
                            rule = %rule.id(),
                            error = %err,
                            "dropping malformed policy violation"
                        );
                    }
                }
            }
        }

        let any_deny = violations.iter().any(|v| v.effect == PolicyEffect::Deny);
        let decision = if any_deny && self.mode == PolicyMode::Enforce {
            Decision::Deny
        } else {
            Decision::Allow
        };

        PolicyOutcome {
            decision,
            violations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Envelope, ExecutionPlan};
    use serde_json::json;

    struct FixedRule {
        id: &'static str,
        raw: Vec<Value>,
    }

    impl PolicyRule for FixedRule {
        fn id(&self) -> &str {
            self.id
        }

        fn evaluate(&self, _input: &PolicyInput<'_>) -> Vec<Value> {
            self.raw.clone()
        }
    }

    fn sample_envelope() -> Envelope {
        Envelope::validate(json!({
            "api_version": "1",
            "type": "t",
            "type_version": "1",
            "operation": "apply",
            "idempotency_key": "k",
            "payload": {}
        }))
        .expect("valid")
    }

    fn eval(gate: &PolicyGate) -> PolicyOutcome {
        let envelope = sample_envelope();
        let plan = ExecutionPlan::default();
        gate.evaluate(&PolicyInput {
            request_id: "req-1",
            envelope: &envelope,
            plan: &plan,
        })
    }

    #[test]
    fn test_deny_violation_denies_in_enforce_mode() {
        let gate = PolicyGate::with_rules(
            PolicyMode::Enforce,
            vec![Arc::new(FixedRule {
                id: "r1",
                raw: vec![json!({"id": "r1", "effect": "deny", "message": "nope"})],
            })],
        );
        let outcome = eval(&gate);
        assert_eq!(outcome.decision, Decision::Deny);
        assert_eq!(outcome.violations.len(), 1);
    }

    #[test]
    fn test_warn_mode_reports_but_allows() {
        let gate = PolicyGate::with_rules(
            PolicyMode::Warn,
            vec![Arc::new(FixedRule {
                id: "r1",
                raw: vec![json!({"id": "r1", "effect": "deny", "message": "nope"})],
            })],
        );
        let outcome = eval(&gate);
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.violations.len(), 1);
    }

    #[test]
    fn test_disabled_mode_runs_no_rules() {
        let gate = PolicyGate::with_rules(
            PolicyMode::Disabled,
            vec![Arc::new(FixedRule {
                id: "r1",
                raw: vec![json!({"id": "r1", "effect": "deny", "message": "nope"})],
            })],
        );
        let outcome = eval(&gate);
        assert_eq!(outcome.decision, Decision::Allow);
        assert!(outcome.violations.is_empty());
    }

    #[test]
    fn test_malformed_violations_are_dropped() {
        let gate = PolicyGate::with_rules(
            PolicyMode::Enforce,
            vec![Arc::new(FixedRule {
                id: "r1",
                raw: vec![
                    json!({"effect": "deny"}),
                    json!("not even an object"),
                    json!({"id": "ok", "effect": "warn", "message": "careful"}),
                ],
            })],
        );
        let outcome = eval(&gate);
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].id, "ok");
    }

    #[test]
    fn test_violations_concatenate_across_rules() {
        let gate = PolicyGate::with_rules(
            PolicyMode::Enforce,
            vec![
                Arc::new(FixedRule {
                    id: "a",
                    raw: vec![json!({"id": "a", "effect": "warn", "message": "m1"})],
                }),
                Arc::new(FixedRule {
                    id: "b",
                    raw: vec![json!({"id": "b", "effect": "warn", "message": "m2"})],
                }),
            ],
        );
        let outcome = eval(&gate);
        assert_eq!(outcome.decision, Decision::Allow);
        assert_eq!(outcome.violations.len(), 2);
    }
}
