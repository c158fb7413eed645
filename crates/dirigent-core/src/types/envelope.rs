//! Intent envelope definitions
//!
//! The envelope is the stable inbound request document: it names an intent
//! type and version, carries an opaque payload, and is immutable once
//! admitted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The API version this engine accepts.
pub const API_VERSION: &str = "1";

/// Requested operation for an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Translate only; do not schedule execution
    Plan,
    /// Translate and queue for execution
    Apply,
    /// Run the translator's payload validation only
    Validate,
    /// Reverse a prior change; semantics are owned by the translator
    Rollback,
}

impl Operation {
    /// Label used in logs and audit data
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Plan => "plan",
            Operation::Apply => "apply",
            Operation::Validate => "validate",
            Operation::Rollback => "rollback",
        }
    }
}

/// Structural validation errors for inbound envelopes
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("unsupported api_version: {0}")]
    UnsupportedApiVersion(String),

    #[error("field '{0}' must be a non-empty string")]
    EmptyField(&'static str),
}

/// Intent envelope - the first-class input of the system
///
/// The wire fields `type` and `type_version` select the translator; the
/// payload shape is owned by that translator and opaque to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub api_version: String,
    /// Intent type name (wire field `type`)
    #[serde(rename = "type")]
    pub kind: String,
    /// Intent schema version (wire field `type_version`)
    #[serde(rename = "type_version")]
    pub kind_version: String,
    pub operation: Operation,
    /// Caller-supplied deduplication token
    pub idempotency_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    /// Optional addressing hint passed through to the translator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Value>,
    /// Opaque payload; the translator defines its shape
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Structurally validate a raw submission body.
    ///
    /// Checks presence and typing of required fields and the supported
    /// `api_version`. The payload is accepted in any shape, including null.
    pub fn validate(raw: Value) -> Result<Envelope, EnvelopeError> {
        if !raw.is_object() {
            return Err(EnvelopeError::NotAnObject);
        }
        if raw.get("payload").is_none() {
            return Err(EnvelopeError::Malformed("missing field `payload`".to_string()));
        }

        let envelope: Envelope =
            serde_json::from_value(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        if envelope.api_version != API_VERSION {
            return Err(EnvelopeError::UnsupportedApiVersion(
                envelope.api_version.clone(),
            ));
        }
        if envelope.kind.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("type"));
        }
        if envelope.kind_version.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("type_version"));
        }
        if envelope.idempotency_key.trim().is_empty() {
            return Err(EnvelopeError::EmptyField("idempotency_key"));
        }

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_envelope() -> Value {
        json!({
            "api_version": "1",
            "type": "network.firewall",
            "type_version": "2",
            "operation": "apply",
            "idempotency_key": "key-1",
            "payload": {"rules": []}
        })
    }

    #[test]
    fn test_validate_accepts_minimal_envelope() {
        let envelope = Envelope::validate(raw_envelope()).expect("valid");
        assert_eq!(envelope.kind, "network.firewall");
        assert_eq!(envelope.kind_version, "2");
        assert_eq!(envelope.operation, Operation::Apply);
    }

    #[test]
    fn test_validate_rejects_missing_payload() {
        let mut raw = raw_envelope();
        raw.as_object_mut().unwrap().remove("payload");
        assert!(matches!(
            Envelope::validate(raw),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_api_version() {
        let mut raw = raw_envelope();
        raw["api_version"] = json!("2");
        assert!(matches!(
            Envelope::validate(raw),
            Err(EnvelopeError::UnsupportedApiVersion(_))
        ));
    }

    #[test]
    fn test_validate_rejects_empty_idempotency_key() {
        let mut raw = raw_envelope();
        raw["idempotency_key"] = json!("  ");
        assert!(matches!(
            Envelope::validate(raw),
            Err(EnvelopeError::EmptyField("idempotency_key"))
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_operation() {
        let mut raw = raw_envelope();
        raw["operation"] = json!("destroy");
        assert!(matches!(
            Envelope::validate(raw),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_null_payload_is_present() {
        let mut raw = raw_envelope();
        raw["payload"] = Value::Null;
        assert!(Envelope::validate(raw).is_ok());
    }
}
