//! Canonical fingerprinting for idempotency comparison
//!
//! Two envelopes are "the same request" when the canonical serialization of
//! their identity fields matches. Canonical form sorts object keys
//! recursively and strips null-valued keys, so callers may reorder fields or
//! omit optional ones without changing the fingerprint.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::types::Envelope;

/// Hex-encoded SHA-256 over a canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical serialization of a JSON value: object keys sorted, null-valued
/// keys removed, arrays kept in order.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            let mut first = true;
            for key in keys {
                let entry = &map[key];
                if entry.is_null() {
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                // String serialization of a key cannot fail
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(entry, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Fingerprint an arbitrary JSON value.
pub fn value_fingerprint(value: &Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{:02x}", byte));
    }
    Fingerprint(hex)
}

/// Fingerprint the identity fields of an envelope.
///
/// Only `{api_version, type, type_version, operation, target, payload}`
/// participate: the idempotency key itself, correlation ids, tags and
/// timestamps do not change what the request *is*.
pub fn envelope_fingerprint(envelope: &Envelope) -> Fingerprint {
    let identity = json!({
        "api_version": &envelope.api_version,
        "type": &envelope.kind,
        "type_version": &envelope.kind_version,
        "operation": envelope.operation.as_str(),
        "target": envelope.target.clone().unwrap_or(Value::Null),
        "payload": &envelope.payload,
    });
    value_fingerprint(&identity)
}
