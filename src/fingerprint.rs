//! AgentKern-Arbiter: Operation Fingerprinting
//!
//! Derives a deterministic, opaque key for an operation from its name,
//! parameters, and context so the ledger can recognize repeat attempts
//! of "the same" call regardless of map-insertion order.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Generate a stable 16-hex-character fingerprint for an operation.
///
/// `parameters` and `context` are normalized (object keys sorted
/// recursively, `None`/missing values collapse to JSON `null`) before
/// hashing, so callers don't need to pre-sort their own maps.
pub fn generate_key(operation: &str, parameters: &Value, context: &Value) -> String {
    let canonical = serde_json::json!({
        "operation": operation,
        "parameters": canonicalize(parameters),
        "context": canonicalize(context),
    });

    let encoded = serde_json::to_vec(&canonical).expect("canonical value always serializes");
    let digest = Sha256::digest(&encoded);
    hex::encode(digest)[..16].to_string()
}

/// Recursively rewrite a JSON value so that objects are sorted by key.
/// `serde_json::Value::Object` is backed by a `BTreeMap` or an
/// insertion-order `Map` depending on feature flags; normalizing
/// through an explicit `BTreeMap` guarantees deterministic ordering
/// either way.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Null => Value::Null,
        other => other.clone(),
    }
}
