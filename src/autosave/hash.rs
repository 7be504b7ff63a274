// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Content hashing for no-op save detection.
//!
//! The hash covers a canonical rendering of the JSON value: object keys are
//! sorted at every level, so two values that compare equal always hash the
//! same regardless of how their maps were built.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the canonical form of `value`.
#[must_use]
pub fn content_hash(value: &Value) -> String {
    let mut hasher = Sha256::new();
    write_canonical(&mut hasher, value);
    hex::encode(hasher.finalize())
}

fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                if let Some(v) = map.get(key) {
                    write_canonical(hasher, v);
                }
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                write_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}
