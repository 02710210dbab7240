// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use std::collections::BTreeMap;
use serde::Serialize;
use blake3::hash as blake3_hash;
use serde_json::Value;

/// Annotation holding the hash of the spec a sub-resource was last submitted with
pub const SPEC_HASH_ANNOTATION: &str = "capability.dev/spec-hash";

/// Compute a stable hash for any serializable object. Object keys are sorted
/// first so that field ordering never changes the result.
pub fn compute_object_hash<T>(object: &T) -> Result<String, serde_json::Error>
where
    T: Serialize,
{
    let value = serde_json::to_value(object)?;
    let hash = blake3_hash(serde_json::to_string(&sort_json(value))?.as_bytes());

    Ok(hash.to_hex().to_string())
}

/// Recursively sort JSON objects
pub fn sort_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map.into_iter().map(|(k, v)| (k, sort_json(v))).collect();
            Value::Object(sorted.into_iter().collect())
        },
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json).collect()),
        _ => value,
    }
}

/// Whether the annotations of a live object already record `hash`
pub fn has_spec_hash(annotations: Option<&BTreeMap<String, String>>, hash: &str) -> bool {
    annotations
        .and_then(|annotations| annotations.get(SPEC_HASH_ANNOTATION))
        .is_some_and(|current| current == hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_key_order() {
        let left = json!({"a": 1, "b": {"x": true, "y": [1, 2]}});
        let right = json!({"b": {"y": [1, 2], "x": true}, "a": 1});

        assert_eq!(compute_object_hash(&left).unwrap(), compute_object_hash(&right).unwrap());
    }

    #[test]
    fn hash_changes_with_content() {
        let left = json!({"size": "1Gi"});
        let right = json!({"size": "2Gi"});

        assert_ne!(compute_object_hash(&left).unwrap(), compute_object_hash(&right).unwrap());
    }

    #[test]
    fn spec_hash_lookup() {
        let annotations = BTreeMap::from([(SPEC_HASH_ANNOTATION.to_string(), "abc".to_string())]);

        assert!(has_spec_hash(Some(&annotations), "abc"));
        assert!(!has_spec_hash(Some(&annotations), "def"));
        assert!(!has_spec_hash(None, "abc"));
    }
}
