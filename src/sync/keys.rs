//! Stable cache keys for `(resource, args)` pairs.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Hex characters of the argument digest kept in a cache key.
const DIGEST_HEX_LEN: usize = 32;

/// Canonical JSON: sorted object keys, no whitespace.
/// Equal values always produce equal strings regardless of key order.
pub fn canonical_json(value: &Value) -> String {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&obj[k])))
                .collect();
            format!("{{{}}}", pairs.join(","))
        }
    }
}

/// A logical query: resource name plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryKey {
    pub resource: String,
    pub args: Value,
}

impl QueryKey {
    pub fn new(resource: impl Into<String>, args: Value) -> Self {
        Self {
            resource: resource.into(),
            args,
        }
    }

    /// Key of a single synchronized entity: `resource` with `{"id": id}`.
    pub fn entity(resource: &str, id: &str) -> Self {
        Self::new(resource, json!({ "id": id }))
    }

    /// Key of an argument-less view such as an aggregate.
    pub fn view(resource: &str) -> Self {
        Self::new(resource, json!({}))
    }

    /// `"{resource}:{hex(sha256(canonical_json(args)))[..32]}"`
    pub fn cache_key(&self) -> String {
        let digest = Sha256::digest(canonical_json(&self.args).as_bytes());
        let hex = hex::encode(digest);
        format!("{}:{}", self.resource, &hex[..DIGEST_HEX_LEN])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_keys() {
        let v = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonical_json(&v), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn canonical_json_nested() {
        let v = json!({"b": {"d": [1, {"y": null, "x": true}], "c": "s"}, "a": []});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":[],"b":{"c":"s","d":[1,{"x":true,"y":null}]}}"#
        );
    }

    #[test]
    fn canonical_json_escapes_strings() {
        let v = json!({"quote\"key": "line\nbreak"});
        assert_eq!(canonical_json(&v), r#"{"quote\"key":"line\nbreak"}"#);
    }

    #[test]
    fn cache_key_ignores_argument_order() {
        let a = QueryKey::new("contacts.list", json!({"limit": 10, "tag": "x"}));
        let b = QueryKey::new("contacts.list", json!({"tag": "x", "limit": 10}));
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn cache_key_shape() {
        let key = QueryKey::entity("contacts", "c1").cache_key();
        let (resource, digest) = key.split_once(':').unwrap();
        assert_eq!(resource, "contacts");
        assert_eq!(digest.len(), 32);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cache_key_matches_sha256_of_canonical_args() {
        let key = QueryKey::view("tags.all").cache_key();
        // sha256("{}")
        assert_eq!(key, "tags.all:44136fa355b3678a1146ad16f7e8649e");
    }

    #[test]
    fn different_args_give_different_keys() {
        assert_ne!(
            QueryKey::entity("contacts", "c1").cache_key(),
            QueryKey::entity("contacts", "c2").cache_key()
        );
        assert_ne!(
            QueryKey::entity("contacts", "c1").cache_key(),
            QueryKey::entity("tags", "c1").cache_key()
        );
    }
}
