use std::collections::HashMap;

use resourcebase_core::resource::ResourceMethod;
use serde_json::Value;

/// Recursively sorts object keys so two semantically-equal JSON values always
/// serialize identically, regardless of insertion order.
pub fn stable_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for k in keys {
                sorted.insert(k.clone(), stable_value(map.get(k).expect("key came from map")));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(stable_value).collect()),
        other => other.clone(),
    }
}

/// A 16-hex-char prefix of a fast non-cryptographic digest. Collisions are
/// acceptable: correctness comes from write invalidation, not uniqueness.
pub fn fast_digest(bytes: &[u8]) -> String {
    let hash = blake3::hash(bytes);
    hash.to_hex()[..16].to_string()
}

/// Deterministic cache key:
/// `resource=<name>/action=<method>[/partition:<pname>/<field>:<value>...][/<hash>.json.gz]`
pub fn derive_cache_key(
    resource_name: &str,
    method: ResourceMethod,
    id: Option<&str>,
    partition: Option<&str>,
    partition_values: &HashMap<String, Value>,
    params: &Value,
) -> String {
    let mut segments = vec![format!("resource={resource_name}"), format!("action={}", method.name())];

    if let Some(pname) = partition {
        segments.push(format!("partition:{pname}"));
        let mut fields: Vec<(&String, &Value)> = partition_values.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (field, value) in fields {
            segments.push(format!("{field}:{}", stable_scalar(value)));
        }
    }

    let hash_input = serde_json::json!({ "id": id, "params": stable_value(params) });
    let hash = fast_digest(&serde_json::to_vec(&hash_input).expect("hash_input always serializes"));
    segments.push(format!("{hash}.json.gz"));
    segments.join("/")
}

/// The broad prefix under which every cache entry for `resource_name` lives.
pub fn resource_prefix(resource_name: &str) -> String {
    format!("resource={resource_name}/")
}

/// The prefix for a single partition's cached entries, ignoring the trailing hash.
pub fn partition_prefix(resource_name: &str, partition_name: &str, fields: &[(String, Value)]) -> String {
    let mut segments = vec![format!("resource={resource_name}"), format!("partition:{partition_name}")];
    let mut sorted = fields.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (field, value) in &sorted {
        segments.push(format!("{field}:{}", stable_scalar(value)));
    }
    segments.join("/")
}

fn stable_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_across_object_key_order() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"y": 2, "x": 1});
        let key_a = derive_cache_key("widgets", ResourceMethod::Get, Some("w1"), None, &HashMap::new(), &a);
        let key_b = derive_cache_key("widgets", ResourceMethod::Get, Some("w1"), None, &HashMap::new(), &b);
        assert_eq!(key_a, key_b);
    }

    #[test]
    fn key_differs_by_id() {
        let params = Value::Null;
        let key_a = derive_cache_key("widgets", ResourceMethod::Get, Some("w1"), None, &HashMap::new(), &params);
        let key_b = derive_cache_key("widgets", ResourceMethod::Get, Some("w2"), None, &HashMap::new(), &params);
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn key_includes_resource_action_and_gz_suffix() {
        let key = derive_cache_key("widgets", ResourceMethod::List, None, None, &HashMap::new(), &Value::Null);
        assert!(key.starts_with("resource=widgets/action=list/"));
        assert!(key.ends_with(".json.gz"));
    }
}
