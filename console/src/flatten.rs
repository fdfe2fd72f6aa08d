use serde_json::Value;
use std::collections::BTreeMap;

/// Dotted key to leaf value.
pub type FlatMap = BTreeMap<String, Value>;

/// Flattens nested objects into dotted keys. Arrays are kept as JSON strings and
/// `null` becomes an empty string.
pub fn flatten(value: &Value) -> FlatMap {
    let mut out = FlatMap::new();
    flatten_into(&mut out, String::new(), value);
    out
}

fn flatten_into(out: &mut FlatMap, prefix: String, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(out, path, child);
            }
        }
        Value::Array(_) => {
            let encoded = match serde_json::to_string(value) {
                Ok(s) => Value::String(s),
                Err(e) => {
                    tracing::warn!(key = %prefix, error = %e, "could not encode array value");
                    Value::Null
                }
            };
            out.insert(prefix, encoded);
        }
        Value::Null => {
            out.insert(prefix, Value::String(String::new()));
        }
        scalar => {
            out.insert(prefix, scalar.clone());
        }
    }
}
