//! JSON merge patch (RFC 7386) computation

use serde_json::{Map, Value};

/// Merge patch turning `current` into `desired`, or None when they are equal.
///
/// Objects are diffed key by key, removed keys become `null`, lists and
/// scalars are replaced whole.
pub fn merge_diff(current: &Value, desired: &Value) -> Option<Value> {
    if current == desired {
        return None;
    }
    match (current, desired) {
        (Value::Object(current), Value::Object(desired)) => {
            let mut patch = Map::new();
            for (key, value) in desired {
                match current.get(key) {
                    Some(existing) => {
                        if let Some(child) = merge_diff(existing, value) {
                            patch.insert(key.clone(), child);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), value.clone());
                    }
                }
            }
            for key in current.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(desired.clone()),
    }
}
