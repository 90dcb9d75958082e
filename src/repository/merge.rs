//! Deep-merge semantics for session state patches. Two objects merge
//! key-by-key; anything else — including an explicit `null`, which is how
//! callers clear a field — replaces the existing value outright. Arrays
//! never merge element-wise.

use serde_json::Value;

pub fn deep_merge(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merges_nested_objects() {
        let mut base = json!({ "temp": { "a": 1, "b": 2 } });
        let patch = json!({ "temp": { "b": 3, "c": 4 } });
        deep_merge(&mut base, &patch);
        assert_eq!(base, json!({ "temp": { "a": 1, "b": 3, "c": 4 } }));
    }

    #[test]
    fn null_patch_clears_field() {
        let mut base = json!({ "temp": { "a": 1 } });
        let patch = json!({ "temp": { "a": null } });
        deep_merge(&mut base, &patch);
        assert_eq!(base, json!({ "temp": { "a": null } }));
    }

    #[test]
    fn arrays_overwrite_rather_than_concatenate() {
        let mut base = json!({ "temp": { "list": [1, 2, 3] } });
        let patch = json!({ "temp": { "list": [9] } });
        deep_merge(&mut base, &patch);
        assert_eq!(base, json!({ "temp": { "list": [9] } }));
    }

    #[test]
    fn introduces_new_top_level_scopes() {
        let mut base = json!({ "temp": {} });
        let patch = json!({ "output": { "result": "done" } });
        deep_merge(&mut base, &patch);
        assert_eq!(base, json!({ "temp": {}, "output": { "result": "done" } }));
    }
}
