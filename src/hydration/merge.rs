use serde_json::Value;

/// Recursively merges `overlay` onto `base`. Objects merge key by key with
/// `overlay` winning; arrays and scalars replace wholesale.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base), Value::Object(overlay)) => {
            for (key, overlay_value) in overlay {
                let merged = match base.remove(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, overlay) => overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_merge_and_arrays_replace() {
        let merged = deep_merge(
            json!({"a": {"x": 1, "y": [1, 2, 3]}, "b": "keep"}),
            json!({"a": {"y": [9], "z": true}}),
        );
        assert_eq!(
            merged,
            json!({"a": {"x": 1, "y": [9], "z": true}, "b": "keep"})
        );
    }

    #[test]
    fn scalar_overlay_replaces_object() {
        assert_eq!(deep_merge(json!({"a": 1}), json!(null)), json!(null));
        assert_eq!(deep_merge(json!(1), json!({"a": 1})), json!({"a": 1}));
    }
}
