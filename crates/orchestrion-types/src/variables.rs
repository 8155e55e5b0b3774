//! Variable scopes.
//!
//! A scope is a JSON object keyed by variable name. Process scopes are
//! overlaid by the local scopes of enclosing executions when expressions
//! are evaluated.

use serde_json::{Map, Value};

/// A variable scope: name -> JSON value.
pub type Variables = Map<String, Value>;

/// Merge `overlay` into `base`, replacing existing keys.
pub fn merge(base: &mut Variables, overlay: &Variables) {
    for (name, value) in overlay {
        base.insert(name.clone(), value.clone());
    }
}

/// Build a scope from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty scope.
pub fn from_value(value: Value) -> Variables {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_existing_keys() {
        let mut base = from_value(json!({ "a": 1, "b": 2 }));
        merge(&mut base, &from_value(json!({ "b": 3, "c": 4 })));
        assert_eq!(Value::Object(base), json!({ "a": 1, "b": 3, "c": 4 }));
    }

    #[test]
    fn from_value_ignores_non_objects() {
        assert!(from_value(json!([1, 2])).is_empty());
    }
}
