//! JEXL expression evaluator for sequence-flow guards, multi-instance
//! collections and variable mappings.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//! Variable scopes are always passed as context objects, never interpolated
//! into expression strings. Evaluation is synchronous and side-effect-free.

use orchestrion_types::variables::Variables;
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression '{expression}' failed: {message}")]
    EvalFailed { expression: String, message: String },

    #[error("expression '{expression}' must yield an array, got {result}")]
    NotArray { expression: String, result: Value },

    #[error("empty expression")]
    Empty,
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL evaluator with the string, boolean and length transforms
/// registered (`name|lower`, `items|length > 0`, ...).
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!Self::value_to_bool(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                // Arrays test membership, strings test substrings.
                let found = match args.first() {
                    Some(Value::Array(items)) => {
                        let needle = args.get(1).cloned().unwrap_or(Value::Null);
                        items.contains(&needle)
                    }
                    _ => str_arg(args, 0).contains(str_arg(args, 1)),
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate `expression` against `scope` and return the raw value.
    pub fn evaluate_value(&self, expression: &str, scope: &Variables) -> Result<Value, ExpressionError> {
        let body = strip_delimiters(expression);
        if body.is_empty() {
            return Err(ExpressionError::Empty);
        }
        let context = Value::Object(scope.clone());
        self.evaluator
            .eval_in_context(body, &context)
            .map_err(|e| ExpressionError::EvalFailed {
                expression: expression.to_string(),
                message: e.to_string(),
            })
    }

    /// Evaluate a guard, coercing the result with JavaScript-like truthiness.
    pub fn evaluate_bool(&self, expression: &str, scope: &Variables) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, scope)
            .map(|v| Self::value_to_bool(&v))
    }

    /// Evaluate a multi-instance collection expression.
    pub fn evaluate_array(&self, expression: &str, scope: &Variables) -> Result<Vec<Value>, ExpressionError> {
        match self.evaluate_value(expression, scope)? {
            Value::Array(items) => Ok(items),
            other => Err(ExpressionError::NotArray {
                expression: expression.to_string(),
                result: other,
            }),
        }
    }

    pub fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// `${amount > 100}` and `#{amount > 100}` are accepted as `amount > 100`.
fn strip_delimiters(expression: &str) -> &str {
    let trimmed = expression.trim();
    for open in ["${", "#{"] {
        if let Some(inner) = trimmed.strip_prefix(open).and_then(|s| s.strip_suffix('}')) {
            return inner.trim();
        }
    }
    trimmed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrion_types::variables::from_value;

    fn scope(value: Value) -> Variables {
        from_value(value)
    }

    #[test]
    fn numeric_comparison_against_scope() {
        let eval = ExpressionEvaluator::new();
        assert!(eval.evaluate_bool("amount > 100", &scope(json!({ "amount": 200 }))).unwrap());
        assert!(!eval.evaluate_bool("amount > 100", &scope(json!({ "amount": 50 }))).unwrap());
    }

    #[test]
    fn delimiters_are_stripped() {
        let eval = ExpressionEvaluator::new();
        let vars = scope(json!({ "region": "eu" }));
        assert!(eval.evaluate_bool("${region == 'eu'}", &vars).unwrap());
        assert!(eval.evaluate_bool("#{ region == 'eu' }", &vars).unwrap());
    }

    #[test]
    fn nested_access_and_transforms() {
        let eval = ExpressionEvaluator::new();
        let vars = scope(json!({
            "customer": { "name": "ACME Corp", "tags": ["gold", "eu"] }
        }));
        assert_eq!(
            eval.evaluate_value("customer.name|lower", &vars).unwrap(),
            json!("acme corp")
        );
        assert!(eval.evaluate_bool("customer.tags|length == 2", &vars).unwrap());
        assert!(eval.evaluate_bool("customer.tags|contains('gold')", &vars).unwrap());
        assert!(eval.evaluate_bool("customer.name|startsWith('ACME')", &vars).unwrap());
    }

    #[test]
    fn truthiness_of_non_boolean_results() {
        let eval = ExpressionEvaluator::new();
        let vars = scope(json!({ "items": [], "label": "", "count": 3 }));
        assert!(eval.evaluate_bool("items", &vars).unwrap());
        assert!(!eval.evaluate_bool("label", &vars).unwrap());
        assert!(eval.evaluate_bool("count", &vars).unwrap());
    }

    #[test]
    fn collection_must_be_array() {
        let eval = ExpressionEvaluator::new();
        let vars = scope(json!({ "items": [1, 2, 3], "single": 7 }));
        assert_eq!(eval.evaluate_array("items", &vars).unwrap().len(), 3);
        assert!(matches!(
            eval.evaluate_array("single", &vars),
            Err(ExpressionError::NotArray { .. })
        ));
    }

    #[test]
    fn malformed_expression_is_an_error() {
        let eval = ExpressionEvaluator::new();
        assert!(matches!(
            eval.evaluate_value("amount >", &Variables::new()),
            Err(ExpressionError::EvalFailed { .. })
        ));
        assert!(matches!(
            eval.evaluate_value("  ", &Variables::new()),
            Err(ExpressionError::Empty)
        ));
    }
}
