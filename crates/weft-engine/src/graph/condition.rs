use serde_json::{Map, Value};

use weft_core::workflow::{ConditionOperator, ConditionRule};

/// Evaluate `left op right` against a condition node's resolved inputs.
///
/// `left` names an input; a missing input behaves like `null`, so only
/// `ne` and the negative comparisons can hold for it. Ordering operators
/// compare numbers numerically and strings lexicographically; mixed types
/// never compare.
pub fn evaluate_rule(rule: &ConditionRule, inputs: &Map<String, Value>) -> bool {
    let left = inputs.get(&rule.left).unwrap_or(&Value::Null);
    let right = &rule.right;

    match rule.operator {
        ConditionOperator::Eq => values_equal(left, right),
        ConditionOperator::Ne => !values_equal(left, right),
        ConditionOperator::Gt => compare(left, right).is_some_and(|o| o.is_gt()),
        ConditionOperator::Gte => compare(left, right).is_some_and(|o| o.is_ge()),
        ConditionOperator::Lt => compare(left, right).is_some_and(|o| o.is_lt()),
        ConditionOperator::Lte => compare(left, right).is_some_and(|o| o.is_le()),
        ConditionOperator::Contains => contains(left, right),
        ConditionOperator::Exists => !left.is_null(),
        ConditionOperator::Truthy => is_truthy(left),
    }
}

/// Loose truthiness: `null`, `false`, `0`, and `""` are false; everything
/// else, including empty arrays and objects, is true.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Which branch a condition node's output selects.
///
/// Handlers return `{"result": bool}`; a bare value is judged by
/// truthiness.
pub fn branch_taken(output: &Value) -> bool {
    match output.get("result") {
        Some(result) => is_truthy(result),
        None => is_truthy(output),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}
