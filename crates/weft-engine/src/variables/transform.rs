use regex::Regex;
use serde_json::Value;
use tracing::debug;

use weft_core::workflow::Transform;

/// Apply transforms left to right. An absent value stays absent.
pub fn apply_transforms(value: Option<Value>, transforms: &[Transform]) -> Option<Value> {
    let mut value = value?;
    for t in transforms {
        value = apply_transform(value, t);
    }
    Some(value)
}

/// Apply one transform.
///
/// Transforms are total: a transform that does not fit the value's shape
/// (e.g. `uppercase` on a number, `parseJSON` on malformed text) passes the
/// value through unchanged.
pub fn apply_transform(value: Value, transform: &Transform) -> Value {
    match transform {
        Transform::Uppercase => map_str(value, |s| s.to_uppercase()),
        Transform::Lowercase => map_str(value, |s| s.to_lowercase()),
        Transform::Capitalize => map_str(value, capitalize),
        Transform::Trim => map_str(value, |s| s.trim().to_string()),
        Transform::Truncate { max_length, suffix } => map_str(value, |s| {
            if s.chars().count() <= *max_length {
                s.to_string()
            } else {
                let mut out: String = s.chars().take(*max_length).collect();
                out.push_str(suffix);
                out
            }
        }),
        Transform::Replace { pattern, value: with } => map_str(value, |s| match Regex::new(pattern) {
            Ok(re) => re.replace_all(s, with.as_str()).into_owned(),
            Err(e) => {
                debug!(pattern = %pattern, error = %e, "Replace pattern is not a regex, matching literally");
                s.replace(pattern.as_str(), with)
            }
        }),
        Transform::Split { delimiter } => match value {
            Value::String(s) => Value::Array(
                s.split(delimiter.as_str())
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ),
            other => other,
        },
        Transform::Join { separator } => match value {
            Value::Array(items) => Value::String(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(separator),
            ),
            other => other,
        },
        Transform::ParseJson => match value {
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        },
        Transform::Stringify => Value::String(value.to_string()),
    }
}

fn map_str(value: Value, f: impl FnOnce(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
