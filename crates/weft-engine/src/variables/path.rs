use serde_json::Value;

/// Traverse `value` along a dot-separated path.
///
/// Numeric segments index arrays. An empty path yields the value itself.
/// Any missing key, out-of-range index, or `null` met before the last
/// segment yields `None`; a `null` stored at the final key is returned as
/// `Some(Null)`.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return (!value.is_null()).then_some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}
