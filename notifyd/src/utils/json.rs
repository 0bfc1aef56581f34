//! JSON helpers for message payloads.

use serde_json::{Map, Value};
use tracing::warn;

/// Parse `raw` as a JSON object; anything else yields `None`.
pub fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse `raw` as a JSON object, logging when it is not one.
pub fn parse_object_or_warn(raw: &str, field: &'static str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            warn!(field, kind = json_kind(&other), "Expected JSON object");
            Map::new()
        }
        Err(error) => {
            warn!(field, raw_len = raw.len(), %error, "Failed to parse JSON");
            Map::new()
        }
    }
}

/// Flatten a JSON value into plain text for vendors that only take strings.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        assert!(parse_object(r#"{"a":1}"#).is_some());
        assert!(parse_object("[1]").is_none());
        assert!(parse_object("plain text").is_none());
        assert!(parse_object_or_warn("3", "message").is_empty());
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&Value::String("x".into())), "x");
        assert_eq!(value_to_text(&serde_json::json!(3)), "3");
        assert_eq!(value_to_text(&Value::Null), "");
    }
}
