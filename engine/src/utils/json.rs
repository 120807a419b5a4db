//! JSON utility functions

use serde_json::Value as JsonValue;

/// Converts a JsonValue to Option<String>, returning None for null values.
///
/// This prevents serializing `JsonValue::Null` as the string `"null"`,
/// which would be stored as TEXT instead of a database NULL.
pub fn json_to_opt_string(value: &JsonValue) -> Option<String> {
    if value.is_null() {
        None
    } else {
        serde_json::to_string(value).ok()
    }
}

/// Parse a JSON-encoded string array column, tolerating NULL and garbage.
pub fn parse_string_vec(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}

/// Parse a JSON-encoded i64 array column, tolerating NULL and garbage.
pub fn parse_id_vec(raw: Option<&str>) -> Vec<i64> {
    raw.and_then(|s| serde_json::from_str(s).ok())
        .unwrap_or_default()
}
