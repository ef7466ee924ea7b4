//! Roster payloads carried by `user-list` presence broadcasts.

use serde_json::Value;

/// Builds the `user-list` payload: a JSON array of display names.
#[must_use]
pub fn roster_payload(names: &[String]) -> Value {
    Value::Array(names.iter().cloned().map(Value::String).collect())
}

/// Parses a `user-list` payload back into display names.
///
/// Returns `None` unless the value is an array made only of strings.
#[must_use]
pub fn parse_roster(payload: &Value) -> Option<Vec<String>> {
    payload
        .as_array()?
        .iter()
        .map(|entry| entry.as_str().map(str::to_string))
        .collect()
}
