//! Helpers shared by the JSON-RPC method handlers

use std::collections::HashMap;

use serde_json::{json, Map, Value};

/// Extract tool name from `tools/call` params
pub fn extract_tool_name(params: &Value) -> Option<&str> {
    params.get("name").and_then(|v| v.as_str())
}

/// Flatten tool arguments to the string map tool registries take.
///
/// Strings pass through verbatim; every other value is serialized as JSON.
pub fn stringify_arguments(arguments: &Map<String, Value>) -> HashMap<String, String> {
    arguments
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), s)
        })
        .collect()
}

/// Build a text content response
pub fn text_response(text: String) -> Value {
    json!({
        "content": [{
            "type": "text",
            "text": text
        }]
    })
}
