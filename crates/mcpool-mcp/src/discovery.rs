//! Tool-listing recognition
//!
//! Conformant servers answer `tools/list` with `{result:{tools:[...]}}`.
//! Plenty of real providers do something else: push `{tools:[...]}` on
//! startup, use `methods`/`functions`, or print a bare array. All of those
//! shapes are accepted here and normalized to [`Tool`].

use std::collections::HashSet;

use mcpool_core::Tool;
use serde_json::Value;

/// Return the normalized tool list if `value` is any recognized listing shape.
pub fn extract_tool_listing(value: &Value) -> Option<Vec<Tool>> {
    match value {
        Value::Object(obj) => {
            if let Some(Value::Array(items)) = obj.get("tools") {
                return Some(normalize(items));
            }
            match obj.get("result") {
                Some(Value::Object(result)) => {
                    if let Some(Value::Array(items)) = result.get("tools") {
                        return Some(normalize(items));
                    }
                }
                Some(Value::Array(items)) if is_tool_array(items) => {
                    return Some(normalize(items));
                }
                _ => {}
            }
            for key in ["methods", "functions"] {
                if let Some(Value::Array(items)) = obj.get(key) {
                    return Some(normalize(items));
                }
            }
            None
        }
        Value::Array(items) if is_tool_array(items) => Some(normalize(items)),
        _ => None,
    }
}

fn is_tool_array(items: &[Value]) -> bool {
    !items.is_empty() && items.iter().all(Tool::looks_like_tool)
}

/// Normalize entries, dropping unusable ones and later duplicates by name.
fn normalize(items: &[Value]) -> Vec<Tool> {
    let mut seen = HashSet::new();
    items
        .iter()
        .filter_map(Tool::from_value)
        .filter(|tool| seen.insert(tool.name.clone()))
        .collect()
}
