//! Normalized tool descriptor

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A tool advertised by a provider.
///
/// `parameters` is always an object-typed JSON Schema fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: Option<String>,
        parameters: Option<Value>,
    ) -> Self {
        let name = name.into();
        let description = description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("{} tool", name));
        Self {
            name,
            description,
            parameters: object_schema(parameters),
        }
    }

    /// Normalize a single tool entry as peers send it.
    ///
    /// Accepts a bare string (name only) or an object with `name` and one of
    /// `inputSchema`, `input_schema` or `parameters`. Returns `None` for
    /// anything without a usable name.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(name) if !name.trim().is_empty() => Some(Tool::new(name.clone(), None, None)),
            Value::Object(obj) => {
                let name = obj.get("name").and_then(Value::as_str)?.trim();
                if name.is_empty() {
                    return None;
                }
                let description = obj
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let schema = ["inputSchema", "input_schema", "parameters"]
                    .iter()
                    .find_map(|key| obj.get(*key))
                    .cloned();
                Some(Tool::new(name, description, schema))
            }
            _ => None,
        }
    }

    /// Whether an entry has the shape of a tool object (a named object with a schema).
    pub fn looks_like_tool(value: &Value) -> bool {
        value.get("name").map_or(false, Value::is_string)
            && (value.get("inputSchema").is_some()
                || value.get("input_schema").is_some()
                || value.get("parameters").is_some()
                || value.get("description").is_some())
    }
}

/// Upgrade any schema-ish value to an object-typed schema.
///
/// A schema typed as something other than an object becomes the single
/// `input` property of an object schema.
fn object_schema(schema: Option<Value>) -> Value {
    match schema {
        Some(Value::Object(mut obj)) => match obj.get("type") {
            None => {
                obj.insert("type".to_string(), Value::String("object".to_string()));
                obj.entry("properties")
                    .or_insert_with(|| Value::Object(Map::new()));
                Value::Object(obj)
            }
            Some(Value::String(t)) if t == "object" => {
                obj.entry("properties")
                    .or_insert_with(|| Value::Object(Map::new()));
                Value::Object(obj)
            }
            Some(_) => json!({ "type": "object", "properties": { "input": obj } }),
        },
        _ => json!({ "type": "object", "properties": {} }),
    }
}
