//! JSON-RPC 2.0 message types for the stdio MCP exchange.

use serde::Serialize;
use serde_json::{json, Value};

/// Protocol version announced in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Identity sent to providers during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "mcpool".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }

    pub fn initialize(id: u64, client: &ClientInfo) -> Self {
        Self::new(
            id,
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "clientInfo": client,
            })),
        )
    }

    pub fn tools_list(id: u64) -> Self {
        Self::new(id, "tools/list", Some(json!({})))
    }

    /// `tools/call`; non-object arguments are replaced by `{}`.
    pub fn tools_call(id: u64, name: &str, arguments: Value) -> Self {
        let arguments = if arguments.is_object() {
            arguments
        } else {
            json!({})
        };
        Self::new(
            id,
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
    }

    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// JSON-RPC 2.0 notification (no id, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn initialized() -> Self {
        Self {
            jsonrpc: "2.0",
            method: "notifications/initialized".to_string(),
            params: None,
        }
    }

    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// JSON-RPC error object. Peers are loose here: `code` may be missing and
/// the whole error may be a bare string.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcError {
    pub code: Option<i64>,
    pub message: String,
    pub data: Option<Value>,
}

impl JsonRpcError {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self {
                code: None,
                message: message.clone(),
                data: None,
            },
            Value::Object(obj) => Self {
                code: obj.get("code").and_then(Value::as_i64),
                message: obj
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| value.to_string()),
                data: obj.get("data").cloned(),
            },
            other => Self {
                code: None,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

/// A decoded reply frame.
///
/// Parsing never fails; fields that are absent or of the wrong type are `None`.
/// A literal `"result": null` is kept as `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
    pub is_jsonrpc: bool,
}

impl ResponseFrame {
    pub fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        // Requests and notifications from the peer are not replies.
        if obj.contains_key("method") && !obj.contains_key("result") && !obj.contains_key("error") {
            return None;
        }
        let id = obj.get("id").and_then(|id| match id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
        Some(Self {
            id,
            result: obj.get("result").cloned(),
            error: obj
                .get("error")
                .filter(|e| !e.is_null())
                .map(JsonRpcError::from_value),
            is_jsonrpc: obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0"),
        })
    }

    pub fn answers(&self, id: u64) -> bool {
        self.id == Some(id)
    }
}
