//! JSON-RPC 2.0 framing for the MCP transport.
//!
//! One JSON value per line. Frames are decoded defensively: anything that
//! is not valid JSON is a parse error, valid JSON that is not a request
//! object is flagged so the server can answer `-32600`, and frames
//! without an `id` are notifications that must never be answered.

use serde::Serialize;
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision this server implements.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Has an id: the peer expects exactly one reply.
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    /// No id (or `id: null`): fire-and-forget, never answered.
    Notification { method: String, params: Value },
    /// A response to a server-initiated request; ignored.
    Response,
    /// Valid JSON that is not a JSON-RPC message.
    Invalid,
}

/// Decode one line. `Err(())` means the line was not valid JSON at all.
pub fn decode(line: &str) -> Result<Incoming, ()> {
    let value: Value = serde_json::from_str(line).map_err(|_| ())?;
    let Value::Object(ref obj) = value else {
        return Ok(Incoming::Invalid);
    };

    let method = obj.get("method").and_then(Value::as_str);
    // `id: null` is treated the same as an absent id: a notification.
    let id = obj.get("id").filter(|v| !v.is_null()).cloned();
    let params = obj.get("params").cloned().unwrap_or(Value::Null);

    match (method, id) {
        (Some(method), Some(id)) => Ok(Incoming::Request {
            id,
            method: method.to_string(),
            params,
        }),
        (Some(method), None) => Ok(Incoming::Notification {
            method: method.to_string(),
            params,
        }),
        (None, Some(_)) if obj.contains_key("result") || obj.contains_key("error") => {
            Ok(Incoming::Response)
        }
        _ => Ok(Incoming::Invalid),
    }
}

/// Build a success envelope.
pub fn response(id: &Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

/// Build an error envelope. Pass `Value::Null` as `id` for protocol-level
/// failures with no attributable request.
pub fn error_response(id: &Value, error: RpcError) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": error,
    })
}
