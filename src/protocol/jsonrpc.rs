//! JSON-RPC 2.0 envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TetherError;

pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier tether assigns to outgoing requests.
pub type RequestId = u64;

/// Standard JSON-RPC error codes used by tether.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A JSON-RPC request (has an `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Value::from(id),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC notification (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response; exactly one of `result` / `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Structured error object carried in a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("code {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
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

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Reply to one of our requests.
    Response {
        id: Value,
        outcome: Result<Value, RpcError>,
    },
    /// Server-initiated request that expects a reply.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl InboundMessage {
    /// Classify a raw frame. Anything that is not a well-formed JSON-RPC 2.0
    /// message is a `Protocol` error.
    pub fn parse(raw: Value) -> Result<Self, TetherError> {
        let Value::Object(mut object) = raw else {
            return Err(TetherError::Protocol(format!(
                "frame is not a JSON object: {raw}"
            )));
        };

        match object.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => {
                return Err(TetherError::Protocol(format!(
                    "unsupported jsonrpc version {other}"
                )))
            }
            None => {
                return Err(TetherError::Protocol("frame is missing 'jsonrpc'".into()));
            }
        }

        let id = object.remove("id").filter(|id| !id.is_null());

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(TetherError::Protocol("'method' must be a string".into()));
            };
            let params = object.remove("params");
            return Ok(match id {
                Some(id) => Self::Request { id, method, params },
                None => Self::Notification { method, params },
            });
        }

        // Parse errors are reported with a null id; keep it so the caller can
        // report the frame as unmatched.
        let id = id.unwrap_or(Value::Null);
        if let Some(error) = object.remove("error") {
            let error: RpcError = serde_json::from_value(error).map_err(|e| {
                TetherError::Protocol(format!("malformed error object: {e}"))
            })?;
            return Ok(Self::Response {
                id,
                outcome: Err(error),
            });
        }
        if let Some(result) = object.remove("result") {
            return Ok(Self::Response {
                id,
                outcome: Ok(result),
            });
        }

        Err(TetherError::Protocol(
            "frame has neither 'method', 'result' nor 'error'".into(),
        ))
    }
}

/// Interpret a response id as one of ours. Numeric strings are accepted since
/// some servers echo ids back as strings.
pub fn numeric_id(id: &Value) -> Option<RequestId> {
    match id {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_without_params_when_absent() {
        let request = JsonRpcRequest::new(7, "tools/list", None);
        let value = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));
    }

    #[test]
    fn parse_classifies_success_and_error_responses() {
        let ok = InboundMessage::parse(json!({"jsonrpc": "2.0", "id": 3, "result": {"x": 1}}))
            .expect("success response should parse");
        assert_eq!(
            ok,
            InboundMessage::Response {
                id: json!(3),
                outcome: Ok(json!({"x": 1})),
            }
        );

        let err = InboundMessage::parse(json!({
            "jsonrpc": "2.0",
            "id": 4,
            "error": {"code": -32602, "message": "bad params"}
        }))
        .expect("error response should parse");
        assert!(matches!(
            err,
            InboundMessage::Response { outcome: Err(RpcError { code: -32602, .. }), .. }
        ));
    }

    #[test]
    fn parse_distinguishes_requests_from_notifications() {
        let request = InboundMessage::parse(json!({"jsonrpc": "2.0", "id": "s-1", "method": "ping"}))
            .expect("server request should parse");
        assert!(matches!(request, InboundMessage::Request { ref method, .. } if method == "ping"));

        let note = InboundMessage::parse(json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed"
        }))
        .expect("notification should parse");
        assert!(matches!(note, InboundMessage::Notification { .. }));
    }

    #[test]
    fn parse_rejects_malformed_frames() {
        for frame in [
            json!([1, 2, 3]),
            json!({"id": 1, "result": {}}),
            json!({"jsonrpc": "1.0", "id": 1, "result": {}}),
            json!({"jsonrpc": "2.0", "id": 1}),
            json!({"jsonrpc": "2.0", "id": 1, "error": "boom"}),
        ] {
            let err = InboundMessage::parse(frame.clone()).expect_err("frame should be rejected");
            assert!(matches!(err, TetherError::Protocol(_)), "unexpected error for {frame}");
        }
    }

    #[test]
    fn numeric_id_accepts_numbers_and_numeric_strings() {
        assert_eq!(numeric_id(&json!(12)), Some(12));
        assert_eq!(numeric_id(&json!("12")), Some(12));
        assert_eq!(numeric_id(&json!("abc")), None);
        assert_eq!(numeric_id(&Value::Null), None);
    }
}
