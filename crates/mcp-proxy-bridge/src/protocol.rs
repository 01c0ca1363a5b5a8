//! MCP protocol envelopes.
//!
//! Implements the JSON-RPC 2.0 message vocabulary used by MCP.
//! See: <https://spec.modelcontextprotocol.io/>
//!
//! The bridge is transport-transparent: envelopes are classified purely by
//! structure and unknown fields are carried through untouched, so messages
//! can be relayed without the proxy understanding their payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{BridgeError, BridgeResult};

/// MCP protocol version advertised by the proxy.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

/// Method name of the initialize request.
pub const METHOD_INITIALIZE: &str = "initialize";

/// Method name of the initialized notification.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";

/// Method name of the ping request, valid at any time, initialization
/// included.
pub const METHOD_PING: &str = "ping";

/// JSON-RPC message id: a finite integer or a string.
///
/// Uniqueness is per direction, per session; the bridge never rewrites ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{n}"),
            MessageId::String(s) => write!(f, "{s}"),
        }
    }
}

/// JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: MessageId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Fields outside the JSON-RPC envelope, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JsonRpcRequest {
    pub fn new(id: MessageId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }
}

/// JSON-RPC notification (no id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
            extra: Map::new(),
        }
    }
}

/// JSON-RPC response carrying either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: MessageId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JsonRpcResponse {
    pub fn result(id: MessageId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
            extra: Map::new(),
        }
    }

    pub fn error(id: MessageId, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
                extra: Map::new(),
            }),
            extra: Map::new(),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An MCP envelope: one of the four structural shapes the wire can carry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum McpMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    /// Ordered batch of envelopes.
    Batch(Vec<McpMessage>),
}

impl McpMessage {
    /// Classify a JSON value structurally.
    ///
    /// `method` with a non-null `id` is a request; `method` without an `id`
    /// is a notification; an `id` with `result` or `error` is a response;
    /// an array is a batch. Anything else is malformed.
    pub fn from_value(value: Value) -> BridgeResult<Self> {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(BridgeError::MalformedMessage("empty batch".to_string()));
                }
                let messages = items
                    .into_iter()
                    .map(McpMessage::from_value)
                    .collect::<BridgeResult<Vec<_>>>()?;
                Ok(McpMessage::Batch(messages))
            }
            Value::Object(_) => {
                let (has_method, has_id, has_outcome) = {
                    let map = value.as_object().expect("object checked above");
                    (
                        map.contains_key("method"),
                        map.get("id").map(|v| !v.is_null()).unwrap_or(false),
                        map.contains_key("result") || map.contains_key("error"),
                    )
                };

                if has_method && has_id {
                    serde_json::from_value(value)
                        .map(McpMessage::Request)
                        .map_err(|e| BridgeError::MalformedMessage(e.to_string()))
                } else if has_method {
                    serde_json::from_value(value)
                        .map(McpMessage::Notification)
                        .map_err(|e| BridgeError::MalformedMessage(e.to_string()))
                } else if has_id && has_outcome {
                    serde_json::from_value(value)
                        .map(McpMessage::Response)
                        .map_err(|e| BridgeError::MalformedMessage(e.to_string()))
                } else {
                    Err(BridgeError::MalformedMessage(
                        "envelope matches no JSON-RPC shape".to_string(),
                    ))
                }
            }
            other => Err(BridgeError::MalformedMessage(format!(
                "expected object or array, got {other}"
            ))),
        }
    }

    /// Parse one wire frame.
    pub fn from_json(raw: &str) -> BridgeResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| BridgeError::MalformedMessage(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Serialize to a single-line wire frame.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "null".to_string())
    }

    /// Method name, if this envelope carries one.
    pub fn method(&self) -> Option<&str> {
        match self {
            McpMessage::Request(r) => Some(&r.method),
            McpMessage::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// Message id, if this envelope carries one.
    pub fn id(&self) -> Option<&MessageId> {
        match self {
            McpMessage::Request(r) => Some(&r.id),
            McpMessage::Response(r) => Some(&r.id),
            _ => None,
        }
    }
}

/// Parameters of the initialize request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    /// Capability set, kept as raw JSON so unknown capabilities survive.
    #[serde(default = "empty_capabilities")]
    pub capabilities: Value,
    pub client_info: ClientInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of the initialize request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default = "empty_capabilities")]
    pub capabilities: Value,
    pub server_info: ServerInfo,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Identity of an MCP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
            extra: Map::new(),
        }
    }
}

/// Identity of an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn empty_capabilities() -> Value {
    Value::Object(Map::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_request() {
        let msg =
            McpMessage::from_json(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        match msg {
            McpMessage::Request(r) => {
                assert_eq!(r.id, MessageId::Number(1));
                assert_eq!(r.method, "ping");
                assert!(r.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_string_id_request() {
        let msg =
            McpMessage::from_json(r#"{"jsonrpc":"2.0","id":"req-7","method":"tools/list"}"#)
                .unwrap();
        assert_eq!(msg.id(), Some(&MessageId::String("req-7".to_string())));
    }

    #[test]
    fn test_classify_notification() {
        let msg = McpMessage::from_json(
            r#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"progress":1}}"#,
        )
        .unwrap();
        assert!(matches!(msg, McpMessage::Notification(_)));
        assert_eq!(msg.method(), Some("notifications/progress"));
    }

    #[test]
    fn test_null_id_is_notification() {
        let msg = McpMessage::from_json(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#)
            .unwrap();
        assert!(matches!(msg, McpMessage::Notification(_)));
    }

    #[test]
    fn test_classify_response() {
        let msg =
            McpMessage::from_json(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(msg, McpMessage::Response(_)));
    }

    #[test]
    fn test_classify_error_response() {
        let msg = McpMessage::from_json(
            r#"{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Method not found"}}"#,
        )
        .unwrap();
        match msg {
            McpMessage::Response(r) => {
                let error = r.error.unwrap();
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "Method not found");
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_batch() {
        let msg = McpMessage::from_json(
            r#"[{"jsonrpc":"2.0","id":1,"method":"a"},{"jsonrpc":"2.0","method":"b"}]"#,
        )
        .unwrap();
        match msg {
            McpMessage::Batch(items) => assert_eq!(items.len(), 2),
            other => panic!("expected batch, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_batch_is_malformed() {
        let err = McpMessage::from_json("[]").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage(_)));
    }

    #[test]
    fn test_shapeless_object_is_malformed() {
        let err = McpMessage::from_json(r#"{"id":1}"#).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage(_)));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        let err = McpMessage::from_json("not json").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage(_)));
    }

    #[test]
    fn test_scalar_is_malformed() {
        let err = McpMessage::from_json("42").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage(_)));
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let raw = json!({
            "jsonrpc": "2.0",
            "id": 9,
            "method": "tools/call",
            "params": {"name": "echo"},
            "_meta": {"traceId": "abc"}
        });
        let msg = McpMessage::from_value(raw.clone()).unwrap();
        assert_eq!(msg.to_value(), raw);
    }

    #[test]
    fn test_round_trip_preserves_payload() {
        let raw = r#"{"jsonrpc":"2.0","id":"x","result":{"tools":[{"name":"read"}]}}"#;
        let msg = McpMessage::from_json(raw).unwrap();
        let round: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(round, serde_json::from_str::<Value>(raw).unwrap());
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId::Number(3).to_string(), "3");
        assert_eq!(MessageId::String("a".to_string()).to_string(), "a");
    }

    #[test]
    fn test_initialize_params_defaults() {
        let params: InitializeParams = serde_json::from_value(json!({
            "protocolVersion": "2025-03-26",
            "clientInfo": {"name": "client", "version": "1.0"}
        }))
        .unwrap();
        assert_eq!(params.protocol_version, PROTOCOL_VERSION);
        assert_eq!(params.capabilities, json!({}));
        assert_eq!(params.client_info.name, "client");
    }

    #[test]
    fn test_initialize_result_unknown_capabilities_survive() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}, "experimental": {"x": true}},
            "serverInfo": {"name": "upstream", "version": "2.1.0"}
        }))
        .unwrap();
        assert_eq!(result.capabilities["experimental"]["x"], json!(true));
        let back = serde_json::to_value(&result).unwrap();
        assert_eq!(back["capabilities"]["experimental"]["x"], json!(true));
    }

    #[test]
    fn test_response_constructors() {
        let ok = JsonRpcResponse::result(MessageId::Number(1), json!({}));
        assert!(ok.error.is_none());

        let err = JsonRpcResponse::error(MessageId::Number(2), -32600, "Invalid Request");
        assert_eq!(err.error.unwrap().code, -32600);
        assert!(err.result.is_none());
    }
}
