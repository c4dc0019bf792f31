//! MCP (Model Context Protocol) JSON-RPC 2.0 message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC "method not found" error code.
pub const METHOD_NOT_FOUND: i64 = -32601;

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
}

/// JSON-RPC 2.0 notification (a request without an id).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    pub params: Value,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.into(),
            params: params.unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Builds the reply to a server-initiated request.
pub fn response_message(id: Value, outcome: Result<Value, JsonRpcError>) -> Value {
    match outcome {
        Ok(result) => serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err(error) => serde_json::json!({"jsonrpc": "2.0", "id": id, "error": error}),
    }
}

/// Raw shape shared by every inbound JSON-RPC message.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// An inbound message after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Reply to one of our requests.
    Response {
        id: u64,
        outcome: Result<Value, JsonRpcError>,
    },
    /// Server-initiated request that expects a reply.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Server-initiated notification.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// A response whose id is not one we could have issued.
    ForeignResponse { id: Option<Value> },
}

impl IncomingMessage {
    /// Classifies a decoded JSON value. Returns `None` when the value is not
    /// a JSON-RPC message at all.
    pub fn classify(value: Value) -> Option<Self> {
        let raw: RawMessage = serde_json::from_value(value).ok()?;

        if let Some(method) = raw.method {
            return Some(match raw.id {
                Some(id) if !id.is_null() => IncomingMessage::Request {
                    id,
                    method,
                    params: raw.params,
                },
                _ => IncomingMessage::Notification {
                    method,
                    params: raw.params,
                },
            });
        }

        if raw.result.is_none() && raw.error.is_none() {
            return None;
        }

        let Some(id) = raw.id.as_ref().and_then(Value::as_u64) else {
            return Some(IncomingMessage::ForeignResponse { id: raw.id });
        };

        let outcome = match raw.error {
            Some(err) => Err(err),
            None => Ok(raw.result.unwrap_or(Value::Null)),
        };
        Some(IncomingMessage::Response { id, outcome })
    }
}

/// MCP tool definition from the `tools/list` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
    /// Name of the server that advertised this tool; filled in by the client.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl McpToolDef {
    /// Property names declared by the tool's input schema.
    pub fn property_names(&self) -> Vec<&str> {
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|props| props.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether the schema carries usage examples, at the top level or on a property.
    pub fn has_examples(&self) -> bool {
        let non_empty = |v: &Value| match v {
            Value::Array(items) => !items.is_empty(),
            Value::Null => false,
            _ => true,
        };
        if self.input_schema.get("examples").is_some_and(non_empty) {
            return true;
        }
        self.input_schema
            .get("properties")
            .and_then(Value::as_object)
            .is_some_and(|props| {
                props.values().any(|p| {
                    p.get("examples").is_some_and(non_empty) || p.get("example").is_some()
                })
            })
    }
}

/// MCP resource from the `resources/list` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpResource {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
}

/// One content entry returned by `resources/read`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, rename = "mimeType")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub blob: Option<String>,
}

/// `resources/read` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadResourceResult {
    #[serde(default)]
    pub contents: Vec<ResourceContents>,
}

/// Argument accepted by a prompt template.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// MCP prompt from the `prompts/list` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpPrompt {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
}

/// MCP tool call result from the `tools/call` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpToolResult {
    #[serde(default)]
    pub content: Vec<McpContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    #[serde(default, rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<Value>,
}

impl McpToolResult {
    /// All text blocks joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter(|c| !c.text.is_empty())
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// MCP content block.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct McpContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
    /// Base64 payload for image and audio blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Embedded resource for `resource` blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<Value>,
}

/// MCP server capabilities from the `initialize` response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Value>,
}

/// MCP initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Name and version the server reports at initialize.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Capabilities this client advertises during `initialize`.
pub fn client_capabilities() -> Value {
    serde_json::json!({
        "roots": {"listChanged": false},
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "test/method", Some(serde_json::json!({"key": "value"})));
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["method"], "test/method");
        assert_eq!(parsed["params"]["key"], "value");
    }

    #[test]
    fn test_json_rpc_request_no_params() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let parsed = serde_json::to_value(&req).unwrap();
        assert!(parsed.get("params").is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let note = JsonRpcNotification::new("notifications/initialized", None);
        let parsed = serde_json::to_value(&note).unwrap();
        assert!(parsed.get("id").is_none());
        assert_eq!(parsed["params"], serde_json::json!({}));
    }

    #[test]
    fn test_classify_response() {
        let msg = IncomingMessage::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": 7, "result": {"tools": []}
        }))
        .unwrap();
        assert_eq!(
            msg,
            IncomingMessage::Response {
                id: 7,
                outcome: Ok(serde_json::json!({"tools": []}))
            }
        );
    }

    #[test]
    fn test_classify_error_response() {
        let msg = IncomingMessage::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": 3, "error": {"code": -32600, "message": "Invalid request"}
        }))
        .unwrap();
        match msg {
            IncomingMessage::Response { id, outcome: Err(err) } => {
                assert_eq!(id, 3);
                assert_eq!(err.code, -32600);
                assert_eq!(err.message, "Invalid request");
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification_and_request() {
        let note = IncomingMessage::classify(serde_json::json!({
            "jsonrpc": "2.0", "method": "notifications/tools/list_changed"
        }))
        .unwrap();
        assert!(matches!(note, IncomingMessage::Notification { ref method, .. } if method == "notifications/tools/list_changed"));

        let req = IncomingMessage::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": "srv-1", "method": "ping"
        }))
        .unwrap();
        assert!(matches!(req, IncomingMessage::Request { ref method, .. } if method == "ping"));
    }

    #[test]
    fn test_classify_string_id_response_is_foreign() {
        let msg = IncomingMessage::classify(serde_json::json!({
            "jsonrpc": "2.0", "id": "abc", "result": {}
        }))
        .unwrap();
        assert!(matches!(msg, IncomingMessage::ForeignResponse { .. }));
    }

    #[test]
    fn test_classify_rejects_non_rpc() {
        assert!(IncomingMessage::classify(serde_json::json!({"hello": "world"})).is_none());
        assert!(IncomingMessage::classify(serde_json::json!([1, 2])).is_none());
    }

    #[test]
    fn test_mcp_tool_def_parse() {
        let json = r#"{"name":"read_file","description":"Read a file","inputSchema":{"type":"object","properties":{"path":{"type":"string"}}}}"#;
        let tool: McpToolDef = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "read_file");
        assert_eq!(tool.description, "Read a file");
        assert_eq!(tool.property_names(), vec!["path"]);
        assert!(tool.server.is_empty());
        assert!(!tool.has_examples());
    }

    #[test]
    fn test_tool_examples_detection() {
        let tool: McpToolDef = serde_json::from_value(serde_json::json!({
            "name": "draw",
            "inputSchema": {
                "type": "object",
                "properties": {"prompt": {"type": "string", "examples": ["a red fox"]}}
            }
        }))
        .unwrap();
        assert!(tool.has_examples());
    }

    #[test]
    fn test_mcp_tool_result_parse() {
        let json = r#"{"content":[{"type":"text","text":"file contents here"},{"type":"image","data":"AAA=","mimeType":"image/png"}],"isError":false}"#;
        let result: McpToolResult = serde_json::from_str(json).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.content.len(), 2);
        assert_eq!(result.text(), "file contents here");
        assert_eq!(result.content[1].mime_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_initialize_result_parse() {
        let json = r#"{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"test-server","version":"1.0"}}"#;
        let result: InitializeResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.protocol_version, "2024-11-05");
        assert!(result.capabilities.tools.is_some());
        assert_eq!(result.server_info.unwrap().name, "test-server");
    }

    #[test]
    fn test_response_message_shapes() {
        let ok = response_message(serde_json::json!("x"), Ok(serde_json::json!({})));
        assert_eq!(ok["id"], "x");
        assert!(ok.get("error").is_none());

        let err = response_message(
            serde_json::json!(4),
            Err(JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: "nope".into(),
                data: None,
            }),
        );
        assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
    }
}
