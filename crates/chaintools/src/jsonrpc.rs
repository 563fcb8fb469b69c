//! JSON-RPC 2.0 envelopes shared by the HTTP and stdio transports.

use chaincore::{ConnectionError, NodeError, ToolInfo, Value};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn call(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: Some(id),
            method: method.to_string(),
            params: Some(params),
        }
    }

    pub fn notification(method: &str) -> Self {
        Self {
            jsonrpc: "2.0",
            id: None,
            method: method.to_string(),
            params: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn matches(&self, id: u64) -> bool {
        self.id.as_ref().and_then(|v| v.as_u64()) == Some(id)
    }

    /// Unwrap the result of a protocol-level call.
    pub fn into_result(self) -> Result<serde_json::Value, ConnectionError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(ConnectionError::Transport(format!(
                "rpc error {}: {}",
                err.code, err.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(serde_json::Value::Null),
        }
    }
}

pub fn initialize_params(client_name: &str) -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {"name": client_name, "version": env!("CARGO_PKG_VERSION")},
    })
}

pub fn call_params(name: &str, arguments: serde_json::Value) -> serde_json::Value {
    serde_json::json!({"name": name, "arguments": arguments})
}

/// Convert a `tools/call` response into a value.
///
/// Structured content wins; otherwise text content is parsed as JSON when
/// possible and returned as a string when not.
pub fn tool_result(tool: &str, response: JsonRpcResponse) -> Result<Value, NodeError> {
    if let Some(err) = response.error {
        return Err(NodeError::ToolCall {
            tool: tool.to_string(),
            message: err.message,
        });
    }
    let result = response.result.unwrap_or(serde_json::Value::Null);

    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result.get("isError").and_then(|e| e.as_bool()).unwrap_or(false) {
        return Err(NodeError::ToolCall {
            tool: tool.to_string(),
            message: text,
        });
    }

    if let Some(structured) = result.get("structuredContent") {
        return Ok(Value::from_json(structured.clone()));
    }
    if result.get("content").is_none() {
        return Ok(Value::from_json(result));
    }
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => Ok(Value::from_json(json)),
        Err(_) => Ok(Value::String(text)),
    }
}

pub fn tool_list(result: serde_json::Value) -> Result<Vec<ToolInfo>, ConnectionError> {
    let tools = result
        .get("tools")
        .cloned()
        .unwrap_or(serde_json::Value::Array(Vec::new()));
    serde_json::from_value::<Vec<RawTool>>(tools)
        .map(|raw| raw.into_iter().map(RawTool::into_info).collect())
        .map_err(|e| ConnectionError::Transport(format!("invalid tools/list result: {}", e)))
}

#[derive(Deserialize)]
struct RawTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: serde_json::Value,
}

impl RawTool {
    fn into_info(self) -> ToolInfo {
        ToolInfo {
            name: self.name,
            description: self.description.unwrap_or_default(),
            input_schema: self.input_schema,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: serde_json::Value) -> JsonRpcResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_text_content_is_parsed_as_json() {
        let value = tool_result(
            "add",
            response(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "result": {"content": [{"type": "text", "text": "{\"sum\": 3}"}]}
            })),
        )
        .unwrap();
        assert_eq!(value.get_field("sum"), Some(Value::Number(3.0)));

        let value = tool_result(
            "echo",
            response(serde_json::json!({
                "id": 2, "result": {"content": [{"type": "text", "text": "hello"}]}
            })),
        )
        .unwrap();
        assert_eq!(value, Value::from("hello"));
    }

    #[test]
    fn test_tool_errors() {
        let err = tool_result(
            "div",
            response(serde_json::json!({
                "id": 3, "result": {"isError": true, "content": [{"type": "text", "text": "divide by zero"}]}
            })),
        )
        .unwrap_err();
        assert_eq!(
            err,
            NodeError::ToolCall {
                tool: "div".to_string(),
                message: "divide by zero".to_string()
            }
        );

        let err = tool_result(
            "nope",
            response(serde_json::json!({"id": 4, "error": {"code": -32601, "message": "unknown tool"}})),
        )
        .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_tool_list() {
        let tools = tool_list(serde_json::json!({
            "tools": [{"name": "add", "description": "Add numbers", "inputSchema": {"type": "object"}}]
        }))
        .unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "add");
    }
}
