use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::DeviceClass;

/// Description of a tool advertised to the calling client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Unique name, e.g. "start_video_recording".
    pub name: String,
    /// Human-readable description for the client.
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: Value,
    /// Device class gating this tool (None = cross-class device management).
    #[serde(default)]
    pub class: Option<DeviceClass>,
    /// Whether this tool changes device or session state.
    #[serde(default)]
    pub is_mutating: bool,
}

/// A request from the client to call a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// The result of executing a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    /// Optional structured data returned alongside the text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ToolResult {
    pub fn ok(call: &ToolCall, content: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            content: content.into(),
            is_error: false,
            data,
        }
    }

    /// Structured `{ error: { kind, message } }` failure payload. A failed
    /// start also carries the id of the session it left in `Failed`.
    pub fn from_error(call: &ToolCall, err: &crate::PeriphError) -> Self {
        let message = err.to_string();
        let mut error = serde_json::json!({ "kind": err.kind(), "message": message });
        if let Some(session_id) = err.session_id() {
            error["session_id"] = Value::String(session_id.to_string());
        }
        Self {
            tool_call_id: call.id.clone(),
            content: format!("Error ({}): {}", err.kind(), message),
            is_error: true,
            data: Some(serde_json::json!({ "error": error })),
        }
    }
}

/// Trait implemented by anything that can execute tool calls.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// List all tools this executor currently advertises.
    fn tools(&self) -> Vec<Tool>;

    /// Execute a single tool call and return the result.
    async fn execute(&self, call: &ToolCall) -> crate::Result<ToolResult>;
}
