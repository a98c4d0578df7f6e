//! MCP Protocol Types (JSON-RPC 2.0)
//!
//! This module defines the core protocol types for the Model Context Protocol (MCP).
//! MCP is built on top of JSON-RPC 2.0, which is a simple stateless RPC protocol.
//!
//! # Protocol Specification
//!
//! - JSON-RPC 2.0: <https://www.jsonrpc.org/specification>
//! - MCP Spec: <https://modelcontextprotocol.io/specification/2024-11-05>
//!
//! # Architecture
//!
//! The protocol layer is responsible only for serialization/deserialization of MCP messages.
//! It is pure and stateless: every function here is safe to call from any task.
//! Transport concerns (stdio, SSE, HTTP) are handled in the transport layer.

use crate::mcp::error::{McpError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// MCP protocol revision advertised during `initialize`
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Parameters of a JSON-RPC request (always a JSON object for MCP)
pub type Params = Map<String, Value>;

/// JSON-RPC request identifier
///
/// We generate UUID strings, but servers are free to echo numeric ids in
/// server-initiated messages, so both forms are accepted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Fresh random identifier (UUID v4)
    pub fn generate() -> Self {
        Self::String(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

/// A JSON-RPC 2.0 request message
///
/// Requests are sent from the client to the MCP server to invoke methods.
/// A request without an `id` is a notification: the server sends no response.
///
/// # Example
///
/// ```json
/// {
///   "jsonrpc": "2.0",
///   "id": "6f1c7a64-6c3e-4d0e-9a43-8b2a8e1f7b0d",
///   "method": "tools/list"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters (optional, depends on method)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,

    /// Request identifier (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
}

impl JsonRpcRequest {
    /// Create a request, generating a UUID when no id is supplied
    pub fn new(method: impl Into<String>, params: Option<Params>, id: Option<RequestId>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: Some(id.unwrap_or_else(RequestId::generate)),
        }
    }

    /// Create a notification (no id, no response expected)
    pub fn notification(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Serialize to a single-line JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// `initialize` handshake request
    pub fn initialize(client_info: &ClientInfo) -> Self {
        let params = InitializeParams {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: client_info.clone(),
        };
        Self::new(McpMethod::Initialize.as_str(), object(json!(params)), None)
    }

    /// `tools/list` request
    pub fn list_tools() -> Self {
        Self::new(McpMethod::ToolsList.as_str(), None, None)
    }

    /// `tools/call` request
    pub fn call_tool(name: impl Into<String>, arguments: Value) -> Self {
        let params = ToolCallParams {
            name: name.into(),
            arguments,
        };
        Self::new(McpMethod::ToolsCall.as_str(), object(json!(params)), None)
    }

    /// `resources/list` request
    pub fn list_resources() -> Self {
        Self::new(McpMethod::ResourcesList.as_str(), None, None)
    }

    /// `resources/read` request
    pub fn read_resource(uri: impl Into<String>) -> Self {
        Self::new(
            McpMethod::ResourcesRead.as_str(),
            object(json!({ "uri": uri.into() })),
            None,
        )
    }

    /// `prompts/list` request
    pub fn list_prompts() -> Self {
        Self::new(McpMethod::PromptsList.as_str(), None, None)
    }

    /// `prompts/get` request; arguments are omitted when empty
    pub fn get_prompt(name: impl Into<String>, arguments: Option<Params>) -> Self {
        let mut params = Params::new();
        params.insert("name".to_string(), Value::String(name.into()));
        if let Some(arguments) = arguments.filter(|a| !a.is_empty()) {
            params.insert("arguments".to_string(), Value::Object(arguments));
        }
        Self::new(McpMethod::PromptsGet.as_str(), Some(params), None)
    }
}

fn object(value: Value) -> Option<Params> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

/// A JSON-RPC 2.0 response message
///
/// Responses are sent from the MCP server back to the client.
/// A response either contains a `result` or an `error`, but never both.
///
/// # Example (Error)
///
/// ```json
/// {
///   "jsonrpc": "2.0",
///   "id": "6f1c7a64-6c3e-4d0e-9a43-8b2a8e1f7b0d",
///   "error": {"code": -32601, "message": "Method not found"}
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: String,

    /// Identifier of the request this answers (null for parse errors)
    #[serde(default)]
    pub id: Option<RequestId>,

    /// Result payload (present on success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error information (present on failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Wire shape used while validating incoming responses
#[derive(Deserialize)]
struct RawResponse {
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<RequestId>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Create a successful response
    pub fn ok(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn err(id: impl Into<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: None,
            error: Some(error),
        }
    }

    /// Parse and validate a decoded JSON message
    pub fn from_value(value: Value) -> Result<Self> {
        let raw: RawResponse = serde_json::from_value(value)
            .map_err(|e| McpError::protocol(format!("Malformed JSON-RPC response: {}", e)))?;

        match raw.jsonrpc.as_deref() {
            Some(JSONRPC_VERSION) => {}
            Some(other) => {
                return Err(McpError::protocol(format!(
                    "Unsupported JSON-RPC version: {}",
                    other
                )))
            }
            None => return Err(McpError::protocol("Missing jsonrpc version field")),
        }

        Ok(Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: raw.id,
            result: raw.result,
            error: raw.error,
        })
    }

    /// Check if the response carries an error object
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Get the result, or the error if unsuccessful
    ///
    /// A response without either field is a successful `null` result.
    pub fn into_result(self) -> std::result::Result<Value, JsonRpcError> {
        match (self.result, self.error) {
            (Some(_), Some(_)) => Err(JsonRpcError::internal_error(
                "Invalid response: both result and error present",
            )),
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }
}

/// Build a request, generating a UUID id when none is given
pub fn create_request(
    method: impl Into<String>,
    params: Option<Params>,
    id: Option<RequestId>,
) -> JsonRpcRequest {
    JsonRpcRequest::new(method, params, id)
}

/// Build a notification (always without id)
pub fn create_notification(method: impl Into<String>, params: Option<Params>) -> JsonRpcRequest {
    JsonRpcRequest::notification(method, params)
}

/// Decode and validate a JSON-RPC response from raw bytes
pub fn parse_response(bytes: &[u8]) -> Result<JsonRpcResponse> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| McpError::protocol(format!("Malformed JSON: {}", e)))?;
    JsonRpcResponse::from_value(value)
}

/// A JSON-RPC 2.0 error object
///
/// Errors follow the JSON-RPC 2.0 specification with MCP-specific extensions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Error code (JSON-RPC defined or MCP-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i32, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Parse error (-32700): Invalid JSON was received
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(-32700, message)
    }

    /// Invalid request (-32600): The JSON sent is not a valid Request object
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(-32600, message)
    }

    /// Method not found (-32601)
    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::new(-32601, format!("Method not found: {}", method.into()))
    }

    /// Invalid params (-32602)
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(-32602, message)
    }

    /// Internal error (-32603)
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(-32603, message)
    }

    /// Server error (-32000)
    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(-32000, message)
    }

    /// The error object as a JSON value (used as error `details`)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[Error {}] {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

/// MCP method identifiers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum McpMethod {
    Initialize,
    ToolsList,
    ToolsCall,
    ResourcesList,
    ResourcesRead,
    PromptsList,
    PromptsGet,
    /// Custom method (for extensibility)
    Custom(String),
}

impl McpMethod {
    /// Convert to string for JSON-RPC method field
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initialize => "initialize",
            Self::ToolsList => "tools/list",
            Self::ToolsCall => "tools/call",
            Self::ResourcesList => "resources/list",
            Self::ResourcesRead => "resources/read",
            Self::PromptsList => "prompts/list",
            Self::PromptsGet => "prompts/get",
            Self::Custom(s) => s.as_str(),
        }
    }
}

impl From<String> for McpMethod {
    fn from(s: String) -> Self {
        match s.as_str() {
            "initialize" => Self::Initialize,
            "tools/list" => Self::ToolsList,
            "tools/call" => Self::ToolsCall,
            "resources/list" => Self::ResourcesList,
            "resources/read" => Self::ResourcesRead,
            "prompts/list" => Self::PromptsList,
            "prompts/get" => Self::PromptsGet,
            _ => Self::Custom(s),
        }
    }
}

impl From<&str> for McpMethod {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

/// Initialization parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,

    pub capabilities: ClientCapabilities,

    #[serde(rename = "clientInfo")]
    pub client_info: ClientInfo,
}

/// Client capabilities advertised during initialization
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCapabilities {
    /// Roots capability (`{"listChanged": true}`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<Value>,

    /// Sampling capability (object or absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,

    /// Experimental features
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Value>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            roots: Some(json!({ "listChanged": true })),
            sampling: Some(json!({})),
            experimental: None,
        }
    }
}

/// Client identification information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server metadata captured once per session from the `initialize` result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub capabilities: Value,
}

impl ServerInfo {
    /// Extract server metadata from an `initialize` result
    ///
    /// Servers that omit `serverInfo` are reported as `unknown` rather than
    /// failing the handshake.
    pub fn from_initialize_result(result: &Value) -> Result<Self> {
        if !result.is_object() {
            return Err(McpError::protocol(format!(
                "initialize result must be an object, got: {}",
                result
            )));
        }

        let server = &result["serverInfo"];
        Ok(Self {
            name: server["name"].as_str().unwrap_or("unknown").to_string(),
            version: server["version"].as_str().unwrap_or_default().to_string(),
            protocol_version: result["protocolVersion"]
                .as_str()
                .unwrap_or(MCP_PROTOCOL_VERSION)
                .to_string(),
            capabilities: result
                .get("capabilities")
                .cloned()
                .unwrap_or_else(|| json!({})),
        })
    }
}

/// Schema of a single tool parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterSchema {
    #[serde(rename = "type", default = "default_param_type")]
    pub param_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
}

fn default_param_type() -> String {
    "string".to_string()
}

/// Tool definition as discovered from a server
///
/// Immutable once discovered; identified by `name` (unique per server).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDefinition {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Parameter name -> schema
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterSchema>,

    /// Names of required parameters, in server order
    #[serde(default)]
    pub required: Vec<String>,

    /// The raw JSON schema as sent by the server
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Convert one entry of a `tools/list` result
    pub fn from_mcp(value: &Value) -> Result<Self> {
        let name = value["name"]
            .as_str()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| McpError::protocol(format!("Tool entry without a name: {}", value)))?;

        let input_schema = value.get("inputSchema").cloned().unwrap_or(Value::Null);

        let mut parameters = BTreeMap::new();
        if let Some(properties) = input_schema["properties"].as_object() {
            for (param, schema) in properties {
                let parsed: ParameterSchema =
                    serde_json::from_value(schema.clone()).map_err(|e| {
                        McpError::protocol(format!(
                            "Invalid schema for parameter '{}' of tool '{}': {}",
                            param, name, e
                        ))
                    })?;
                parameters.insert(param.clone(), parsed);
            }
        }

        let required = input_schema["required"]
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            name: name.to_string(),
            description: value["description"].as_str().unwrap_or_default().to_string(),
            parameters,
            required,
            input_schema,
        })
    }
}

/// Tool call parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallParams {
    pub name: String,
    pub arguments: Value,
}
