//! MCP Client Layer
//!
//! This module provides the high-level MCP client that drives a session with
//! one MCP server over any [`Transport`].
//!
//! # Architecture
//!
//! The client owns exactly one transport and walks a small state machine:
//!
//! ```text
//! Disconnected --connect_*--> Initializing --initialize ok--> Ready
//!      ^                           |                            |
//!      +------ initialize failed --+---------- close() ---------+
//! ```
//!
//! Connecting is atomic from the caller's point of view: the transport is
//! opened, the `initialize` handshake completes and the server metadata is
//! stored before the client reports `Ready`. Every other operation fails fast
//! with a client error unless the session is `Ready`.
//!
//! Requests on one client are serialized; concurrent callers should use
//! separate clients (see [`crate::mcp::pool`]).
//!
//! # Usage
//!
//! ```ignore
//! use mcp_runtime::mcp::McpClient;
//!
//! let client = McpClient::new();
//! client
//!     .connect_stdio(&["npx".into(), "-y".into(), "@modelcontextprotocol/server-filesystem".into()], None, None, Duration::from_secs(30))
//!     .await?;
//!
//! let tools = client.list_tools().await?;
//! let result = client
//!     .call_tool("read_file", json!({"path": "/tmp/file.txt"}), None)
//!     .await?;
//! client.close().await?;
//! ```

use crate::mcp::error::{McpError, Result};
use crate::mcp::http_transport::HttpTransport;
use crate::mcp::lock;
use crate::mcp::protocol::{
    create_notification, ClientInfo, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Params,
    ServerInfo, ToolDefinition,
};
use crate::mcp::sse_transport::SseTransport;
use crate::mcp::transport::{StdioTransport, Transport};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transport, or the last session was closed
    Disconnected,

    /// Transport open, `initialize` handshake in flight
    Initializing,

    /// Session established
    Ready,
}

/// High-level MCP client
///
/// All methods take `&self`; the client can be shared behind an `Arc`
/// (the connection pool does exactly that).
///
/// # Lifecycle
///
/// 1. Create client with `McpClient::new()`
/// 2. Connect with `connect_stdio` / `connect_sse` / `connect_http`
/// 3. Use the client (list tools, call tools, read resources)
/// 4. `close()` when done (safe to call more than once)
pub struct McpClient {
    /// Identity sent in the `initialize` request
    client_info: ClientInfo,

    state: std::sync::Mutex<ClientState>,

    /// Transport of the current session
    transport: std::sync::Mutex<Option<Arc<dyn Transport>>>,

    /// Server metadata (after initialization)
    server_info: std::sync::Mutex<Option<ServerInfo>>,

    /// Available tools (after listing)
    tools: std::sync::Mutex<Vec<ToolDefinition>>,

    /// Serializes request/response exchanges on the transport
    exchange: tokio::sync::Mutex<()>,
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClient {
    /// Create a disconnected client identifying itself as this crate
    pub fn new() -> Self {
        Self::with_client_info(ClientInfo::default())
    }

    /// Create a disconnected client with a custom identity
    pub fn with_client_info(client_info: ClientInfo) -> Self {
        Self {
            client_info,
            state: std::sync::Mutex::new(ClientState::Disconnected),
            transport: std::sync::Mutex::new(None),
            server_info: std::sync::Mutex::new(None),
            tools: std::sync::Mutex::new(Vec::new()),
            exchange: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn a local server and establish a session over stdio
    ///
    /// # Arguments
    ///
    /// * `command` - Command line of the server (e.g. `["python", "server.py"]`)
    /// * `cwd` - Working directory for the server process
    /// * `env` - Extra environment variables for the server process
    /// * `timeout` - Default timeout for the handshake and later requests
    pub async fn connect_stdio(
        &self,
        command: &[String],
        cwd: Option<&Path>,
        env: Option<HashMap<String, String>>,
        timeout: Duration,
    ) -> Result<()> {
        let mut transport = StdioTransport::from_command(command)?.with_timeout(timeout);
        if let Some(cwd) = cwd {
            transport = transport.with_cwd(cwd);
        }
        if let Some(env) = env {
            transport = transport.with_env(env);
        }

        self.connect_transport(Box::new(transport), Some(timeout)).await?;
        tracing::info!("Connected to MCP server via stdio: {}", command.join(" "));
        Ok(())
    }

    /// Establish a session with a remote server over SSE
    pub async fn connect_sse(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<()> {
        let transport = SseTransport::new(url)
            .with_headers(headers)
            .with_timeout(timeout);
        self.connect_transport(Box::new(transport), Some(timeout)).await
    }

    /// Establish a session with a remote server over plain HTTP
    pub async fn connect_http(
        &self,
        url: &str,
        headers: HashMap<String, String>,
        timeout: Duration,
    ) -> Result<()> {
        let transport = HttpTransport::new(url)
            .with_headers(headers)
            .with_timeout(timeout);
        self.connect_transport(Box::new(transport), Some(timeout)).await
    }

    /// Connect an arbitrary transport and run the `initialize` handshake
    ///
    /// On any failure the transport is closed again and the client is back
    /// in `Disconnected`.
    ///
    /// # Errors
    ///
    /// - [`McpError::Client`] if a session is already open
    /// - [`McpError::Connection`] if the server rejects `initialize`
    /// - whatever the transport reports for connect/send/receive failures
    pub async fn connect_transport(
        &self,
        transport: Box<dyn Transport>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if *state != ClientState::Disconnected {
                return Err(McpError::client(format!(
                    "Cannot connect: client is {:?}",
                    *state
                )));
            }
            *state = ClientState::Initializing;
        }

        let transport: Arc<dyn Transport> = Arc::from(transport);
        if let Err(e) = transport.connect().await {
            *lock(&self.state) = ClientState::Disconnected;
            return Err(e);
        }

        match self.initialize(transport.as_ref(), timeout).await {
            Ok(info) => {
                tracing::info!(
                    transport = transport.kind(),
                    "MCP session initialized: {} v{} (protocol {})",
                    info.name,
                    info.version,
                    info.protocol_version
                );
                *lock(&self.server_info) = Some(info);
                *lock(&self.transport) = Some(transport);
                *lock(&self.state) = ClientState::Ready;
                Ok(())
            }
            Err(e) => {
                tracing::warn!("MCP initialize failed: {}", e);
                if let Err(close_err) = transport.close().await {
                    tracing::debug!("Error closing transport after failed initialize: {}", close_err);
                }
                *lock(&self.state) = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    /// Run the `initialize` handshake on a freshly connected transport
    async fn initialize(
        &self,
        transport: &dyn Transport,
        timeout: Option<Duration>,
    ) -> Result<ServerInfo> {
        tracing::info!("Initializing MCP connection...");

        let request = JsonRpcRequest::initialize(&self.client_info);
        let response = transport.send_and_receive(&request, timeout).await?;

        let result = response.into_result().map_err(|error| {
            McpError::connection(format!("Initialize failed: {}", error))
                .with_details(error_details(&error))
        })?;
        let info = ServerInfo::from_initialize_result(&result)?;

        transport
            .send(&create_notification("notifications/initialized", None))
            .await?;

        Ok(info)
    }

    /// Current transport, provided the session is ready
    fn ready_transport(&self) -> Result<Arc<dyn Transport>> {
        if *lock(&self.state) != ClientState::Ready {
            return Err(McpError::client(
                "MCP session not initialized. Call connect_* first.",
            ));
        }
        lock(&self.transport)
            .clone()
            .ok_or_else(|| McpError::client("No transport connected"))
    }

    /// Send one request and wait for its response
    async fn request(
        &self,
        request: JsonRpcRequest,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse> {
        let transport = self.ready_transport()?;
        let _exchange = self.exchange.lock().await;
        transport.send_and_receive(&request, timeout).await
    }

    /// Send a request whose error object maps to [`McpError::Server`]
    async fn call(&self, request: JsonRpcRequest) -> Result<Value> {
        let method = request.method.clone();
        self.request(request, None)
            .await?
            .into_result()
            .map_err(|error| {
                McpError::server(format!("{} failed: {}", method, error))
                    .with_details(error_details(&error))
            })
    }

    /// List available tools from the MCP server
    ///
    /// The result is also cached (see [`McpClient::tools`]).
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Client is not initialized
    /// - Transport send/receive fails
    /// - Server returns an error response
    /// - A tool entry is malformed
    pub async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        tracing::debug!("Listing available tools from MCP server");

        let result = self.call(JsonRpcRequest::list_tools()).await?;
        let tools = result_array(&result, "tools")
            .iter()
            .map(ToolDefinition::from_mcp)
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Discovered {} tools from MCP server", tools.len());
        for tool in &tools {
            tracing::debug!("  - {}", tool.name);
        }

        *lock(&self.tools) = tools.clone();
        Ok(tools)
    }

    /// Call a tool on the MCP server
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the tool to call
    /// * `arguments` - The arguments to pass to the tool (must match tool's input schema)
    /// * `timeout` - Override of the transport's default timeout
    ///
    /// # Returns
    ///
    /// Returns the tool's result as an opaque JSON value
    ///
    /// # Errors
    ///
    /// Fails with [`McpError::ToolExecution`] when the server answers with an
    /// error object or flags the result with `isError`. A timed-out call
    /// leaves the request outstanding; its late response is discarded.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        tracing::debug!("Calling tool: {} with arguments: {}", name, arguments);

        let response = self
            .request(JsonRpcRequest::call_tool(name, arguments), timeout)
            .await?;

        let result = response
            .into_result()
            .map_err(|error| McpError::tool_execution(name, &error, Some(error.to_value())))?;

        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(McpError::tool_execution(
                name,
                "tool reported an error",
                Some(result),
            ));
        }

        tracing::info!("Tool '{}' executed successfully", name);
        Ok(result)
    }

    /// List resources exposed by the server
    pub async fn list_resources(&self) -> Result<Vec<Value>> {
        let result = self.call(JsonRpcRequest::list_resources()).await?;
        Ok(result_array(&result, "resources").to_vec())
    }

    /// Read one resource by URI; returns the raw `resources/read` result
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.call(JsonRpcRequest::read_resource(uri)).await
    }

    /// List prompts exposed by the server
    pub async fn list_prompts(&self) -> Result<Vec<Value>> {
        let result = self.call(JsonRpcRequest::list_prompts()).await?;
        Ok(result_array(&result, "prompts").to_vec())
    }

    /// Render a prompt; returns the raw `prompts/get` result
    pub async fn get_prompt(&self, name: &str, arguments: Option<Params>) -> Result<Value> {
        self.call(JsonRpcRequest::get_prompt(name, arguments)).await
    }

    /// Close the session and its transport
    ///
    /// Safe to call multiple times and on a client that never connected.
    pub async fn close(&self) -> Result<()> {
        let transport = lock(&self.transport).take();
        *lock(&self.state) = ClientState::Disconnected;
        *lock(&self.server_info) = None;
        lock(&self.tools).clear();

        if let Some(transport) = transport {
            transport.close().await?;
            tracing::info!("Closed MCP connection");
        }
        Ok(())
    }

    /// Ready and the transport still reports connected
    pub fn is_connected(&self) -> bool {
        *lock(&self.state) == ClientState::Ready
            && lock(&self.transport)
                .as_ref()
                .is_some_and(|t| t.is_connected())
    }

    /// Like [`McpClient::is_connected`], but asks the transport to probe
    pub async fn is_healthy(&self) -> bool {
        if *lock(&self.state) != ClientState::Ready {
            return false;
        }
        let transport = lock(&self.transport).clone();
        match transport {
            Some(transport) => transport.is_healthy().await,
            None => false,
        }
    }

    /// Get the current client state
    pub fn state(&self) -> ClientState {
        *lock(&self.state)
    }

    /// Server metadata from the handshake, `None` until `Ready`
    pub fn server_info(&self) -> Option<ServerInfo> {
        lock(&self.server_info).clone()
    }

    /// Tools cached by the last `list_tools()` call
    pub fn tools(&self) -> Vec<ToolDefinition> {
        lock(&self.tools).clone()
    }

    /// Kind of the current transport ("stdio", "sse", "http")
    pub fn transport_kind(&self) -> Option<&'static str> {
        lock(&self.transport).as_ref().map(|t| t.kind())
    }
}

/// `result[key]` as a slice, empty when missing
fn result_array<'a>(result: &'a Value, key: &str) -> &'a [Value] {
    result
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// JSON-RPC error object as error details
fn error_details(error: &JsonRpcError) -> Map<String, Value> {
    match error.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}
