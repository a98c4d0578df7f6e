//! MCP Client Error Types
//!
//! Every failure in the MCP runtime surfaces as an [`McpError`]. Each variant
//! carries the same [`ErrorInfo`] payload (message, optional error code,
//! structured details, optional retry hint) so callers can log or back off
//! uniformly regardless of which layer failed.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Error code attached to rejections from an open circuit breaker
pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";

/// Error code attached to exhausted connection pools
pub const POOL_EXHAUSTED: &str = "POOL_EXHAUSTED";

/// Error code attached to failed tool invocations
pub const TOOL_EXECUTION_FAILED: &str = "TOOL_EXECUTION_FAILED";

/// Shorthand result type for MCP operations
pub type Result<T> = std::result::Result<T, McpError>;

/// Payload shared by every MCP error variant
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    /// Human-readable message
    pub message: String,

    /// Machine-readable code (e.g. `CIRCUIT_OPEN`)
    pub error_code: Option<String>,

    /// Structured context (server error payloads, tool names, ...)
    pub details: Map<String, Value>,

    /// Suggested delay before retrying
    pub retry_after: Option<Duration>,

    /// When the error was raised
    pub timestamp: DateTime<Utc>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_code: None,
            details: Map::new(),
            retry_after: None,
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Error taxonomy for the MCP client runtime
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    /// Generic client error (e.g. session not initialized)
    #[error("{0}")]
    Client(ErrorInfo),

    /// A connection could not be established or provided
    /// (includes open circuits and exhausted pools)
    #[error("Connection error: {0}")]
    Connection(ErrorInfo),

    /// A blocking wait exceeded its deadline
    #[error("Timeout: {0}")]
    Timeout(ErrorInfo),

    /// The remote endpoint rejected our credentials
    #[error("Authentication error: {0}")]
    Authentication(ErrorInfo),

    /// A send/receive failed at the channel level
    #[error("Transport error: {0}")]
    Transport(ErrorInfo),

    /// The server answered with a JSON-RPC error object
    #[error("Server error: {0}")]
    Server(ErrorInfo),

    /// A named tool call failed
    #[error("{0}")]
    ToolExecution(ErrorInfo),

    /// Malformed or version-mismatched JSON-RPC framing
    #[error("Protocol error: {0}")]
    Protocol(ErrorInfo),
}

impl McpError {
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(ErrorInfo::new(message))
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(ErrorInfo::new(message))
    }

    /// Timeout error; the retry hint defaults to the timeout that elapsed
    pub fn timeout(message: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout(ErrorInfo::new(message)).with_retry_after(waited)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication(ErrorInfo::new(message))
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(ErrorInfo::new(message))
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::Server(ErrorInfo::new(message))
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(ErrorInfo::new(message))
    }

    /// Failure of a specific tool call, carrying the server's error payload
    pub fn tool_execution(
        tool_name: impl Into<String>,
        message: impl std::fmt::Display,
        tool_error: Option<Value>,
    ) -> Self {
        let tool_name = tool_name.into();
        let mut details = Map::new();
        details.insert("tool_name".to_string(), Value::String(tool_name.clone()));
        details.insert("tool_error".to_string(), tool_error.unwrap_or(Value::Null));

        Self::ToolExecution(ErrorInfo::new(format!(
            "Tool '{}' execution failed: {}",
            tool_name, message
        )))
        .with_code(TOOL_EXECUTION_FAILED)
        .with_details(details)
    }

    pub fn info(&self) -> &ErrorInfo {
        match self {
            Self::Client(info)
            | Self::Connection(info)
            | Self::Timeout(info)
            | Self::Authentication(info)
            | Self::Transport(info)
            | Self::Server(info)
            | Self::ToolExecution(info)
            | Self::Protocol(info) => info,
        }
    }

    fn info_mut(&mut self) -> &mut ErrorInfo {
        match self {
            Self::Client(info)
            | Self::Connection(info)
            | Self::Timeout(info)
            | Self::Authentication(info)
            | Self::Transport(info)
            | Self::Server(info)
            | Self::ToolExecution(info)
            | Self::Protocol(info) => info,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.info_mut().error_code = Some(code.into());
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> Self {
        self.info_mut().details.extend(details);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.info_mut().details.insert(key.into(), value);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.info_mut().retry_after = Some(retry_after);
        self
    }

    pub fn message(&self) -> &str {
        &self.info().message
    }

    pub fn error_code(&self) -> Option<&str> {
        self.info().error_code.as_deref()
    }

    pub fn details(&self) -> &Map<String, Value> {
        &self.info().details
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.info().retry_after
    }

    /// Name of the error class, stable across releases (used in logs)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Client(_) => "MCPError",
            Self::Connection(_) => "MCPConnectionError",
            Self::Timeout(_) => "MCPTimeoutError",
            Self::Authentication(_) => "MCPAuthenticationError",
            Self::Transport(_) => "MCPTransportError",
            Self::Server(_) => "MCPServerError",
            Self::ToolExecution(_) => "MCPToolExecutionError",
            Self::Protocol(_) => "MCPProtocolError",
        }
    }

    /// Whether a retry at the transport level could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Transport(_)
        )
    }

    /// Structured representation for logging and monitoring
    pub fn to_json(&self) -> Value {
        let info = self.info();
        json!({
            "error_type": self.kind(),
            "error_code": info.error_code,
            "message": info.message,
            "details": info.details,
            "timestamp": info.timestamp.to_rfc3339(),
            "retry_after": info.retry_after.map(|d| d.as_secs_f64()),
        })
    }
}

impl From<serde_json::Error> for McpError {
    fn from(err: serde_json::Error) -> Self {
        McpError::protocol(format!("Invalid JSON: {}", err))
    }
}
