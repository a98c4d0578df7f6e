//! MCP (Model Context Protocol) Client Runtime
//!
//! Discovers and invokes tools exposed by MCP servers over JSON-RPC 2.0.
//!
//! # Architecture
//!
//! The implementation is organized into four layers:
//!
//! 1. **Protocol Layer** (`protocol`, `error`): JSON-RPC 2.0 message types and
//!    the typed error taxonomy
//! 2. **Transport Layer** (`transport`, `sse_transport`, `http_transport`):
//!    the `Transport` trait with stdio, SSE and HTTP implementations
//! 3. **Client Layer** (`client`): session handshake and the MCP method API
//! 4. **Resilience Layer** (`pool`, `circuit_breaker`, `retry`): pooled
//!    clients with health monitoring, failure isolation and HTTP backoff
//!
//! Background work (stdio readers, the SSE listener, the pool health monitor)
//! runs on tokio tasks. Every blocking wait takes an explicit timeout.

// Protocol layer: JSON-RPC 2.0 message types
pub mod protocol;

// Error taxonomy shared by every layer
pub mod error;

// Transport layer: the Transport trait and the stdio transport
pub mod transport;

// Server-Sent Events transport for streaming remote servers
pub mod sse_transport;

// HTTP transport for request/response remote servers
pub mod http_transport;

// Retry logic and error resilience
pub mod retry;

// Client layer: High-level MCP client API
pub mod client;

// Pooled clients with background health checks
pub mod pool;

// Failure isolation around pool acquisition and tool calls
pub mod circuit_breaker;

// Property-based tests module
#[cfg(test)]
mod proptests;

pub use protocol::{
    create_notification, create_request, parse_response, ClientCapabilities, ClientInfo,
    InitializeParams, JsonRpcError, JsonRpcRequest, JsonRpcResponse, McpMethod, ParameterSchema,
    Params, RequestId, ServerInfo, ToolCallParams, ToolDefinition,
};

pub use error::{ErrorInfo, McpError, Result};

pub use http_transport::HttpTransport;
pub use sse_transport::SseTransport;
pub use transport::{StdioTransport, Transport};

pub use client::{ClientState, McpClient};

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use pool::{ConnectionPool, ConnectionPoolMetrics, PoolConfig, PoolConnection, PooledConnection};
pub use retry::Backoff;

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
