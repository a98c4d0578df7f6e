//! MCP Runtime Library
//!
//! This library provides a client runtime for the Model Context Protocol:
//! JSON-RPC codec, stdio/SSE/HTTP transports, the session client, a pooled
//! connection manager and a circuit breaker.

pub mod config;
pub mod mcp;
