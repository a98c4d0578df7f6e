//! MCP HTTP Transport Layer
//!
//! This module implements HTTP-based transport for communicating with MCP servers.
//!
//! # Architecture
//!
//! The HTTP transport uses standard HTTP POST requests to send JSON-RPC messages
//! to MCP servers. This is suitable for:
//!
//! - Remote MCP servers (cloud-hosted or network-accessible)
//! - Servers running behind HTTP reverse proxies and load balancers
//!
//! # Endpoints
//!
//! - `GET {url}/health`: liveness probe used by `connect()` and `is_healthy()`
//! - `POST {url}/rpc`: one JSON-RPC request per HTTP transaction
//!
//! Request and response are paired by the HTTP exchange itself, so plain
//! `receive()` is not supported; callers use `send_and_receive()`. Failed
//! exchanges are retried with exponential backoff (`retry_backoff * 2^attempt`).
//!
//! # Example
//!
//! ```ignore
//! use mcp_runtime::mcp::{McpClient, HttpTransport};
//!
//! let transport = HttpTransport::new("https://api.example.com/mcp")
//!     .with_header("Authorization", "Bearer token");
//!
//! let client = McpClient::new();
//! client.connect_transport(Box::new(transport), None).await?;
//! let tools = client.list_tools().await?;
//! ```

use crate::mcp::error::{McpError, Result};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::retry::{retry, should_retry_status, Backoff};
use crate::mcp::transport::{Transport, DEFAULT_TIMEOUT};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Default number of attempts per request
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Default base backoff between attempts
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Retry hint used when a 429 carries no usable `Retry-After`
const DEFAULT_RATE_LIMIT_RETRY: Duration = Duration::from_secs(5);

/// Timeout of the health probe in `is_healthy()`
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP transport for remote MCP servers
///
/// This transport uses HTTP POST requests to communicate with MCP servers.
/// Each request/response pair is a separate HTTP transaction.
///
/// # Configuration
///
/// - **url**: The base URL of the MCP server
/// - **timeout**: Request timeout (default: 30 seconds)
/// - **headers**: Optional custom HTTP headers (e.g., authentication)
/// - **max_retries**: Attempts per request (default: 3)
/// - **retry_backoff**: Base backoff between attempts (default: 1 second)
pub struct HttpTransport {
    /// Reqwest HTTP client
    client: reqwest::Client,

    /// MCP server base URL (without trailing slash)
    url: String,

    /// Extra headers sent with every request
    headers: HashMap<String, String>,

    /// Request timeout
    timeout: Duration,

    max_retries: usize,
    retry_backoff: Duration,

    /// Connection state
    connected: AtomicBool,
}

impl HttpTransport {
    /// Create a new HTTP transport for the given MCP server URL
    ///
    /// # Arguments
    ///
    /// * `url` - The base URL of the MCP server (e.g., "https://mcp.example.com")
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            connected: AtomicBool::new(false),
        }
    }

    /// Set the request timeout
    ///
    /// # Example
    ///
    /// ```ignore
    /// let transport = HttpTransport::new("https://mcp.example.com")
    ///     .with_timeout(Duration::from_secs(60));
    /// ```
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set retry behavior: `max_retries` attempts, `backoff * 2^attempt` apart
    pub fn with_retry(mut self, max_retries: usize, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    /// Get the server URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.max_retries, self.retry_backoff)
    }

    fn with_custom_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request
    }

    async fn get_health(&self, timeout: Duration) -> Result<Response> {
        let request = self
            .client
            .get(format!("{}/health", self.url))
            .timeout(timeout);
        self.with_custom_headers(request)
            .send()
            .await
            .map_err(|e| McpError::connection(format!("Connection error: {}", e)))
    }

    /// POST one JSON-RPC body to `{url}/rpc`, returning the decoded reply
    async fn post_rpc(&self, body: &str, timeout: Duration) -> Result<Value> {
        let request = self
            .client
            .post(format!("{}/rpc", self.url))
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .timeout(timeout)
            .body(body.to_string());

        let response = self
            .with_custom_headers(request)
            .send()
            .await
            .map_err(|e| request_error(e, timeout))?;

        let response = check_status(response)?;
        let text = response
            .text()
            .await
            .map_err(|e| McpError::transport(format!("Failed to read HTTP response body: {}", e)))?;

        tracing::debug!("Received HTTP response: {}", text);

        serde_json::from_str(&text).map_err(|e| {
            McpError::protocol(format!("Invalid JSON in HTTP response: {}", e))
        })
    }
}

/// Map a reqwest failure onto the error taxonomy
fn request_error(err: reqwest::Error, timeout: Duration) -> McpError {
    if err.is_timeout() {
        McpError::timeout(format!("HTTP request timed out: {}", err), timeout)
    } else if err.is_connect() {
        McpError::connection(format!("Connection error: {}", err))
    } else {
        McpError::transport(format!("Request failed: {}", err))
    }
}

/// Turn non-2xx statuses into typed errors
fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    match status {
        StatusCode::UNAUTHORIZED => Err(McpError::authentication("Authentication failed")),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after)
                .unwrap_or(DEFAULT_RATE_LIMIT_RETRY);
            Err(McpError::transport(format!(
                "Rate limited. Retry after {}s",
                retry_after.as_secs_f64()
            ))
            .with_retry_after(retry_after)
            .with_detail("status", Value::from(status.as_u16())))
        }
        _ => Err(McpError::transport(format!("HTTP error: {}", status))
            .with_detail("status", Value::from(status.as_u16()))),
    }
}

/// Parse a `Retry-After` value given in (possibly fractional) seconds
fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// HTTP status errors follow the status table; everything else by class
fn is_retryable(error: &McpError) -> bool {
    match error.details().get("status").and_then(Value::as_u64) {
        Some(status) => u16::try_from(status).is_ok_and(should_retry_status),
        None => error.is_transient(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe `GET {url}/health`; only HTTP 200 counts as up
    async fn connect(&self) -> Result<()> {
        let response = self.get_health(self.timeout).await?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => {
                return Err(McpError::authentication("Authentication failed"))
            }
            status => {
                return Err(McpError::connection(format!(
                    "Health check failed: HTTP {}",
                    status
                )))
            }
        }

        self.connected.store(true, Ordering::SeqCst);
        tracing::info!("Connected to MCP server via HTTP: {}", self.url);
        Ok(())
    }

    /// Fire-and-forget POST (notifications); the reply body is ignored
    async fn send(&self, request: &JsonRpcRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::transport("Not connected"));
        }

        let body = request.to_json()?;
        tracing::debug!("Sending HTTP POST to {}: {}", self.url, body);

        let post = self
            .client
            .post(format!("{}/rpc", self.url))
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body);
        let response = self
            .with_custom_headers(post)
            .send()
            .await
            .map_err(|e| request_error(e, self.timeout))?;
        check_status(response)?;
        Ok(())
    }

    async fn receive(&self, _timeout: Option<Duration>) -> Result<Value> {
        Err(McpError::transport(
            "HTTP transport uses request-response pattern. Use send_and_receive() instead.",
        ))
    }

    /// POST the request, retrying transient failures with backoff
    ///
    /// JSON-RPC error objects in the reply are application-level results and
    /// are returned as-is, never retried.
    async fn send_and_receive(
        &self,
        request: &JsonRpcRequest,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse> {
        if !self.is_connected() {
            return Err(McpError::transport("Not connected"));
        }

        let timeout = timeout.unwrap_or(self.timeout);
        let body = request.to_json()?;
        let body = body.as_str();
        tracing::debug!("Sending HTTP POST to {}: {}", self.url, body);

        let reply =
            retry(&self.backoff(), is_retryable, move || self.post_rpc(body, timeout)).await?;

        tracing::debug!("HTTP request successful: {}", request.method);
        JsonRpcResponse::from_value(reply)
    }

    async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::SeqCst) {
            tracing::info!("Closed HTTP connection");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Quick `GET {url}/health` with a 5 second timeout
    async fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        matches!(
            self.get_health(HEALTH_CHECK_TIMEOUT).await,
            Ok(response) if response.status() == StatusCode::OK
        )
    }
}
