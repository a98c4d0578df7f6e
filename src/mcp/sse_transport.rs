//! MCP SSE Transport Layer
//!
//! Server-Sent Events transport for remote MCP servers that push messages.
//!
//! # Architecture
//!
//! - **Receiving**: a background listener task keeps a `GET {url}/events`
//!   stream open (`Accept: text/event-stream`) and pushes the JSON payload of
//!   every `data:` frame into the receive queue. When the stream fails or
//!   ends, the listener waits `reconnect_interval` and reopens it, sending
//!   `Last-Event-ID` so the server can replay what we missed.
//! - **Sending**: every message is an independent `POST {url}/messages`.
//!
//! Delivery across reconnects is at-least-once; the client's id matching
//! drops duplicate responses.

use crate::mcp::error::{McpError, Result};
use crate::mcp::lock;
use crate::mcp::protocol::JsonRpcRequest;
use crate::mcp::transport::{
    join_with_timeout, receive_from_queue, Incoming, Transport, DEFAULT_TIMEOUT,
};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Default pause between stream reconnects
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// How long `close()` waits for the listener task
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Header used to resume an event stream
const LAST_EVENT_ID: &str = "Last-Event-ID";

/// One dispatched Server-Sent Event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental `text/event-stream` parser
///
/// Bytes may arrive split anywhere (even inside a UTF-8 sequence); events are
/// emitted once their terminating blank line has been seen. Both `\n` and
/// `\r\n` line endings are accepted.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    current: SseEvent,
    has_fields: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.is_empty() {
                if self.has_fields {
                    events.push(std::mem::take(&mut self.current));
                    self.has_fields = false;
                }
                continue;
            }

            self.field(&String::from_utf8_lossy(&line));
        }
        events
    }

    fn field(&mut self, line: &str) {
        // Lines starting with ':' are comments (keep-alives)
        if line.starts_with(':') {
            return;
        }

        let (name, value) = match line.split_once(':') {
            Some((name, value)) => (name, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match name {
            "id" => self.current.id = Some(value.trim().to_string()),
            "event" => self.current.event = Some(value.trim().to_string()),
            "data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
            }
            _ => return,
        }
        self.has_fields = true;
    }
}

/// State shared between the transport and its listener task
struct Listener {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    reconnect_interval: Duration,
    last_event_id: Arc<std::sync::Mutex<Option<String>>>,
    tx: mpsc::UnboundedSender<Incoming>,
}

impl Listener {
    /// Reconnect loop; exits when shutdown is signalled
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let outcome = tokio::select! {
                outcome = self.stream_events() => outcome,
                _ = shutdown.changed() => break,
            };

            if *shutdown.borrow() || self.tx.is_closed() {
                break;
            }
            match outcome {
                Ok(()) => tracing::info!("SSE stream ended: {}", self.url),
                Err(e) => tracing::error!("SSE listener error: {}", e),
            }

            tracing::info!("Reconnecting in {:?}...", self.reconnect_interval);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("SSE listener stopped: {}", self.url);
    }

    /// Open the event stream once and pump it until it ends
    async fn stream_events(&self) -> Result<()> {
        let mut request = self
            .http
            .get(format!("{}/events", self.url))
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let resume_from = lock(&self.last_event_id).clone();
        if let Some(id) = resume_from {
            tracing::debug!("Resuming SSE stream after event {}", id);
            request = request.header(LAST_EVENT_ID, id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| McpError::connection(format!("SSE connection error: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::authentication("Authentication failed"));
        }
        if !status.is_success() {
            return Err(McpError::connection(format!(
                "SSE connection failed: {}",
                status
            )));
        }

        tracing::info!("SSE connection established");

        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| McpError::transport(format!("SSE stream error: {}", e)))?;
            for event in parser.feed(&chunk) {
                self.dispatch(event);
            }
        }
        Ok(())
    }

    fn dispatch(&self, event: SseEvent) {
        if let Some(id) = event.id.filter(|id| !id.is_empty()) {
            *lock(&self.last_event_id) = Some(id);
        }
        if event.data.is_empty() {
            return;
        }

        match serde_json::from_str::<Value>(&event.data) {
            Ok(message) => {
                let _ = self.tx.send(Ok(message));
            }
            Err(e) => {
                let preview: String = event.data.chars().take(200).collect();
                tracing::error!(
                    event = event.event.as_deref().unwrap_or("message"),
                    "Invalid JSON in SSE event: {} (raw: {})",
                    e,
                    preview
                );
            }
        }
    }
}

/// SSE transport for remote MCP servers
///
/// # Example
///
/// ```ignore
/// let transport = SseTransport::new("http://localhost:8080/mcp")
///     .with_header("Authorization", "Bearer token")
///     .with_reconnect_interval(Duration::from_secs(2));
/// transport.connect().await?;
/// ```
pub struct SseTransport {
    http: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    reconnect_interval: Duration,
    connected: AtomicBool,
    last_event_id: Arc<std::sync::Mutex<Option<String>>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,
    shutdown: std::sync::Mutex<Option<watch::Sender<bool>>>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    /// Create a transport for the given base URL (trailing `/` is ignored)
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into().trim_end_matches('/').to_string(),
            headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            connected: AtomicBool::new(false),
            last_event_id: Arc::new(std::sync::Mutex::new(None)),
            incoming: Mutex::new(None),
            shutdown: std::sync::Mutex::new(None),
            listener: std::sync::Mutex::new(None),
        }
    }

    /// Add a header sent with both the stream and every POST
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Id of the last event seen on the stream
    pub fn last_event_id(&self) -> Option<String> {
        lock(&self.last_event_id).clone()
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the background listener
    ///
    /// Returns as soon as the listener is running; the stream itself is
    /// opened (and reopened) in the background.
    async fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(McpError::connection("Already connected"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let listener = Listener {
            http: self.http.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            reconnect_interval: self.reconnect_interval,
            last_event_id: Arc::clone(&self.last_event_id),
            tx,
        };

        *self.incoming.lock().await = Some(rx);
        *lock(&self.shutdown) = Some(shutdown_tx);
        *lock(&self.listener) = Some(tokio::spawn(listener.run(shutdown_rx)));

        tracing::info!("Connected to MCP server via SSE: {}", self.url);
        Ok(())
    }

    /// POST one message to `{url}/messages`
    async fn send(&self, request: &JsonRpcRequest) -> Result<()> {
        if !self.is_connected() {
            return Err(McpError::transport("Not connected"));
        }

        let mut post = self
            .http
            .post(format!("{}/messages", self.url))
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(request.to_json()?);
        for (name, value) in &self.headers {
            post = post.header(name, value);
        }

        let response = post.send().await.map_err(|e| {
            if e.is_connect() {
                McpError::connection(format!("Connection error: {}", e))
            } else {
                McpError::transport(format!("Failed to send message: {}", e))
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(McpError::authentication("Authentication failed"));
        }
        if !status.is_success() {
            return Err(McpError::transport(format!("HTTP error: {}", status)));
        }

        tracing::debug!("Sent message via SSE: {}", request.method);
        Ok(())
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Value> {
        receive_from_queue(&self.incoming, timeout.unwrap_or(self.timeout), self.kind()).await
    }

    async fn close(&self) -> Result<()> {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        if let Some(shutdown) = lock(&self.shutdown).take() {
            let _ = shutdown.send(true);
        }
        let listener = lock(&self.listener).take();
        if let Some(handle) = listener {
            join_with_timeout(handle, LISTENER_JOIN_TIMEOUT, "SSE listener").await;
        }
        drop(self.incoming.lock().await.take());

        if was_connected {
            tracing::info!("Closed SSE connection");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Healthy while connected and the listener task is alive
    async fn is_healthy(&self) -> bool {
        self.is_connected()
            && lock(&self.listener)
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}
