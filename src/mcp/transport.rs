//! MCP Transport Layer
//!
//! This module defines the transport abstraction for communicating with MCP servers.
//! Three transports are supported:
//!
//! - **stdio**: Standard input/output of a child process (this module)
//! - **SSE**: Server-Sent Events stream plus POST (see `sse_transport`)
//! - **HTTP**: Synchronous request/response with retry (see `http_transport`)
//!
//! # Architecture
//!
//! The transport layer is responsible only for sending and receiving messages.
//! Protocol concerns (JSON-RPC formatting) are handled in the protocol layer.
//! Streaming transports run a background reader task that feeds an internal
//! queue; the owning client is the only consumer of that queue.

use crate::mcp::error::{McpError, Result};
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::lock;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Default timeout for blocking transport operations
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a server gets to exit after EOF and SIGTERM before it is killed
const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(2);

/// How long `close()` waits for each reader task
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Queue item produced by background readers
pub(crate) type Incoming = Result<Value>;

/// Transport trait for MCP communication
///
/// All transports must implement this trait, enabling the client
/// to work with different transport mechanisms (stdio, SSE, HTTP).
/// Methods take `&self`; implementations keep their mutable state behind
/// locks so a transport can be shared with background tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short transport name for logs ("stdio", "sse", "http")
    fn kind(&self) -> &'static str;

    /// Timeout used when callers do not pass one
    fn default_timeout(&self) -> Duration;

    /// Establish the channel
    ///
    /// Fails with [`McpError::Connection`] if the channel cannot be opened
    /// or is already open.
    async fn connect(&self) -> Result<()>;

    /// Deliver one encoded message
    ///
    /// Fails with [`McpError::Transport`] if the channel is down.
    async fn send(&self, request: &JsonRpcRequest) -> Result<()>;

    /// Wait for the next incoming message
    ///
    /// Fails with [`McpError::Timeout`] (retry hint = the timeout) when
    /// nothing arrives in time.
    async fn receive(&self, timeout: Option<Duration>) -> Result<Value>;

    /// Release every resource held by the transport. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Cheap, non-blocking connection flag
    fn is_connected(&self) -> bool;

    /// Liveness check used by the pool's health monitor
    async fn is_healthy(&self) -> bool {
        self.is_connected()
    }

    /// Send a request and wait for the response carrying the same id
    ///
    /// Server-initiated messages and responses to other (abandoned) requests
    /// are discarded while waiting.
    async fn send_and_receive(
        &self,
        request: &JsonRpcRequest,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse> {
        let timeout = timeout.unwrap_or_else(|| self.default_timeout());
        let id = request
            .id
            .clone()
            .ok_or_else(|| McpError::protocol("Cannot wait for a response to a notification"))?;

        self.send(request).await?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timed_out = || {
                McpError::timeout(
                    format!(
                        "No response to '{}' within {:.1}s",
                        request.method,
                        timeout.as_secs_f64()
                    ),
                    timeout,
                )
            };
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let message = match self.receive(Some(remaining)).await {
                Ok(message) => message,
                Err(McpError::Timeout(_)) => return Err(timed_out()),
                Err(e) => return Err(e),
            };

            if message.get("method").is_some() {
                tracing::debug!(
                    transport = self.kind(),
                    "Ignoring server-initiated message: {}",
                    message["method"]
                );
                continue;
            }

            let response = JsonRpcResponse::from_value(message)?;
            if response.id.as_ref() == Some(&id) {
                return Ok(response);
            }

            tracing::debug!(
                transport = self.kind(),
                "Discarding response for another request (expected {}, got {:?})",
                id,
                response.id
            );
        }
    }
}

/// Pop one message from a reader queue, honoring the timeout
pub(crate) async fn receive_from_queue(
    queue: &Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,
    timeout: Duration,
    kind: &str,
) -> Result<Value> {
    let mut guard = queue.lock().await;
    let receiver = guard
        .as_mut()
        .ok_or_else(|| McpError::transport("Transport is not connected"))?;

    match tokio::time::timeout(timeout, receiver.recv()).await {
        Ok(Some(Ok(message))) => {
            let id = message.get("id").cloned().unwrap_or_default();
            tracing::debug!(transport = kind, "Received message: {}", id);
            Ok(message)
        }
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => Err(McpError::transport("Message stream closed by server")),
        Err(_) => Err(McpError::timeout(
            format!(
                "Timeout waiting for message ({:.1}s)",
                timeout.as_secs_f64()
            ),
            timeout,
        )),
    }
}

/// Join a background task, aborting it if it does not finish in time
pub(crate) async fn join_with_timeout(mut handle: JoinHandle<()>, timeout: Duration, name: &str) {
    if tokio::time::timeout(timeout, &mut handle).await.is_err() {
        tracing::debug!("{} did not stop within {:?}, aborting", name, timeout);
        handle.abort();
    }
}

/// stdio transport for local MCP servers
///
/// This transport spawns an MCP server as a child process and communicates
/// with it via stdin/stdout. Each line is a JSON-RPC message.
/// Stderr is drained and logged, never parsed.
///
/// # Example
///
/// ```ignore
/// let transport = StdioTransport::new("npx", ["-y", "@modelcontextprotocol/server-filesystem"]);
/// transport.connect().await?;
/// transport.send(&request).await?;
/// let response = transport.receive(None).await?;
/// ```
pub struct StdioTransport {
    /// Program to launch
    program: String,

    /// Program arguments
    args: Vec<String>,

    /// Working directory for the server process
    cwd: Option<PathBuf>,

    /// Extra environment variables (on top of the inherited environment)
    env: HashMap<String, String>,

    /// Default receive timeout
    timeout: Duration,

    /// Cleared by close() and by the stdout reader on EOF
    connected: Arc<AtomicBool>,

    /// Child process handle
    child: std::sync::Mutex<Option<Child>>,

    /// stdin handle for sending requests
    stdin: Mutex<Option<ChildStdin>>,

    /// Messages parsed by the stdout reader
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Incoming>>>,

    /// stdout and stderr reader tasks
    readers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport for `program args...` (not yet started)
    ///
    /// # Arguments
    ///
    /// * `program` - The command to spawn (e.g., "npx", "python", "./server")
    /// * `args` - Arguments to pass to the command
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            connected: Arc::new(AtomicBool::new(false)),
            child: std::sync::Mutex::new(None),
            stdin: Mutex::new(None),
            incoming: Mutex::new(None),
            readers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Build from a full command line (`["python", "server.py"]`)
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| McpError::connection("Empty server command"))?;
        Ok(Self::new(program.clone(), args.iter().cloned()))
    }

    /// Set the working directory of the server process
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add environment variables for the server process
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Set the default receive timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn the server right away
    ///
    /// # Example
    ///
    /// ```ignore
    /// let transport = StdioTransport::spawn(
    ///     "npx",
    ///     &["-y", "@modelcontextprotocol/server-filesystem", "/path/to/files"]
    /// ).await?;
    /// ```
    pub async fn spawn(program: &str, args: &[&str]) -> Result<Self> {
        let transport = Self::new(program, args.iter().copied());
        transport.connect().await?;
        Ok(transport)
    }

    /// Get the server command string (for diagnostics)
    pub fn command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// OS process id of the running server, if any
    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn default_timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(&self) -> Result<()> {
        let mut stdin_slot = self.stdin.lock().await;
        if self.connected.load(Ordering::SeqCst) || stdin_slot.is_some() {
            return Err(McpError::connection("Already connected"));
        }

        let command = self.command();
        tracing::info!("Spawning MCP server: {}", command);
        tracing::debug!("Server arguments: {:?}", self.args);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpError::connection(format!("Failed to start MCP server '{}': {}", command, e))
        })?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                let _ = child.start_kill();
                return Err(McpError::connection(
                    "Failed to capture MCP server stdio pipes",
                ));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        self.connected.store(true, Ordering::SeqCst);

        let stdout_task = tokio::spawn(read_stdout(
            stdout,
            tx,
            Arc::clone(&self.connected),
            command.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr(stderr, command.clone()));

        *stdin_slot = Some(stdin);
        *self.incoming.lock().await = Some(rx);
        *lock(&self.child) = Some(child);
        lock(&self.readers).extend([stdout_task, stderr_task]);

        tracing::info!("Started MCP server: {}", command);
        Ok(())
    }

    /// Send a JSON-RPC request to the MCP server via stdin
    ///
    /// The request is serialized to JSON and written as a single line to stdin.
    async fn send(&self, request: &JsonRpcRequest) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(McpError::transport("Not connected"));
        }

        let mut line = request.to_json()?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| McpError::transport("Process stdin not available"))?;

        // ChildStdin is unbuffered; flush is kept for writers that wrap it
        pipe.write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::transport(format!("Failed to send message: {}", e)))?;
        pipe.flush()
            .await
            .map_err(|e| McpError::transport(format!("Failed to flush MCP server stdin: {}", e)))?;

        tracing::debug!("Sent message: {}", request.method);
        Ok(())
    }

    async fn receive(&self, timeout: Option<Duration>) -> Result<Value> {
        receive_from_queue(&self.incoming, timeout.unwrap_or(self.timeout), self.kind()).await
    }

    /// Gracefully shut down the MCP server
    ///
    /// Closes stdin and sends SIGTERM; a server that has not exited after two
    /// seconds is killed.
    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        drop(self.stdin.lock().await.take());

        let child = lock(&self.child).take();
        if let Some(mut child) = child {
            terminate(&child);
            match tokio::time::timeout(GRACEFUL_SHUTDOWN, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!("MCP server exited: {}", status),
                Ok(Err(e)) => tracing::warn!("Failed to wait for MCP server: {}", e),
                Err(_) => {
                    tracing::warn!("MCP server did not exit, killing: {}", self.command());
                    if let Err(e) = child.kill().await {
                        tracing::error!("Failed to kill MCP server: {}", e);
                    }
                }
            }
            tracing::info!("Closed MCP server connection");
        }

        let readers = std::mem::take(&mut *lock(&self.readers));
        for handle in readers {
            join_with_timeout(handle, READER_JOIN_TIMEOUT, "stdio reader").await;
        }

        drop(self.incoming.lock().await.take());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Healthy while the process is running and stdout is still open
    async fn is_healthy(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match lock(&self.child).as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Ask the server process to exit
#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!("Failed to send SIGTERM to MCP server: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // kill_on_drop reaps the child; the readers end once the pipes close
        for handle in lock(&self.readers).drain(..) {
            handle.abort();
        }
    }
}

/// Parse newline-delimited JSON from the server's stdout into the queue
async fn read_stdout<R>(
    stdout: R,
    tx: mpsc::UnboundedSender<Incoming>,
    connected: Arc<AtomicBool>,
    command: String,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(line) {
                    Ok(message) => {
                        if tx.send(Ok(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let preview: String = line.chars().take(100).collect();
                        tracing::error!("Invalid JSON from MCP server: {} (raw: {})", e, preview);
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("MCP server closed stdout: {}", command);
                break;
            }
            Err(e) => {
                tracing::error!("stdout read error: {}", e);
                let _ = tx.send(Err(McpError::transport(format!("stdout read error: {}", e))));
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

/// Drain the server's stderr into the log
async fn read_stderr<R>(stderr: R, command: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let text = text.trim();
                if !text.is_empty() {
                    tracing::warn!(server = %command, "MCP server stderr: {}", text);
                }
            }
            Err(e) => {
                tracing::error!("stderr read error: {}", e);
                break;
            }
        }
    }
}
