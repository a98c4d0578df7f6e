//! SSE and HTTP transport integration tests
//!
//! Each test starts an in-process axum server on an ephemeral port that
//! speaks just enough MCP for a session: `initialize`, `tools/list` and an
//! `add` tool.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mcp_runtime::mcp::protocol::JsonRpcRequest;
use mcp_runtime::mcp::{
    ClientState, HttpTransport, McpClient, McpError, SseTransport, Transport,
};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const TOKEN: &str = "Bearer secret";

/// JSON-RPC reply for one request
fn reply(request: &Value) -> Value {
    let id = request["id"].clone();
    match request["method"].as_str() {
        Some("initialize") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "axum-mcp", "version": "1.0.0"}
            }
        }),
        Some("tools/list") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {"tools": [{
                "name": "add",
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "a": {"type": "number"},
                        "b": {"type": "number"}
                    },
                    "required": ["a", "b"]
                }
            }]}
        }),
        Some("tools/call") => {
            let args = &request["params"]["arguments"];
            let sum = args["a"].as_f64().unwrap_or(0.0) + args["b"].as_f64().unwrap_or(0.0);
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": sum.to_string()}]}
            })
        }
        _ => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": -32601, "message": "Method not found"}
        }),
    }
}

fn authorized(token: Option<&str>, headers: &HeaderMap) -> bool {
    match token {
        Some(expected) => headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some(expected),
        None => true,
    }
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// SSE server
// ---------------------------------------------------------------------------

struct SseServer {
    token: Option<&'static str>,
    /// First stream replays events 41 and 42, then hangs up
    replay_first: bool,
    connections: AtomicUsize,
    resume_headers: Mutex<Vec<Option<String>>>,
    messages: Mutex<Vec<Value>>,
    next_event_id: AtomicUsize,
    live_tx: mpsc::UnboundedSender<String>,
    live_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl SseServer {
    async fn start(token: Option<&'static str>, replay_first: bool) -> (Arc<Self>, String) {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Self {
            token,
            replay_first,
            connections: AtomicUsize::new(0),
            resume_headers: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            next_event_id: AtomicUsize::new(100),
            live_tx,
            live_rx: Mutex::new(Some(live_rx)),
        });

        let app = Router::new()
            .route("/events", get(sse_events))
            .route("/messages", post(sse_messages))
            .with_state(Arc::clone(&state));
        let url = serve(app).await;
        (state, url)
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn resume_headers(&self) -> Vec<Option<String>> {
        self.resume_headers.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<Value> {
        self.messages.lock().unwrap().clone()
    }

    /// Encode a reply as an SSE event with its data split over two lines
    fn push_event(&self, message: &Value) {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let text = message.to_string();
        let event = match text.split_once(',') {
            Some((head, tail)) => format!("id: {}\ndata: {},\ndata: {}\n\n", id, head, tail),
            None => format!("id: {}\ndata: {}\n\n", id, text),
        };
        let _ = self.live_tx.send(event);
    }
}

fn event_stream(body: Body) -> Response {
    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn sse_events(State(state): State<Arc<SseServer>>, headers: HeaderMap) -> Response {
    if !authorized(state.token, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    state.resume_headers.lock().unwrap().push(
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    );
    let connection = state.connections.fetch_add(1, Ordering::SeqCst) + 1;

    if state.replay_first && connection == 1 {
        let replay = concat!(
            ": welcome\n\n",
            "id: 41\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"seq\":41}}\n\n",
            "id: 42\n",
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"seq\":42}}\n\n",
        );
        return event_stream(Body::from(replay));
    }

    let live = state.live_rx.lock().unwrap().take();
    match live {
        Some(rx) => {
            let stream = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
            });
            event_stream(Body::from_stream(stream))
        }
        None => event_stream(Body::from_stream(
            futures::stream::pending::<Result<String, Infallible>>(),
        )),
    }
}

async fn sse_messages(
    State(state): State<Arc<SseServer>>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> StatusCode {
    if !authorized(state.token, &headers) {
        return StatusCode::UNAUTHORIZED;
    }

    state.messages.lock().unwrap().push(message.clone());
    if message.get("id").is_some() {
        state.push_event(&reply(&message));
    }
    StatusCode::ACCEPTED
}

#[tokio::test]
async fn test_sse_stream_resumes_from_last_event_id() {
    let (server, url) = SseServer::start(None, true).await;
    let transport = SseTransport::new(url)
        .with_timeout(Duration::from_secs(5))
        .with_reconnect_interval(Duration::from_millis(100));
    transport.connect().await.unwrap();

    let first = transport.receive(Some(Duration::from_secs(5))).await.unwrap();
    let second = transport.receive(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(first["params"]["seq"], 41);
    assert_eq!(second["params"]["seq"], 42);

    // The replay stream hangs up; the listener comes back with the last id
    wait_until(|| server.connections() >= 2).await;
    assert_eq!(server.resume_headers(), vec![None, Some("42".to_string())]);
    assert_eq!(transport.last_event_id().as_deref(), Some("42"));
    assert!(transport.is_healthy().await);

    // Requests keep working over the resumed stream
    let request = JsonRpcRequest::list_tools();
    let response = transport
        .send_and_receive(&request, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response.id, request.id);
    assert_eq!(response.result.unwrap()["tools"][0]["name"], "add");
    assert_eq!(transport.last_event_id().as_deref(), Some("100"));

    transport.close().await.unwrap();
    assert!(!transport.is_connected());
    assert!(!transport.is_healthy().await);
}

#[tokio::test]
async fn test_sse_session_end_to_end() {
    let (server, url) = SseServer::start(None, false).await;
    let client = McpClient::new();
    client
        .connect_sse(&url, HashMap::new(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.transport_kind(), Some("sse"));
    assert_eq!(client.server_info().unwrap().name, "axum-mcp");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "add");

    let result = client
        .call_tool("add", json!({"a": 2, "b": 3}), None)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "5");

    // initialize, the initialized notification, tools/list, tools/call
    let methods: Vec<String> = server
        .messages()
        .iter()
        .map(|m| m["method"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(
        methods,
        vec!["initialize", "notifications/initialized", "tools/list", "tools/call"]
    );
    assert!(server.messages()[1].get("id").is_none());

    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn test_sse_rejected_credentials() {
    let (_server, url) = SseServer::start(Some(TOKEN), false).await;

    let transport = SseTransport::new(url.clone())
        .with_timeout(Duration::from_secs(5))
        .with_reconnect_interval(Duration::from_millis(100));
    transport.connect().await.unwrap();
    let err = transport
        .send(&JsonRpcRequest::list_tools())
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Authentication(_)));
    assert!(!err.is_transient());
    transport.close().await.unwrap();

    // The same server accepts a client that carries the token
    let client = McpClient::new();
    let headers = HashMap::from([("Authorization".to_string(), TOKEN.to_string())]);
    client
        .connect_sse(&url, headers, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(client.list_tools().await.unwrap()[0].name, "add");
    client.close().await.unwrap();
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

struct HttpServer {
    token: Option<&'static str>,
    health: StatusCode,
    /// Canned failures served before any real reply: (status, Retry-After)
    script: Mutex<VecDeque<(StatusCode, Option<&'static str>)>>,
    rpc_requests: AtomicUsize,
}

impl HttpServer {
    async fn start(token: Option<&'static str>, health: StatusCode) -> (Arc<Self>, String) {
        let state = Arc::new(Self {
            token,
            health,
            script: Mutex::new(VecDeque::new()),
            rpc_requests: AtomicUsize::new(0),
        });
        let app = Router::new()
            .route("/health", get(http_health))
            .route("/rpc", post(http_rpc))
            .with_state(Arc::clone(&state));
        let url = serve(app).await;
        (state, url)
    }

    fn script(&self, steps: &[(StatusCode, Option<&'static str>)]) {
        self.script.lock().unwrap().extend(steps.iter().copied());
    }

    fn rpc_requests(&self) -> usize {
        self.rpc_requests.load(Ordering::SeqCst)
    }
}

async fn http_health(State(state): State<Arc<HttpServer>>, headers: HeaderMap) -> StatusCode {
    if !authorized(state.token, &headers) {
        return StatusCode::UNAUTHORIZED;
    }
    state.health
}

async fn http_rpc(
    State(state): State<Arc<HttpServer>>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    state.rpc_requests.fetch_add(1, Ordering::SeqCst);
    if !authorized(state.token, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let scripted = state.script.lock().unwrap().pop_front();
    if let Some((status, retry_after)) = scripted {
        let mut response = (status, "scripted failure").into_response();
        if let Some(value) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(value));
        }
        return response;
    }

    if request.get("id").is_none() {
        return StatusCode::ACCEPTED.into_response();
    }
    Json(reply(&request)).into_response()
}

async fn connected_http(url: &str, max_retries: usize, backoff: Duration) -> HttpTransport {
    let transport = HttpTransport::new(url)
        .with_timeout(Duration::from_secs(5))
        .with_retry(max_retries, backoff);
    transport.connect().await.unwrap();
    transport
}

#[tokio::test]
async fn test_http_session_end_to_end() {
    let (server, url) = HttpServer::start(Some(TOKEN), StatusCode::OK).await;
    let client = McpClient::new();
    let headers = HashMap::from([("Authorization".to_string(), TOKEN.to_string())]);
    client
        .connect_http(&url, headers, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.transport_kind(), Some("http"));
    assert_eq!(client.server_info().unwrap().version, "1.0.0");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools[0].name, "add");
    assert_eq!(tools[0].required, vec!["a".to_string(), "b".to_string()]);

    let result = client
        .call_tool("add", json!({"a": 1.5, "b": 2}), None)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "3.5");

    let err = client.list_resources().await.unwrap_err();
    assert!(matches!(err, McpError::Server(_)));

    assert!(client.is_healthy().await);
    // initialize, initialized, tools/list, tools/call, resources/list
    assert_eq!(server.rpc_requests(), 5);

    client.close().await.unwrap();
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_http_retries_transient_statuses() {
    let (server, url) = HttpServer::start(None, StatusCode::OK).await;
    server.script(&[
        (StatusCode::SERVICE_UNAVAILABLE, None),
        (StatusCode::BAD_GATEWAY, None),
    ]);
    let transport = connected_http(&url, 3, Duration::from_millis(50)).await;

    let started = Instant::now();
    let response = transport
        .send_and_receive(&JsonRpcRequest::list_tools(), None)
        .await
        .unwrap();

    assert!(response.result.is_some());
    assert_eq!(server.rpc_requests(), 3);
    // 50ms then 100ms between attempts
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn test_http_gives_up_after_max_retries() {
    let (server, url) = HttpServer::start(None, StatusCode::OK).await;
    server.script(&[(StatusCode::INTERNAL_SERVER_ERROR, None); 5]);
    let transport = connected_http(&url, 2, Duration::from_millis(10)).await;

    let err = transport
        .send_and_receive(&JsonRpcRequest::list_tools(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, McpError::Transport(_)));
    assert_eq!(err.details()["status"], 500);
    assert_eq!(server.rpc_requests(), 2);
}

#[tokio::test]
async fn test_http_rate_limit_carries_retry_after() {
    let (server, url) = HttpServer::start(None, StatusCode::OK).await;
    server.script(&[
        (StatusCode::TOO_MANY_REQUESTS, Some("2")),
        (StatusCode::TOO_MANY_REQUESTS, None),
    ]);
    let transport = connected_http(&url, 1, Duration::from_millis(10)).await;

    let err = transport
        .send_and_receive(&JsonRpcRequest::list_tools(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Transport(_)));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    assert_eq!(err.details()["status"], 429);

    // Without the header the default back-off is reported
    let err = transport
        .send_and_receive(&JsonRpcRequest::list_tools(), None)
        .await
        .unwrap_err();
    assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    assert_eq!(server.rpc_requests(), 2);
}

#[tokio::test]
async fn test_http_auth_and_client_errors_are_not_retried() {
    let (server, url) = HttpServer::start(None, StatusCode::OK).await;
    server.script(&[
        (StatusCode::UNAUTHORIZED, None),
        (StatusCode::BAD_REQUEST, None),
    ]);
    let transport = connected_http(&url, 3, Duration::from_millis(10)).await;

    let err = transport
        .send_and_receive(&JsonRpcRequest::list_tools(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Authentication(_)));
    assert_eq!(server.rpc_requests(), 1);

    let err = transport
        .send_and_receive(&JsonRpcRequest::list_tools(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Transport(_)));
    assert_eq!(err.details()["status"], 400);
    assert_eq!(server.rpc_requests(), 2);
}

#[tokio::test]
async fn test_http_connect_probes_health() {
    let (_down, url) = HttpServer::start(None, StatusCode::SERVICE_UNAVAILABLE).await;
    let err = HttpTransport::new(url).connect().await.unwrap_err();
    assert!(matches!(err, McpError::Connection(_)));

    let (_locked, url) = HttpServer::start(Some(TOKEN), StatusCode::OK).await;
    let transport = HttpTransport::new(url.clone());
    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, McpError::Authentication(_)));
    assert!(!transport.is_connected());

    let transport = HttpTransport::new(url).with_header("Authorization", TOKEN);
    transport.connect().await.unwrap();
    assert!(transport.is_healthy().await);

    // Plain receive() has no meaning for request/response HTTP
    let err = transport.receive(None).await.unwrap_err();
    assert!(matches!(err, McpError::Transport(_)));

    // Nothing listening on the port
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let err = HttpTransport::new(format!("http://{}", addr))
        .with_timeout(Duration::from_secs(2))
        .connect()
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Connection(_)));
}
