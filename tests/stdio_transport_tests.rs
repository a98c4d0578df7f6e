//! stdio transport integration tests
//!
//! Runs real child processes (`cat` and small `/bin/sh` servers) to check
//! byte fidelity, the receive timeout contract and a full MCP session.

#![cfg(unix)]

use mcp_runtime::mcp::protocol::JsonRpcRequest;
use mcp_runtime::mcp::{ClientState, McpClient, McpError, StdioTransport, Transport};
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

/// Minimal MCP server: answers initialize, tools/list and tools/call
const SH_SERVER: &str = r##"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\("[^"]*"\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"0.1.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"greet","description":"Say hello","inputSchema":{"type":"object","properties":{"name":{"type":"string","description":"Who to greet"}},"required":["name"]}}]}}\n' "$id" ;;
    *'"method":"tools/call"'*)
      echo "greet called" >&2
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"hello"}]}}\n' "$id" ;;
    *)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id" ;;
  esac
done
"##;

fn sh_server_command() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), SH_SERVER.to_string()]
}

#[tokio::test]
async fn test_large_unicode_payload_round_trips_through_cat() {
    let transport = StdioTransport::new("cat", Vec::<String>::new());
    transport.connect().await.unwrap();

    let mut payload = String::with_capacity(70_000);
    while payload.len() < 64 * 1024 {
        payload.push_str("héllo wörld ✓ 日本語 🚀 \u{2028} line\nbreak \"quoted\" \\ ");
    }

    let mut params = Map::new();
    params.insert("payload".to_string(), json!(payload));
    params.insert("nested".to_string(), json!({"emoji": "🦀", "list": [1, 2, 3]}));
    let request = JsonRpcRequest::new("echo", Some(params), Some("fidelity".into()));

    transport.send(&request).await.unwrap();
    let echoed = transport
        .receive(Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(echoed, serde_json::to_value(&request).unwrap());
    assert_eq!(echoed["params"]["payload"].as_str().unwrap().len(), payload.len());

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_messages_arrive_in_line_order() {
    let transport = StdioTransport::new("cat", Vec::<String>::new());
    transport.connect().await.unwrap();

    for i in 0..50i64 {
        let request = JsonRpcRequest::new("ping", None, Some(i.into()));
        transport.send(&request).await.unwrap();
    }
    for i in 0..50i64 {
        let message = transport
            .receive(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(message["id"], i);
    }

    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_receive_timeout_contract() {
    let transport = StdioTransport::new("cat", Vec::<String>::new());
    transport.connect().await.unwrap();

    let started = Instant::now();
    let err = transport
        .receive(Some(Duration::from_millis(200)))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, McpError::Timeout(_)));
    assert_eq!(err.retry_after(), Some(Duration::from_millis(200)));
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));

    // The transport is still usable afterwards
    assert!(transport.is_connected());
    transport.close().await.unwrap();
}

#[tokio::test]
async fn test_full_session_over_stdio() {
    let client = McpClient::new();
    client
        .connect_stdio(&sh_server_command(), None, None, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(client.state(), ClientState::Ready);
    assert_eq!(client.transport_kind(), Some("stdio"));
    let info = client.server_info().unwrap();
    assert_eq!(info.name, "sh-server");
    assert_eq!(info.version, "0.1.0");

    let tools = client.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "greet");
    assert_eq!(tools[0].required, vec!["name".to_string()]);
    assert_eq!(
        tools[0].parameters["name"].description.as_deref(),
        Some("Who to greet")
    );

    // stderr output from the server must not disturb the stream
    let result = client
        .call_tool("greet", json!({"name": "world"}), None)
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "hello");

    let err = client.list_prompts().await.unwrap_err();
    assert!(matches!(err, McpError::Server(_)));
    assert_eq!(err.details()["code"], -32601);

    assert!(client.is_healthy().await);
    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_unresponsive_and_exiting_servers() {
    // A server that never answers initialize fails the handshake with a timeout
    let silent = McpClient::new();
    let err = silent
        .connect_stdio(
            &["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()],
            None,
            None,
            Duration::from_millis(300),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Timeout(_)));
    assert_eq!(silent.state(), ClientState::Disconnected);

    // A server that exits right after the handshake is reported as gone
    let exiting = McpClient::new();
    let script = r#"IFS= read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":\("[^"]*"\).*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{"serverInfo":{"name":"short-lived","version":"1"}}}\n' "$id"
IFS= read -r ack
"#;
    exiting
        .connect_stdio(
            &["sh".to_string(), "-c".to_string(), script.to_string()],
            None,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while exiting.is_connected() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!exiting.is_connected());
    assert!(!exiting.is_healthy().await);
    assert!(exiting.list_tools().await.is_err());

    exiting.close().await.unwrap();
}

#[tokio::test]
async fn test_missing_binary_is_connection_error() {
    let client = McpClient::new();
    let err = client
        .connect_stdio(
            &["/nonexistent/mcp-server-binary".to_string()],
            None,
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, McpError::Connection(_)));
    assert_eq!(client.state(), ClientState::Disconnected);

    let err = client
        .connect_stdio(&[], None, None, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, McpError::Connection(_)));
}

#[tokio::test]
async fn test_echoed_value_is_plain_json() {
    // receive() hands back whatever the peer wrote, requests included
    let transport = StdioTransport::new("cat", Vec::<String>::new());
    transport.connect().await.unwrap();

    let notification = JsonRpcRequest::notification("notifications/progress", None);
    transport.send(&notification).await.unwrap();
    let message: Value = transport
        .receive(Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(message["method"], "notifications/progress");
    assert!(message.get("id").is_none());

    transport.close().await.unwrap();
}
