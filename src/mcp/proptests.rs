//! Property-Based Tests for MCP Client
//!
//! This module contains property-based tests using proptest to verify invariants
//! hold for random inputs across the MCP client implementation.
//!
//! # Test Strategies
//!
//! - **Message Serialization**: requests survive a wire round trip and
//!   responses are classified by their `result`/`error` members
//! - **Retry Logic**: Exponential backoff properties - delays should increase
//!   exponentially within bounds
//! - **Error Handling**: error flags and structured output agree with the variant
//! - **Event Streams**: SSE parsing does not depend on chunk boundaries
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib mcp::proptests
//! ```

use proptest::prelude::*;
use serde_json::{json, Map, Value};

use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    parse_response, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ToolDefinition,
};
use crate::mcp::retry::Backoff;
use crate::mcp::sse_transport::SseParser;
use std::time::Duration;

// Helper: Generate arbitrary JSON values
fn arb_json_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
        prop::collection::vec(any::<i64>().prop_map(|n| Value::Number(n.into())), 0..3)
            .prop_map(Value::Array),
    ]
}

// Helper: Generate arbitrary parameter maps
fn arb_params() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-z_]{1,8}", arb_json_value(), 0..4)
        .prop_map(|m| m.into_iter().collect())
}

// Helper: Generate request ids of both wire forms
fn arb_request_id() -> impl Strategy<Value = RequestId> {
    prop_oneof![
        any::<i64>().prop_map(RequestId::Number),
        "[a-zA-Z0-9-]{1,36}".prop_map(RequestId::String),
    ]
}

// Helper: One error per taxonomy entry
fn arb_mcp_error() -> impl Strategy<Value = McpError> {
    ("[a-zA-Z ]{1,20}", 0usize..8).prop_map(|(message, variant)| match variant {
        0 => McpError::client(message),
        1 => McpError::connection(message),
        2 => McpError::timeout(message, Duration::from_secs(1)),
        3 => McpError::authentication(message),
        4 => McpError::transport(message),
        5 => McpError::server(message),
        6 => McpError::tool_execution("tool", message, None),
        _ => McpError::protocol(message),
    })
}

// ============================================================================
// Property 1: Message Serialization Round-Trip
// ============================================================================

proptest! {
    /// Requests keep method, id and params across the wire
    #[test]
    fn prop_request_serialization_roundtrip(
        id in arb_request_id(),
        method in "[a-z_/]+",
        params in prop::option::of(arb_params())
    ) {
        let original = JsonRpcRequest::new(method, params, Some(id));
        let serialized = original.to_json().unwrap();
        let deserialized: JsonRpcRequest = serde_json::from_str(&serialized).unwrap();

        prop_assert_eq!(original, deserialized);
        prop_assert!(!serialized.contains('\n'));
    }

    /// Notifications never carry an id on the wire
    #[test]
    fn prop_notification_has_no_id(
        method in "[a-z_/]+",
        params in prop::option::of(arb_params())
    ) {
        let notification = JsonRpcRequest::notification(method, params);
        let value: Value = serde_json::from_str(&notification.to_json().unwrap()).unwrap();

        prop_assert!(value.get("id").is_none());
        prop_assert_eq!(&value["jsonrpc"], "2.0");
    }

    /// A response is an error exactly when it carries an error object
    #[test]
    fn prop_response_classification(
        id in arb_request_id(),
        result in arb_json_value(),
        error_code in prop::option::of(-32768i32..-32000)
    ) {
        let response = match error_code {
            Some(code) => JsonRpcResponse::err(id.clone(), JsonRpcError::new(code, "test error")),
            None => JsonRpcResponse::ok(id.clone(), result.clone()),
        };

        let bytes = serde_json::to_vec(&response).unwrap();
        let parsed = parse_response(&bytes).unwrap();

        prop_assert_eq!(parsed.id.clone(), Some(id));
        prop_assert_eq!(parsed.is_error(), error_code.is_some());
        match (parsed.into_result(), error_code) {
            (Ok(value), None) => prop_assert_eq!(value, result),
            (Err(err), Some(code)) => prop_assert_eq!(err.code, code),
            (other, _) => prop_assert!(false, "unexpected outcome: {:?}", other),
        }
    }

    /// Anything but version "2.0" is rejected
    #[test]
    fn prop_wrong_version_rejected(version in "[0-9]\\.[0-9]") {
        prop_assume!(version != "2.0");
        let bytes = serde_json::to_vec(&json!({
            "jsonrpc": version,
            "id": 1,
            "result": {}
        }))
        .unwrap();

        prop_assert!(matches!(parse_response(&bytes), Err(McpError::Protocol(_))));
    }
}

// ============================================================================
// Property 2: Retry Logic Properties
// ============================================================================

proptest! {
    /// Each pause is exactly twice the previous one
    #[test]
    fn prop_backoff_doubles(
        base_delay_ms in 1u64..1000,
        attempt in 1usize..12usize
    ) {
        let backoff = Backoff::new(3, Duration::from_millis(base_delay_ms));

        prop_assert_eq!(backoff.delay(attempt), backoff.delay(attempt - 1) * 2);
        prop_assert_eq!(
            backoff.delay(attempt),
            Duration::from_millis(base_delay_ms * (1u64 << attempt))
        );
    }

    /// Large attempt numbers saturate rather than panic
    #[test]
    fn prop_backoff_never_shrinks(
        base_delay_ms in 1u64..1000,
        attempt in 0usize..256usize
    ) {
        let backoff = Backoff::new(3, Duration::from_millis(base_delay_ms));
        prop_assert!(backoff.delay(attempt + 1) >= backoff.delay(attempt));
    }
}

// ============================================================================
// Property 3: Error Handling Invariants
// ============================================================================

proptest! {
    /// Only connection, timeout and transport failures are worth retrying
    #[test]
    fn prop_transient_flag_matches_variant(err in arb_mcp_error()) {
        let expected = matches!(
            err,
            McpError::Connection(_) | McpError::Timeout(_) | McpError::Transport(_)
        );
        prop_assert_eq!(err.is_transient(), expected);
    }

    /// Structured output mirrors the error's own accessors
    #[test]
    fn prop_error_json_consistent(
        err in arb_mcp_error(),
        code in "[A-Z_]{1,16}",
        retry_secs in 0u64..600
    ) {
        let err = err
            .with_code(code.clone())
            .with_retry_after(Duration::from_secs(retry_secs));
        let value = err.to_json();

        prop_assert_eq!(value["error_type"].as_str(), Some(err.kind()));
        prop_assert_eq!(value["error_code"].as_str(), Some(code.as_str()));
        prop_assert_eq!(value["message"].as_str(), Some(err.message()));
        prop_assert_eq!(value["retry_after"].as_f64(), Some(retry_secs as f64));
        prop_assert!(err.to_string().contains(err.message()));
    }
}

// ============================================================================
// Property 4: Tool Definition Invariants
// ============================================================================

proptest! {
    /// Every schema property becomes a parameter; required names keep order
    #[test]
    fn prop_tool_definition_from_listing(
        name in "[a-z_]{1,12}",
        params in prop::collection::btree_set("[a-z]{1,8}", 0..5),
        required_mask in prop::collection::vec(any::<bool>(), 5)
    ) {
        let properties: Map<String, Value> = params
            .iter()
            .map(|p| (p.clone(), json!({"type": "string", "description": p})))
            .collect();
        let required: Vec<String> = params
            .iter()
            .zip(&required_mask)
            .filter(|(_, keep)| **keep)
            .map(|(p, _)| p.clone())
            .collect();

        let listing = json!({
            "name": name,
            "description": "generated",
            "inputSchema": {"type": "object", "properties": properties, "required": required}
        });

        let tool = ToolDefinition::from_mcp(&listing).unwrap();
        prop_assert_eq!(&tool.name, &name);
        prop_assert_eq!(tool.parameters.len(), params.len());
        prop_assert_eq!(tool.required, required);
        prop_assert_eq!(&tool.input_schema, &listing["inputSchema"]);
    }
}

// ============================================================================
// Property 5: Event Stream Parsing
// ============================================================================

proptest! {
    /// Splitting the byte stream anywhere yields the same events
    #[test]
    fn prop_sse_parser_chunking_invariant(
        payloads in prop::collection::vec("[a-zA-Z0-9 {}\":,é中]{0,40}", 1..5),
        split_points in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
        crlf in any::<bool>()
    ) {
        let eol = if crlf { "\r\n" } else { "\n" };
        let mut stream = String::from(": keep-alive");
        stream.push_str(eol);
        for (i, payload) in payloads.iter().enumerate() {
            stream.push_str(&format!("id: {}{eol}data: {}{eol}{eol}", i, payload));
        }
        let bytes = stream.as_bytes();

        let expected = SseParser::new().feed(bytes);
        prop_assert_eq!(expected.len(), payloads.len());

        let mut cuts: Vec<usize> = split_points.iter().map(|ix| ix.index(bytes.len())).collect();
        cuts.sort_unstable();
        cuts.dedup();

        let mut parser = SseParser::new();
        let mut events = Vec::new();
        let mut start = 0;
        for cut in cuts.into_iter().chain(std::iter::once(bytes.len())) {
            events.extend(parser.feed(&bytes[start..cut]));
            start = cut;
        }

        prop_assert_eq!(&events, &expected);
        for (event, payload) in events.iter().zip(&payloads) {
            prop_assert_eq!(&event.data, payload);
        }
    }
}
