//! Transport tests against live mock MCP servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use switchboard_core::HttpUpstream;
use switchboard_mcp::{
    ConnectorError, ConnectorEvent, ConnectorOptions, ConnectorStatus, HttpConnector,
    UpstreamConnector, discover_capabilities,
};

fn options() -> ConnectorOptions {
    ConnectorOptions {
        request_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_secs(1),
    }
}

fn upstream_config(addr: SocketAddr) -> HttpUpstream {
    HttpUpstream {
        url: format!("http://{addr}/").parse().expect("url"),
        headers: Default::default(),
    }
}

fn events() -> (
    mpsc::UnboundedSender<ConnectorEvent>,
    mpsc::UnboundedReceiver<ConnectorEvent>,
) {
    mpsc::unbounded_channel()
}

fn mcp_result(method: &str) -> Option<Value> {
    match method {
        "initialize" => Some(json!({
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "serverInfo": { "name": "mock", "version": "0.0.0" }
        })),
        "tools/list" => Some(json!({
            "tools": [ { "name": "echo", "inputSchema": { "type": "object" } } ]
        })),
        "resources/list" => Some(json!({ "resources": [] })),
        "ping" => Some(json!({})),
        _ => None,
    }
}

// ─── streamable HTTP mock ───────────────────────────────────────────────────

async fn streamable_handler(body: String) -> Response {
    let msg: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let Some(id) = msg.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = msg.get("method").and_then(Value::as_str).unwrap_or("");

    let body = match mcp_result(method) {
        Some(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        None => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "method not found" }
        }),
    };
    (
        [("mcp-session-id", "mock-session-1")],
        Json(body),
    )
        .into_response()
}

async fn start_streamable_mock() -> SocketAddr {
    let app = axum::Router::new().route("/", post(streamable_handler));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn streamable_http_connects_and_lists() {
    let addr = start_streamable_mock().await;
    let (tx, _rx) = events();
    let conn =
        HttpConnector::new("mock", upstream_config(addr), tx, options()).expect("connector");

    conn.connect().await.expect("connect");
    assert_eq!(conn.status(), ConnectorStatus::Connected);
    assert_eq!(conn.session_id().as_deref(), Some("mock-session-1"));

    let result = conn.send_request("tools/list", None).await.expect("list");
    assert_eq!(result["tools"][0]["name"], "echo");

    let err = conn.send_request("unknown/method", None).await.unwrap_err();
    assert!(matches!(err, ConnectorError::Rpc { code: -32601, .. }));

    conn.disconnect().await;
    assert_eq!(conn.status(), ConnectorStatus::Disconnected);
}

#[tokio::test]
async fn discovery_tolerates_partial_category_failures() {
    // The mock answers tools/list and resources/list but rejects
    // prompts/list; discovery must keep the two good categories.
    let addr = start_streamable_mock().await;
    let (tx, _rx) = events();
    let conn = UpstreamConnector::StreamableHttp(
        HttpConnector::new("mock", upstream_config(addr), tx, options()).expect("connector"),
    );
    conn.connect().await.expect("connect");

    let caps = discover_capabilities(&conn, "mock").await;
    assert_eq!(caps.tools.len(), 1);
    assert!(caps.resources.is_empty());
    assert!(caps.prompts.is_empty());
    assert_eq!(caps.errors.len(), 1);
    assert!(caps.errors[0].contains("prompts/list"));
}

#[tokio::test]
async fn auto_detection_picks_streamable_http() {
    let addr = start_streamable_mock().await;
    let (tx, _rx) = events();
    let conn =
        UpstreamConnector::for_config(
            "mock",
            &switchboard_core::UpstreamConfig::Auto(upstream_config(addr)),
            tx,
            options(),
        )
        .expect("connector");

    conn.connect().await.expect("connect");
    assert!(conn.is_connected());
    let result = conn.send_request("ping", None).await.expect("ping");
    assert_eq!(result, json!({}));
}

#[tokio::test]
async fn auto_detection_fails_cleanly_when_nothing_listens() {
    // Bind then drop a listener to get a port with no server behind it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let (tx, _rx) = events();
    let conn = UpstreamConnector::for_config(
        "mock",
        &switchboard_core::UpstreamConfig::Auto(upstream_config(addr)),
        tx,
        options(),
    )
    .expect("connector");

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, ConnectorError::UnknownTransport));
    assert!(!conn.is_connected());
}

// ─── SSE mock ───────────────────────────────────────────────────────────────

#[derive(Clone)]
struct SseMock {
    // Latest GET stream's sender; POSTed responses go here.
    current: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

async fn sse_stream(State(st): State<SseMock>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let _ = tx.send("event: endpoint\ndata: /messages\n\n".to_string());
    *st.current.lock().await = Some(tx);

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|frame| (Ok::<_, std::io::Error>(frame), rx))
    });

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn sse_message(State(st): State<SseMock>, body: String) -> Response {
    let msg: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    let Some(id) = msg.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let method = msg.get("method").and_then(Value::as_str).unwrap_or("");

    let response = match mcp_result(method) {
        Some(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        None => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": "method not found" }
        }),
    };
    if let Some(tx) = st.current.lock().await.as_ref() {
        let _ = tx.send(format!("event: message\ndata: {response}\n\n"));
    }
    StatusCode::ACCEPTED.into_response()
}

async fn start_sse_mock() -> SocketAddr {
    let state = SseMock {
        current: Arc::new(Mutex::new(None)),
    };
    let app = axum::Router::new()
        .route("/", get(sse_stream))
        .route("/messages", post(sse_message))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

#[tokio::test]
async fn sse_transport_correlates_over_the_stream() {
    let addr = start_sse_mock().await;
    let (tx, _rx) = events();
    // `sse`-tagged configs go through detection; the GET-only server rejects
    // the streamable-http probe and lands on SSE.
    let conn = UpstreamConnector::for_config(
        "mock",
        &switchboard_core::UpstreamConfig::Sse(upstream_config(addr)),
        tx,
        options(),
    )
    .expect("connector");

    conn.connect().await.expect("connect");
    assert!(conn.is_connected());

    let result = conn.send_request("tools/list", None).await.expect("list");
    assert_eq!(result["tools"][0]["name"], "echo");

    conn.disconnect().await;
    assert_eq!(conn.status(), ConnectorStatus::Disconnected);
}
