//! The downstream HTTP surface: `POST /mcp` plus the auxiliary `GET /health`
//! and `GET /mcp/info` endpoints.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use switchboard_mcp::{
    INVALID_PARAMS, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse,
    McpConnection, McpHandler, McpServerConfig, PARSE_ERROR,
};

use crate::manager::UpstreamManager;
use crate::registry::CapabilityRegistry;
use crate::sessions::SessionTable;

pub const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct AppState {
    pub cfg: McpServerConfig,
    pub handler: Arc<dyn McpHandler>,
    pub sessions: Arc<SessionTable>,
    pub registry: Arc<CapabilityRegistry>,
    pub manager: Arc<UpstreamManager>,
}

pub fn router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        .route("/mcp", post(mcp_post))
        .route("/mcp/info", get(mcp_info))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http());

    let router = if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    };
    router.with_state(state)
}

async fn health(State(st): State<AppState>) -> impl IntoResponse {
    let counts = st.registry.counts().await;
    let connected = st.manager.connected_count().await;
    let sessions = st.sessions.len().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "totalTools": counts.total_tools,
        "totalResources": counts.total_resources,
        "totalPrompts": counts.total_prompts,
        "connectedServers": connected,
        "activeSessions": sessions,
    }))
}

async fn mcp_info(State(st): State<AppState>) -> impl IntoResponse {
    let counts = st.registry.counts().await;
    let connected = st.manager.connected_count().await;
    let upstreams = st.manager.records().await;
    axum::Json(serde_json::json!({
        "serverInfo": st.cfg.server_info,
        "protocolVersions": st.cfg.supported_protocol_versions,
        "totalTools": counts.total_tools,
        "totalResources": counts.total_resources,
        "totalPrompts": counts.total_prompts,
        "connectedServers": connected,
        "upstreams": upstreams,
    }))
}

async fn mcp_post(State(st): State<AppState>, headers: HeaderMap, body: String) -> Response {
    let value: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            let resp = JsonRpcResponse::err(
                JsonRpcId::Null,
                JsonRpcError {
                    code: PARSE_ERROR,
                    message: "parse error".to_string(),
                    data: Some(serde_json::json!({ "detail": e.to_string() })),
                },
            );
            return jsonrpc_http_response(resp, None);
        }
    };

    if value.is_array() {
        let resp = JsonRpcResponse::err(
            JsonRpcId::Null,
            JsonRpcError {
                code: -32600,
                message: "batching not supported".to_string(),
                data: None,
            },
        );
        return jsonrpc_http_response(resp, None);
    }

    let msg: JsonRpcMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(e) => {
            let resp = JsonRpcResponse::err(
                JsonRpcId::Null,
                JsonRpcError {
                    code: -32600,
                    message: "invalid request".to_string(),
                    data: Some(serde_json::json!({ "detail": e.to_string() })),
                },
            );
            return jsonrpc_http_response(resp, None);
        }
    };

    // `initialize` always starts a fresh session, even when the caller
    // presents an existing session id.
    if let JsonRpcMessage::Request(JsonRpcRequest { method, .. }) = &msg
        && method == "initialize"
    {
        let conn = McpConnection::new(st.cfg.clone(), st.handler.clone());
        let (sid, resp) = st.sessions.create_with(conn, msg).await;
        return match resp {
            Some(r) => jsonrpc_http_response(r, Some(&sid)),
            None => StatusCode::ACCEPTED.into_response(),
        };
    }

    let session_id = headers
        .get(SESSION_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string);
    let request_id = match &msg {
        JsonRpcMessage::Request(req) => Some(req.id.clone()),
        _ => None,
    };

    match request_id {
        None => {
            // Notifications carry no id, so there is nothing to reject with;
            // deliver when the session is known, drop otherwise.
            if let Some(sid) = session_id {
                let _ = st.sessions.dispatch(&sid, msg).await;
            }
            StatusCode::ACCEPTED.into_response()
        }
        Some(request_id) => {
            let Some(sid) = session_id else {
                return jsonrpc_http_response(invalid_session(request_id), None);
            };
            match st.sessions.dispatch(&sid, msg).await {
                Ok(Some(resp)) => jsonrpc_http_response(resp, Some(&sid)),
                Ok(None) => StatusCode::ACCEPTED.into_response(),
                Err(_) => jsonrpc_http_response(invalid_session(request_id), None),
            }
        }
    }
}

fn invalid_session(id: JsonRpcId) -> JsonRpcResponse {
    JsonRpcResponse::err(
        id,
        JsonRpcError {
            code: INVALID_PARAMS,
            message: "invalid session id".to_string(),
            data: None,
        },
    )
}

fn jsonrpc_http_response(resp: JsonRpcResponse, session_id: Option<&str>) -> Response {
    let body = serde_json::to_string(&resp).unwrap_or_else(|_| "{}".to_string());
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json");

    if let Some(sid) = session_id
        && let Ok(v) = HeaderValue::from_str(sid)
    {
        builder = builder.header(SESSION_HEADER, v);
    }

    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
