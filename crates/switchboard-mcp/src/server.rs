//! Downstream MCP server connection: lifecycle enforcement + method routing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, JsonRpcError, JsonRpcId, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND,
};
use crate::types::{
    CallToolParams, GetPromptParams, InitializeParams, InitializeResult, ListPromptsResult,
    ListResourcesResult, ListToolsResult, McpServerInfo, ReadResourceParams,
};
use crate::{PROTOCOL_VERSION_2025_03_26, PROTOCOL_VERSION_LATEST};

/// Error surfaced by a request handler, carrying its JSON-RPC error code.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::NotFound(_) => METHOD_NOT_FOUND,
            Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    fn into_response(self, id: JsonRpcId) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code: self.code(),
                message: self.to_string(),
                data: None,
            },
        )
    }
}

/// The six downstream request handlers.
///
/// The invocation handlers return raw values: upstream replies are relayed
/// verbatim, and upstreams may use content shapes this crate does not model.
#[async_trait]
pub trait McpHandler: Send + Sync {
    async fn list_tools(&self) -> Result<ListToolsResult, HandlerError>;
    async fn call_tool(&self, params: CallToolParams) -> Result<Value, HandlerError>;
    async fn list_resources(&self) -> Result<ListResourcesResult, HandlerError>;
    async fn read_resource(&self, params: ReadResourceParams) -> Result<Value, HandlerError>;
    async fn list_prompts(&self) -> Result<ListPromptsResult, HandlerError>;
    async fn get_prompt(&self, params: GetPromptParams) -> Result<Value, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub server_info: McpServerInfo,
    pub instructions: Option<String>,
    pub capabilities: Value,
    pub supported_protocol_versions: Vec<String>,
}

impl McpServerConfig {
    pub fn default_for_binary(name: &str, version: &str) -> Self {
        Self {
            server_info: McpServerInfo {
                name: name.to_string(),
                version: version.to_string(),
            },
            instructions: None,
            capabilities: serde_json::json!({
                "tools": { "listChanged": false },
                "resources": { "listChanged": false },
                "prompts": { "listChanged": false }
            }),
            supported_protocol_versions: vec![
                PROTOCOL_VERSION_LATEST.to_string(),
                PROTOCOL_VERSION_2025_03_26.to_string(),
            ],
        }
    }

    fn negotiate_protocol(&self, requested: &str) -> String {
        if self
            .supported_protocol_versions
            .iter()
            .any(|v| v == requested)
        {
            requested.to_string()
        } else {
            PROTOCOL_VERSION_LATEST.to_string()
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ConnState {
    New,
    InitResponded,
    Ready,
}

/// MCP server connection state machine (lifecycle enforcement + method routing).
pub struct McpConnection {
    cfg: McpServerConfig,
    handler: Arc<dyn McpHandler>,
    state: ConnState,
    protocol_version: Option<String>,
}

impl McpConnection {
    pub fn new(cfg: McpServerConfig, handler: Arc<dyn McpHandler>) -> Self {
        Self {
            cfg,
            handler,
            state: ConnState::New,
            protocol_version: None,
        }
    }

    pub fn protocol_version(&self) -> Option<&str> {
        self.protocol_version.as_deref()
    }

    /// Handle a single JSON-RPC message.
    ///
    /// Returns `Some(response)` for requests, `None` for notifications or
    /// ignored messages.
    pub async fn handle_message(&mut self, msg: JsonRpcMessage) -> Option<JsonRpcResponse> {
        match msg {
            JsonRpcMessage::Request(req) => Some(self.handle_request(req).await),
            JsonRpcMessage::Notification(n) => {
                self.handle_notification(n);
                None
            }
            JsonRpcMessage::Response(_) => None,
        }
    }

    fn invalid_request(id: JsonRpcId, message: impl Into<String>) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code: -32600,
                message: message.into(),
                data: None,
            },
        )
    }

    fn method_not_found(id: JsonRpcId) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code: METHOD_NOT_FOUND,
                message: "method not found".to_string(),
                data: None,
            },
        )
    }

    fn invalid_params(id: JsonRpcId, detail: String) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code: INVALID_PARAMS,
                message: "invalid params".to_string(),
                data: Some(serde_json::json!({ "detail": detail })),
            },
        )
    }

    fn not_initialized(id: JsonRpcId) -> JsonRpcResponse {
        JsonRpcResponse::err(
            id,
            JsonRpcError {
                code: -32002,
                message: "not initialized".to_string(),
                data: None,
            },
        )
    }

    fn ok_value<T: serde::Serialize>(id: JsonRpcId, value: T) -> JsonRpcResponse {
        JsonRpcResponse::ok(id, serde_json::to_value(value).unwrap_or(Value::Null))
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if req.jsonrpc != "2.0" {
            return Self::invalid_request(req.id, "invalid jsonrpc version");
        }

        match req.method.as_str() {
            "initialize" => self.handle_initialize(req),
            // Allowed in any state.
            "ping" => JsonRpcResponse::ok(req.id, serde_json::json!({})),
            method if method.starts_with("notifications/") => {
                // Clients occasionally send these as requests; acknowledge.
                JsonRpcResponse::ok(req.id, serde_json::json!({}))
            }
            "tools/list" => {
                if self.state != ConnState::Ready {
                    return Self::not_initialized(req.id);
                }
                match self.handler.list_tools().await {
                    Ok(res) => Self::ok_value(req.id, res),
                    Err(e) => e.into_response(req.id),
                }
            }
            "tools/call" => {
                if self.state != ConnState::Ready {
                    return Self::not_initialized(req.id);
                }
                let params = match parse_params::<CallToolParams>(req.params) {
                    Ok(p) => p,
                    Err(detail) => return Self::invalid_params(req.id, detail),
                };
                match self.handler.call_tool(params).await {
                    Ok(res) => JsonRpcResponse::ok(req.id, res),
                    Err(e) => e.into_response(req.id),
                }
            }
            "resources/list" => {
                if self.state != ConnState::Ready {
                    return Self::not_initialized(req.id);
                }
                match self.handler.list_resources().await {
                    Ok(res) => Self::ok_value(req.id, res),
                    Err(e) => e.into_response(req.id),
                }
            }
            "resources/read" => {
                if self.state != ConnState::Ready {
                    return Self::not_initialized(req.id);
                }
                let params = match parse_params::<ReadResourceParams>(req.params) {
                    Ok(p) => p,
                    Err(detail) => return Self::invalid_params(req.id, detail),
                };
                match self.handler.read_resource(params).await {
                    Ok(res) => JsonRpcResponse::ok(req.id, res),
                    Err(e) => e.into_response(req.id),
                }
            }
            "prompts/list" => {
                if self.state != ConnState::Ready {
                    return Self::not_initialized(req.id);
                }
                match self.handler.list_prompts().await {
                    Ok(res) => Self::ok_value(req.id, res),
                    Err(e) => e.into_response(req.id),
                }
            }
            "prompts/get" => {
                if self.state != ConnState::Ready {
                    return Self::not_initialized(req.id);
                }
                let params = match parse_params::<GetPromptParams>(req.params) {
                    Ok(p) => p,
                    Err(detail) => return Self::invalid_params(req.id, detail),
                };
                match self.handler.get_prompt(params).await {
                    Ok(res) => JsonRpcResponse::ok(req.id, res),
                    Err(e) => e.into_response(req.id),
                }
            }
            _ => Self::method_not_found(req.id),
        }
    }

    fn handle_initialize(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        if self.state != ConnState::New {
            return Self::invalid_request(req.id, "already initialized");
        }

        let init: InitializeParams = match parse_params(req.params) {
            Ok(p) => p,
            Err(detail) => return Self::invalid_params(req.id, detail),
        };

        let negotiated = self.cfg.negotiate_protocol(&init.protocol_version);
        self.protocol_version = Some(negotiated.clone());
        self.state = ConnState::InitResponded;

        let result = InitializeResult {
            protocol_version: negotiated,
            capabilities: self.cfg.capabilities.clone(),
            server_info: self.cfg.server_info.clone(),
            instructions: self.cfg.instructions.clone(),
        };
        Self::ok_value(req.id, result)
    }

    fn handle_notification(&mut self, n: JsonRpcNotification) {
        if n.jsonrpc != "2.0" {
            return;
        }
        if n.method == "notifications/initialized" && self.state == ConnState::InitResponded {
            self.state = ConnState::Ready;
        }
    }

    pub fn make_initialized_notification() -> JsonRpcNotification {
        JsonRpcNotification::new("notifications/initialized", None)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    let value = params.ok_or_else(|| "missing params".to_string())?;
    serde_json::from_value(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallToolResult, ContentBlock, Tool};

    struct DummyHandler;

    #[async_trait]
    impl McpHandler for DummyHandler {
        async fn list_tools(&self) -> Result<ListToolsResult, HandlerError> {
            Ok(ListToolsResult {
                tools: vec![Tool {
                    name: "echo".to_string(),
                    description: Some("demo".to_string()),
                    input_schema: serde_json::json!({"type":"object"}),
                }],
                next_cursor: None,
            })
        }

        async fn call_tool(&self, params: CallToolParams) -> Result<Value, HandlerError> {
            let result = CallToolResult {
                content: vec![ContentBlock::Text {
                    text: format!("called {}", params.name),
                }],
                structured_content: None,
                is_error: Some(false),
            };
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }

        async fn list_resources(&self) -> Result<ListResourcesResult, HandlerError> {
            Ok(ListResourcesResult {
                resources: vec![],
                next_cursor: None,
            })
        }

        async fn read_resource(&self, params: ReadResourceParams) -> Result<Value, HandlerError> {
            Err(HandlerError::NotFound(format!(
                "Resource '{}' not found or server unavailable",
                params.uri
            )))
        }

        async fn list_prompts(&self) -> Result<ListPromptsResult, HandlerError> {
            Ok(ListPromptsResult {
                prompts: vec![],
                next_cursor: None,
            })
        }

        async fn get_prompt(&self, _params: GetPromptParams) -> Result<Value, HandlerError> {
            Ok(serde_json::json!({ "messages": [] }))
        }
    }

    fn mk_conn() -> McpConnection {
        let cfg = McpServerConfig::default_for_binary("test", "0.0.0");
        let h: Arc<dyn McpHandler> = Arc::new(DummyHandler);
        McpConnection::new(cfg, h)
    }

    fn request(id: u64, method: &str, params: Option<Value>) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest::new(JsonRpcId::Number(id), method, params))
    }

    async fn initialize(conn: &mut McpConnection) {
        let params = InitializeParams::new_default("client", "0.0.0");
        let resp = conn
            .handle_message(request(
                1,
                "initialize",
                serde_json::to_value(params).ok(),
            ))
            .await
            .expect("response");
        assert!(resp.error.is_none());
        conn.handle_message(JsonRpcMessage::Notification(
            McpConnection::make_initialized_notification(),
        ))
        .await;
    }

    #[tokio::test]
    async fn lifecycle_requires_initialize_and_initialized_notification() {
        let mut conn = mk_conn();

        let resp = conn
            .handle_message(request(1, "tools/list", None))
            .await
            .expect("response");
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32002));

        let resp = conn
            .handle_message(request(2, "ping", None))
            .await
            .expect("response");
        assert!(resp.error.is_none());

        initialize(&mut conn).await;

        let resp = conn
            .handle_message(request(3, "tools/list", None))
            .await
            .expect("response");
        assert!(resp.error.is_none());
        let tools = resp.result.expect("result");
        assert_eq!(tools["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn unknown_method_is_error() {
        let mut conn = mk_conn();
        let resp = conn
            .handle_message(request(1, "nope", None))
            .await
            .expect("response");
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32601));
    }

    #[tokio::test]
    async fn notification_methods_sent_as_requests_get_empty_results() {
        let mut conn = mk_conn();
        let resp = conn
            .handle_message(request(1, "notifications/cancelled", None))
            .await
            .expect("response");
        assert!(resp.error.is_none());
        assert_eq!(resp.result, Some(serde_json::json!({})));
    }

    #[tokio::test]
    async fn call_tool_without_params_is_invalid() {
        let mut conn = mk_conn();
        initialize(&mut conn).await;
        let resp = conn
            .handle_message(request(5, "tools/call", None))
            .await
            .expect("response");
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32602));
    }

    #[tokio::test]
    async fn handler_error_codes_pass_through() {
        let mut conn = mk_conn();
        initialize(&mut conn).await;
        let resp = conn
            .handle_message(request(
                6,
                "resources/read",
                Some(serde_json::json!({ "uri": "x___y" })),
            ))
            .await
            .expect("response");
        let err = resp.error.expect("error");
        assert_eq!(err.code, -32601);
        assert!(err.message.contains("not found or server unavailable"));
    }

    #[tokio::test]
    async fn double_initialize_on_one_connection_is_rejected() {
        let mut conn = mk_conn();
        initialize(&mut conn).await;
        let params = InitializeParams::new_default("client", "0.0.0");
        let resp = conn
            .handle_message(request(
                9,
                "initialize",
                serde_json::to_value(params).ok(),
            ))
            .await
            .expect("response");
        assert_eq!(resp.error.as_ref().map(|e| e.code), Some(-32600));
    }
}
