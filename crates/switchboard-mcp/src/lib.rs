//! Model Context Protocol (MCP) primitives used by this repo.
//!
//! This crate holds both sides of the proxy's protocol surface:
//! - the upstream connectors (stdio, SSE, streamable HTTP, auto-detecting)
//!   the manager drives as an MCP *client*, and
//! - the downstream connection state machine the session layer drives as an
//!   MCP *server*.

mod connector;
mod discovery;
mod http_client;
mod jsonrpc;
mod server;
mod sse;
mod sse_client;
mod stdio_client;
mod types;

pub use connector::{
    AutoConnector, ConnectorCore, ConnectorError, ConnectorEvent, ConnectorOptions,
    ConnectorStatus, DEFAULT_PROBE_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, EventSender,
    UpstreamConnector, extract_result,
};
pub use discovery::{DiscoveredCapabilities, discover_capabilities, normalize_tool_schema};
pub use http_client::HttpConnector;
pub use jsonrpc::{
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, JsonRpcError, JsonRpcId, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, METHOD_NOT_FOUND, PARSE_ERROR,
};
pub use server::{HandlerError, McpConnection, McpHandler, McpServerConfig};
pub use sse::{SseDecoder, SseEvent, decode_sse_events, parse_first_json_message_from_sse};
pub use sse_client::SseConnector;
pub use stdio_client::StdioConnector;
pub use types::{
    CallToolParams, CallToolResult, ContentBlock, GetPromptParams, InitializeParams,
    InitializeResult, ListPromptsResult, ListResourcesResult, ListToolsResult, McpClientInfo,
    McpServerInfo, Prompt, PromptArgument, ReadResourceParams, Resource, Tool,
};

/// Latest protocol version supported by this implementation.
pub const PROTOCOL_VERSION_LATEST: &str = "2025-06-18";

/// Older protocol version still commonly used by clients.
pub const PROTOCOL_VERSION_2025_03_26: &str = "2025-03-26";
