//! Request router: resolves prefixed names against the registry and
//! forwards invocations to the owning upstream.
//!
//! Tool-call failures come back as `isError` results so MCP clients that
//! inspect `isError` keep working; resource reads use the JSON-RPC error
//! path. An unknown prefix and a disconnected upstream are deliberately
//! indistinguishable downstream.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use switchboard_mcp::{
    CallToolParams, CallToolResult, ConnectorError, GetPromptParams, HandlerError,
    ListPromptsResult, ListResourcesResult, ListToolsResult, McpHandler, Prompt,
    ReadResourceParams, Resource, Tool,
};

use crate::manager::UpstreamManager;
use crate::registry::CapabilityRegistry;

pub struct ProxyRouter {
    registry: Arc<CapabilityRegistry>,
    manager: Arc<UpstreamManager>,
}

impl ProxyRouter {
    pub fn new(registry: Arc<CapabilityRegistry>, manager: Arc<UpstreamManager>) -> Self {
        Self { registry, manager }
    }
}

#[async_trait]
impl McpHandler for ProxyRouter {
    async fn list_tools(&self) -> Result<ListToolsResult, HandlerError> {
        let tools = self
            .registry
            .all_tools()
            .await
            .into_iter()
            .map(|entry| Tool {
                name: entry.prefixed_name,
                description: entry.description,
                input_schema: entry.parameters,
            })
            .collect();
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<Value, HandlerError> {
        let arguments = params.arguments.unwrap_or_else(|| serde_json::json!({}));

        let Some(entry) = self.registry.get_tool(&params.name).await else {
            debug!(tool = %params.name, "tool not in registry");
            return Ok(unavailable_tool_result(&params.name));
        };

        let forwarded = serde_json::json!({
            "name": entry.original_name,
            "arguments": arguments,
        });
        match self
            .manager
            .route_message(&entry.upstream, "tools/call", Some(forwarded))
            .await
        {
            Ok(result) => Ok(relay_tool_result(result)),
            Err(ConnectorError::NotConnected) => Ok(unavailable_tool_result(&params.name)),
            Err(e) => Ok(upstream_error_result(&e)),
        }
    }

    async fn list_resources(&self) -> Result<ListResourcesResult, HandlerError> {
        let resources = self
            .registry
            .all_resources()
            .await
            .into_iter()
            .map(|entry| Resource {
                uri: entry.prefixed_uri,
                name: entry.name,
                description: entry.description,
                mime_type: entry.mime_type,
            })
            .collect();
        Ok(ListResourcesResult {
            resources,
            next_cursor: None,
        })
    }

    async fn read_resource(&self, params: ReadResourceParams) -> Result<Value, HandlerError> {
        let not_found = || {
            HandlerError::NotFound(format!(
                "Resource '{}' not found or server unavailable",
                params.uri
            ))
        };

        let Some(entry) = self.registry.get_resource(&params.uri).await else {
            return Err(not_found());
        };

        let forwarded = serde_json::json!({ "uri": entry.original_uri });
        match self
            .manager
            .route_message(&entry.upstream, "resources/read", Some(forwarded))
            .await
        {
            Ok(result) => {
                if result.get("contents").is_some() {
                    Ok(result)
                } else {
                    Ok(serde_json::json!({
                        "contents": [{
                            "uri": entry.prefixed_uri,
                            "mimeType": "text/plain",
                            "text": encode_json(&result),
                        }]
                    }))
                }
            }
            Err(ConnectorError::NotConnected) => Err(not_found()),
            Err(e) => Err(HandlerError::Internal(format!("Upstream error: {e}"))),
        }
    }

    async fn list_prompts(&self) -> Result<ListPromptsResult, HandlerError> {
        let prompts = self
            .registry
            .all_prompts()
            .await
            .into_iter()
            .map(|entry| Prompt {
                name: entry.prefixed_name,
                description: entry.description,
                arguments: entry.arguments,
            })
            .collect();
        Ok(ListPromptsResult {
            prompts,
            next_cursor: None,
        })
    }

    async fn get_prompt(&self, params: GetPromptParams) -> Result<Value, HandlerError> {
        let not_found = || {
            HandlerError::NotFound(format!(
                "Prompt '{}' not found or server unavailable",
                params.name
            ))
        };

        let Some(entry) = self.registry.get_prompt(&params.name).await else {
            return Err(not_found());
        };

        let forwarded = serde_json::json!({
            "name": entry.original_name,
            "arguments": params.arguments.unwrap_or_else(|| serde_json::json!({})),
        });
        match self
            .manager
            .route_message(&entry.upstream, "prompts/get", Some(forwarded))
            .await
        {
            Ok(result) => Ok(result),
            Err(ConnectorError::NotConnected) => Err(not_found()),
            Err(e) => Err(HandlerError::Internal(format!("Upstream error: {e}"))),
        }
    }
}

fn unavailable_tool_result(name: &str) -> Value {
    let result = CallToolResult::text(
        format!("Tool '{name}' not found or server unavailable"),
        true,
    );
    serde_json::to_value(result).unwrap_or(Value::Null)
}

fn upstream_error_result(err: &ConnectorError) -> Value {
    let result = CallToolResult::text(format!("Upstream error: {err}"), true);
    serde_json::to_value(result).unwrap_or(Value::Null)
}

/// An upstream reply carrying `content` is relayed verbatim; anything else
/// is wrapped into a single text block with the JSON-encoded result.
fn relay_tool_result(result: Value) -> Value {
    if result.get("content").is_some() {
        return result;
    }
    serde_json::json!({
        "content": [{ "type": "text", "text": encode_json(&result) }]
    })
}

fn encode_json(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerOptions;

    fn router() -> ProxyRouter {
        let registry = Arc::new(CapabilityRegistry::default());
        let manager = UpstreamManager::new(registry.clone(), ManagerOptions::default());
        ProxyRouter::new(registry, manager)
    }

    #[tokio::test]
    async fn unknown_prefix_yields_is_error_result() {
        let r = router();
        let result = r
            .call_tool(CallToolParams {
                name: "nope___x".to_string(),
                arguments: None,
            })
            .await
            .expect("result");
        assert_eq!(result["isError"], true);
        let text = result["content"][0]["text"].as_str().expect("text");
        assert!(text.contains("not found or server unavailable"), "{text}");
    }

    #[tokio::test]
    async fn registered_tool_with_dead_upstream_is_unavailable() {
        let registry = Arc::new(CapabilityRegistry::default());
        let manager = UpstreamManager::new(registry.clone(), ManagerOptions::default());
        registry
            .register_tools(
                "ghost",
                vec![Tool {
                    name: "t".to_string(),
                    description: None,
                    input_schema: serde_json::json!({}),
                }],
            )
            .await;
        let r = ProxyRouter::new(registry, manager);

        let result = r
            .call_tool(CallToolParams {
                name: "ghost___t".to_string(),
                arguments: Some(serde_json::json!({})),
            })
            .await
            .expect("result");
        assert_eq!(result["isError"], true);
    }

    #[tokio::test]
    async fn unknown_resource_is_a_not_found_error() {
        let r = router();
        let err = r
            .read_resource(ReadResourceParams {
                uri: "nope___file:///x".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32601);
        assert!(err.to_string().contains("not found or server unavailable"));
    }

    #[tokio::test]
    async fn unknown_prompt_is_a_not_found_error() {
        let r = router();
        let err = r
            .get_prompt(GetPromptParams {
                name: "nope___p".to_string(),
                arguments: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32601);
    }

    #[tokio::test]
    async fn lists_project_prefixed_identifiers() {
        let registry = Arc::new(CapabilityRegistry::default());
        let manager = UpstreamManager::new(registry.clone(), ManagerOptions::default());
        registry
            .register_tools(
                "calc",
                vec![Tool {
                    name: "add".to_string(),
                    description: Some("adds".to_string()),
                    input_schema: serde_json::json!({"type":"object","properties":{}}),
                }],
            )
            .await;
        let r = ProxyRouter::new(registry, manager);

        let listed = r.list_tools().await.expect("list");
        assert_eq!(listed.tools.len(), 1);
        assert_eq!(listed.tools[0].name, "calc___add");
        assert_eq!(listed.tools[0].description.as_deref(), Some("adds"));
    }

    #[test]
    fn bare_results_are_wrapped_as_text_content() {
        let wrapped = relay_tool_result(serde_json::json!({"sum": 5}));
        assert_eq!(wrapped["content"][0]["type"], "text");
        assert_eq!(wrapped["content"][0]["text"], r#"{"sum":5}"#);

        let passthrough = relay_tool_result(serde_json::json!({
            "content": [{"type": "image", "data": "...", "mimeType": "image/png"}]
        }));
        assert_eq!(passthrough["content"][0]["type"], "image");
    }
}
