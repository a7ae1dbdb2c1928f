//! Capability discovery.
//!
//! After a connector reports connected, the three list calls are issued
//! concurrently. Any single failure yields an empty set for that category
//! only; discovery as a whole never fails.

use serde_json::Value;
use tracing::{info, warn};

use crate::connector::UpstreamConnector;
use crate::types::{Prompt, Resource, Tool};

#[derive(Debug, Default)]
pub struct DiscoveredCapabilities {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
    /// Per-category failure messages; empty when everything listed cleanly.
    pub errors: Vec<String>,
}

pub async fn discover_capabilities(
    connector: &UpstreamConnector,
    upstream: &str,
) -> DiscoveredCapabilities {
    let (tools_res, resources_res, prompts_res) = tokio::join!(
        connector.send_request("tools/list", None),
        connector.send_request("resources/list", None),
        connector.send_request("prompts/list", None),
    );

    let mut caps = DiscoveredCapabilities::default();

    match tools_res {
        Ok(value) => caps.tools = parse_tools(&value, upstream),
        Err(e) => {
            warn!(upstream, error = %e, "tools/list failed");
            caps.errors.push(format!("tools/list: {e}"));
        }
    }
    match resources_res {
        Ok(value) => caps.resources = parse_resources(&value, upstream),
        Err(e) => {
            warn!(upstream, error = %e, "resources/list failed");
            caps.errors.push(format!("resources/list: {e}"));
        }
    }
    match prompts_res {
        Ok(value) => caps.prompts = parse_prompts(&value, upstream),
        Err(e) => {
            warn!(upstream, error = %e, "prompts/list failed");
            caps.errors.push(format!("prompts/list: {e}"));
        }
    }

    info!(
        upstream,
        tools = caps.tools.len(),
        resources = caps.resources.len(),
        prompts = caps.prompts.len(),
        "capability discovery complete"
    );
    caps
}

/// Normalize a raw tool entry's schema into a plain object schema.
///
/// Entries advertising `inputSchema` are reshaped to
/// `{type:"object", properties, required}`; an existing `parameters` object
/// is kept as-is; anything else gets the empty object schema.
pub fn normalize_tool_schema(entry: &Value) -> Value {
    if let Some(params) = entry.get("parameters")
        && params.is_object()
    {
        return params.clone();
    }
    if let Some(schema) = entry.get("inputSchema") {
        return serde_json::json!({
            "type": "object",
            "properties": schema.get("properties").cloned().unwrap_or_else(|| serde_json::json!({})),
            "required": schema.get("required").cloned().unwrap_or_else(|| serde_json::json!([])),
        });
    }
    serde_json::json!({ "type": "object", "properties": {} })
}

fn parse_tools(value: &Value, upstream: &str) -> Vec<Tool> {
    let Some(items) = value.get("tools").and_then(Value::as_array) else {
        warn!(upstream, "tools/list result missing 'tools' array");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|entry| {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                warn!(upstream, "dropping tool entry without a name");
                return None;
            };
            Some(Tool {
                name: name.to_string(),
                description: entry
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                input_schema: normalize_tool_schema(entry),
            })
        })
        .collect()
}

fn parse_resources(value: &Value, upstream: &str) -> Vec<Resource> {
    let Some(items) = value.get("resources").and_then(Value::as_array) else {
        warn!(upstream, "resources/list result missing 'resources' array");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(resource) => Some(resource),
            Err(e) => {
                warn!(upstream, error = %e, "dropping undecodable resource entry");
                None
            }
        })
        .collect()
}

fn parse_prompts(value: &Value, upstream: &str) -> Vec<Prompt> {
    let Some(items) = value.get("prompts").and_then(Value::as_array) else {
        warn!(upstream, "prompts/list result missing 'prompts' array");
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(prompt) => Some(prompt),
            Err(e) => {
                warn!(upstream, error = %e, "dropping undecodable prompt entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_schema_becomes_object_schema() {
        let entry = serde_json::json!({
            "name": "add",
            "inputSchema": {
                "type": "object",
                "properties": { "a": {}, "b": {} },
                "required": ["a", "b"]
            }
        });
        let schema = normalize_tool_schema(&entry);
        assert_eq!(schema["type"], "object");
        assert!(schema["properties"].get("a").is_some());
        assert_eq!(schema["required"][1], "b");
    }

    #[test]
    fn existing_parameters_are_kept() {
        let entry = serde_json::json!({
            "name": "x",
            "parameters": { "type": "object", "properties": { "q": {} } }
        });
        let schema = normalize_tool_schema(&entry);
        assert_eq!(schema, entry["parameters"]);
    }

    #[test]
    fn missing_schema_defaults_to_empty_object() {
        let entry = serde_json::json!({ "name": "bare" });
        let schema = normalize_tool_schema(&entry);
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"], serde_json::json!({}));
    }

    #[test]
    fn tools_without_names_are_dropped() {
        let value = serde_json::json!({
            "tools": [ { "name": "ok" }, { "description": "anonymous" } ]
        });
        let tools = parse_tools(&value, "u");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "ok");
    }

    #[test]
    fn malformed_category_payload_yields_empty() {
        let value = serde_json::json!({ "unexpected": true });
        assert!(parse_tools(&value, "u").is_empty());
        assert!(parse_resources(&value, "u").is_empty());
        assert!(parse_prompts(&value, "u").is_empty());
    }

    #[test]
    fn resources_and_prompts_parse() {
        let value = serde_json::json!({
            "resources": [
                { "uri": "file:///tmp/a", "name": "a", "mimeType": "text/plain" }
            ]
        });
        let resources = parse_resources(&value, "u");
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].mime_type.as_deref(), Some("text/plain"));

        let value = serde_json::json!({
            "prompts": [
                { "name": "greet", "arguments": [ { "name": "who", "required": true } ] }
            ]
        });
        let prompts = parse_prompts(&value, "u");
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].arguments[0].name, "who");
    }
}
