//! Capability registry: the fused namespace of every upstream's tools,
//! resources, and prompts.
//!
//! Three sub-registries share one shape: prefixed id → record, plus a
//! reverse index from upstream name to the ids it owns. Registration
//! replaces an upstream's whole set atomically; readers take per-call
//! snapshots behind the lock.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use switchboard_core::add_prefix;
use switchboard_mcp::{Prompt, PromptArgument, Resource, Tool};

#[derive(Debug, Clone)]
pub struct ToolEntry {
    pub upstream: String,
    pub original_name: String,
    pub prefixed_name: String,
    pub description: Option<String>,
    pub parameters: Value,
}

impl ToolEntry {
    fn new(upstream: &str, tool: Tool) -> Self {
        Self {
            upstream: upstream.to_string(),
            prefixed_name: add_prefix(upstream, &tool.name),
            original_name: tool.name,
            description: tool.description,
            parameters: tool.input_schema,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub upstream: String,
    pub original_uri: String,
    pub prefixed_uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

impl ResourceEntry {
    fn new(upstream: &str, resource: Resource) -> Self {
        Self {
            upstream: upstream.to_string(),
            prefixed_uri: add_prefix(upstream, &resource.uri),
            original_uri: resource.uri,
            name: resource.name,
            description: resource.description,
            mime_type: resource.mime_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptEntry {
    pub upstream: String,
    pub original_name: String,
    pub prefixed_name: String,
    pub description: Option<String>,
    pub arguments: Vec<PromptArgument>,
}

impl PromptEntry {
    fn new(upstream: &str, prompt: Prompt) -> Self {
        Self {
            upstream: upstream.to_string(),
            prefixed_name: add_prefix(upstream, &prompt.name),
            original_name: prompt.name,
            description: prompt.description,
            arguments: prompt.arguments,
        }
    }
}

trait Registered {
    fn prefixed_id(&self) -> &str;
    fn owner(&self) -> &str;
}

impl Registered for ToolEntry {
    fn prefixed_id(&self) -> &str {
        &self.prefixed_name
    }
    fn owner(&self) -> &str {
        &self.upstream
    }
}

impl Registered for ResourceEntry {
    fn prefixed_id(&self) -> &str {
        &self.prefixed_uri
    }
    fn owner(&self) -> &str {
        &self.upstream
    }
}

impl Registered for PromptEntry {
    fn prefixed_id(&self) -> &str {
        &self.prefixed_name
    }
    fn owner(&self) -> &str {
        &self.upstream
    }
}

struct SubRegistry<T> {
    kind: &'static str,
    entries: HashMap<String, T>,
    by_upstream: HashMap<String, BTreeSet<String>>,
}

impl<T: Registered + Clone> SubRegistry<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
            by_upstream: HashMap::new(),
        }
    }

    /// Replace the upstream's set. A prefixed id already present (owned by
    /// another upstream, or duplicated within the batch) wins: the new entry
    /// is dropped with a warning. Returns how many entries were kept.
    fn replace(&mut self, upstream: &str, items: Vec<T>) -> usize {
        self.clear_upstream(upstream);

        let mut owned = BTreeSet::new();
        for item in items {
            let id = item.prefixed_id().to_string();
            if let Some(existing) = self.entries.get(&id) {
                warn!(
                    kind = self.kind,
                    upstream,
                    owner = existing.owner(),
                    id = %id,
                    "dropping capability with conflicting prefixed id"
                );
                continue;
            }
            owned.insert(id.clone());
            self.entries.insert(id, item);
        }

        let kept = owned.len();
        if !owned.is_empty() {
            self.by_upstream.insert(upstream.to_string(), owned);
        }
        kept
    }

    fn clear_upstream(&mut self, upstream: &str) {
        if let Some(ids) = self.by_upstream.remove(upstream) {
            for id in ids {
                self.entries.remove(&id);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    fn all(&self) -> Vec<T> {
        let mut items: Vec<T> = self.entries.values().cloned().collect();
        items.sort_by(|a, b| a.prefixed_id().cmp(b.prefixed_id()));
        items
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn count_for(&self, upstream: &str) -> usize {
        self.by_upstream.get(upstream).map_or(0, BTreeSet::len)
    }
}

/// Counts reported by `/health` and `/mcp/info`.
#[derive(Debug, Clone, Copy, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCounts {
    pub total_tools: usize,
    pub total_resources: usize,
    pub total_prompts: usize,
}

struct Inner {
    tools: SubRegistry<ToolEntry>,
    resources: SubRegistry<ResourceEntry>,
    prompts: SubRegistry<PromptEntry>,
}

pub struct CapabilityRegistry {
    inner: RwLock<Inner>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tools: SubRegistry::new("tool"),
                resources: SubRegistry::new("resource"),
                prompts: SubRegistry::new("prompt"),
            }),
        }
    }
}

impl CapabilityRegistry {
    pub async fn register_tools(&self, upstream: &str, tools: Vec<Tool>) -> usize {
        let entries = tools.into_iter().map(|t| ToolEntry::new(upstream, t)).collect();
        self.inner.write().await.tools.replace(upstream, entries)
    }

    pub async fn register_resources(&self, upstream: &str, resources: Vec<Resource>) -> usize {
        let entries = resources
            .into_iter()
            .map(|r| ResourceEntry::new(upstream, r))
            .collect();
        self.inner.write().await.resources.replace(upstream, entries)
    }

    pub async fn register_prompts(&self, upstream: &str, prompts: Vec<Prompt>) -> usize {
        let entries = prompts
            .into_iter()
            .map(|p| PromptEntry::new(upstream, p))
            .collect();
        self.inner.write().await.prompts.replace(upstream, entries)
    }

    pub async fn get_tool(&self, prefixed: &str) -> Option<ToolEntry> {
        self.inner.read().await.tools.get(prefixed).cloned()
    }

    pub async fn get_resource(&self, prefixed: &str) -> Option<ResourceEntry> {
        self.inner.read().await.resources.get(prefixed).cloned()
    }

    pub async fn get_prompt(&self, prefixed: &str) -> Option<PromptEntry> {
        self.inner.read().await.prompts.get(prefixed).cloned()
    }

    pub async fn all_tools(&self) -> Vec<ToolEntry> {
        self.inner.read().await.tools.all()
    }

    pub async fn all_resources(&self) -> Vec<ResourceEntry> {
        self.inner.read().await.resources.all()
    }

    pub async fn all_prompts(&self) -> Vec<PromptEntry> {
        self.inner.read().await.prompts.all()
    }

    /// Remove every capability the upstream owns, across all three kinds.
    pub async fn clear_upstream(&self, upstream: &str) {
        let mut inner = self.inner.write().await;
        inner.tools.clear_upstream(upstream);
        inner.resources.clear_upstream(upstream);
        inner.prompts.clear_upstream(upstream);
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.tools = SubRegistry::new("tool");
        inner.resources = SubRegistry::new("resource");
        inner.prompts = SubRegistry::new("prompt");
    }

    pub async fn counts(&self) -> RegistryCounts {
        let inner = self.inner.read().await;
        RegistryCounts {
            total_tools: inner.tools.len(),
            total_resources: inner.resources.len(),
            total_prompts: inner.prompts.len(),
        }
    }

    /// Reverse-index count of tools owned by one upstream (reflects entries
    /// dropped on collision).
    pub async fn tool_count_for(&self, upstream: &str) -> usize {
        self.inner.read().await.tools.count_for(upstream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.to_string(),
            description: None,
            input_schema: serde_json::json!({"type":"object","properties":{}}),
        }
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let reg = CapabilityRegistry::default();
        reg.register_tools("calc", vec![tool("add")]).await;

        let entry = reg.get_tool("calc___add").await.expect("entry");
        assert_eq!(entry.upstream, "calc");
        assert_eq!(entry.original_name, "add");
        assert_eq!(entry.prefixed_name, "calc___add");
        assert!(reg.get_tool("calc___sub").await.is_none());
    }

    #[tokio::test]
    async fn every_listed_id_resolves() {
        let reg = CapabilityRegistry::default();
        reg.register_tools("a", vec![tool("x"), tool("y")]).await;
        reg.register_tools("b", vec![tool("x")]).await;

        for entry in reg.all_tools().await {
            let looked_up = reg.get_tool(&entry.prefixed_name).await.expect("resolvable");
            assert_eq!(looked_up.prefixed_name, entry.prefixed_name);
        }
    }

    #[tokio::test]
    async fn re_register_is_idempotent() {
        let reg = CapabilityRegistry::default();
        let tools = vec![tool("one"), tool("two")];
        reg.register_tools("u", tools.clone()).await;
        reg.register_tools("u", tools).await;

        assert_eq!(reg.counts().await.total_tools, 2);
        assert_eq!(reg.tool_count_for("u").await, 2);
    }

    #[tokio::test]
    async fn replacement_drops_stale_entries() {
        let reg = CapabilityRegistry::default();
        reg.register_tools("u", vec![tool("old")]).await;
        reg.register_tools("u", vec![tool("new")]).await;

        assert!(reg.get_tool("u___old").await.is_none());
        assert!(reg.get_tool("u___new").await.is_some());
    }

    #[tokio::test]
    async fn same_original_name_on_two_upstreams_stays_distinct() {
        let reg = CapabilityRegistry::default();
        reg.register_tools("x", vec![tool("go")]).await;
        reg.register_tools("y", vec![tool("go")]).await;

        assert!(reg.get_tool("x___go").await.is_some());
        assert!(reg.get_tool("y___go").await.is_some());
        assert_eq!(reg.counts().await.total_tools, 2);
    }

    #[tokio::test]
    async fn prefixed_collision_keeps_first_writer() {
        // Names are validated at config load; the registry still defends
        // against ambiguous prefixes: "a" + "b___go" and "a___b" + "go"
        // both render as "a___b___go".
        let reg = CapabilityRegistry::default();
        reg.register_tools("a", vec![tool("b___go")]).await;
        let kept = reg.register_tools("a___b", vec![tool("go")]).await;

        assert_eq!(kept, 0);
        let entry = reg.get_tool("a___b___go").await.expect("first writer");
        assert_eq!(entry.upstream, "a");
        assert_eq!(reg.tool_count_for("a___b").await, 0);
        assert_eq!(reg.tool_count_for("a").await, 1);
    }

    #[tokio::test]
    async fn clear_upstream_purges_all_kinds() {
        let reg = CapabilityRegistry::default();
        reg.register_tools("u", vec![tool("t")]).await;
        reg.register_resources(
            "u",
            vec![Resource {
                uri: "file:///a".to_string(),
                name: "a".to_string(),
                description: None,
                mime_type: None,
            }],
        )
        .await;
        reg.register_prompts(
            "u",
            vec![Prompt {
                name: "p".to_string(),
                description: None,
                arguments: vec![],
            }],
        )
        .await;

        reg.clear_upstream("u").await;

        let counts = reg.counts().await;
        assert_eq!(counts.total_tools, 0);
        assert_eq!(counts.total_resources, 0);
        assert_eq!(counts.total_prompts, 0);
        assert!(reg.all_tools().await.is_empty());
    }

    #[tokio::test]
    async fn resource_uris_are_prefixed() {
        let reg = CapabilityRegistry::default();
        reg.register_resources(
            "files",
            vec![Resource {
                uri: "file:///tmp/report.txt".to_string(),
                name: "report".to_string(),
                description: None,
                mime_type: Some("text/plain".to_string()),
            }],
        )
        .await;

        let entry = reg
            .get_resource("files___file:///tmp/report.txt")
            .await
            .expect("entry");
        assert_eq!(entry.original_uri, "file:///tmp/report.txt");
    }
}
