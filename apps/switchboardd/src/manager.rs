//! Upstream connection manager.
//!
//! Owns the connectors, drives initial connect and discovery, reconciles
//! configuration revisions, and schedules reconnects. Connectors report
//! events over a channel; the manager owns the receiving side, so nothing
//! here holds a reference cycle.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchboard_core::{ProxyConfig, UpstreamConfig};
use switchboard_mcp::{
    ConnectorError, ConnectorEvent, ConnectorOptions, ConnectorStatus, UpstreamConnector,
};

use crate::registry::CapabilityRegistry;

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_initial: Duration,
    /// Backoff ceiling.
    pub reconnect_max: Duration,
    pub connector: ConnectorOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            reconnect_initial: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(60),
            connector: ConnectorOptions::default(),
        }
    }
}

/// Snapshot of one upstream's state, as reported by `/mcp/info`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRecord {
    pub name: String,
    pub transport: &'static str,
    pub status: ConnectorStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

struct UpstreamEntry {
    config: UpstreamConfig,
    connector: Arc<UpstreamConnector>,
    record: UpstreamRecord,
    event_task: JoinHandle<()>,
    consecutive_failures: u32,
}

pub struct UpstreamManager {
    registry: Arc<CapabilityRegistry>,
    upstreams: RwLock<HashMap<String, UpstreamEntry>>,
    reconnects: Mutex<HashMap<String, JoinHandle<()>>>,
    opts: ManagerOptions,
    // Handed to spawned tasks so they never keep the manager alive.
    weak_self: Weak<UpstreamManager>,
}

impl UpstreamManager {
    pub fn new(registry: Arc<CapabilityRegistry>, opts: ManagerOptions) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            upstreams: RwLock::new(HashMap::new()),
            reconnects: Mutex::new(HashMap::new()),
            opts,
            weak_self: weak.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// Connect and discover every configured upstream concurrently, waiting
    /// for all attempts to settle.
    pub async fn initialize_connections(&self, config: &ProxyConfig) {
        let attempts = config
            .upstreams
            .iter()
            .map(|(name, cfg)| self.add_upstream(name, cfg));
        futures_util::future::join_all(attempts).await;

        let connected = self.connected_count().await;
        let total = config.upstreams.len();
        info!(connected, total, "upstream initialization settled");
    }

    /// Reconcile the table against a new configuration revision.
    pub async fn update_connections(&self, new_config: &ProxyConfig) {
        let current: HashMap<String, UpstreamConfig> = {
            let upstreams = self.upstreams.read().await;
            upstreams
                .iter()
                .map(|(name, entry)| (name.clone(), entry.config.clone()))
                .collect()
        };

        let removed: Vec<String> = current
            .keys()
            .filter(|name| !new_config.upstreams.contains_key(*name))
            .cloned()
            .collect();
        let added: Vec<String> = new_config
            .upstreams
            .keys()
            .filter(|name| !current.contains_key(*name))
            .cloned()
            .collect();
        let updated: Vec<String> = new_config
            .upstreams
            .iter()
            .filter(|(name, cfg)| current.get(*name).is_some_and(|old| old != *cfg))
            .map(|(name, _)| name.clone())
            .collect();

        info!(
            added = added.len(),
            removed = removed.len(),
            updated = updated.len(),
            "reconciling upstream configuration"
        );

        for name in &removed {
            self.remove_upstream(name).await;
        }
        for name in &updated {
            self.remove_upstream(name).await;
        }

        let attempts = updated
            .iter()
            .chain(added.iter())
            .map(|name| self.add_upstream(name, &new_config.upstreams[name]));
        futures_util::future::join_all(attempts).await;
    }

    /// Build the connector for one upstream, wire its event loop, and kick
    /// off the first connection attempt.
    pub async fn add_upstream(&self, name: &str, config: &UpstreamConfig) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connector =
            match UpstreamConnector::for_config(name, config, events_tx, self.opts.connector) {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    warn!(upstream = name, error = %e, "failed to build connector");
                    return;
                }
            };

        let event_task = self.spawn_event_loop(name.to_string(), events_rx);
        let entry = UpstreamEntry {
            config: config.clone(),
            connector,
            record: UpstreamRecord {
                name: name.to_string(),
                transport: config.kind(),
                status: ConnectorStatus::Disconnected,
                last_error: None,
                connected_at: None,
                tools: 0,
                resources: 0,
                prompts: 0,
            },
            event_task,
            consecutive_failures: 0,
        };

        if let Some(stale) = self.upstreams.write().await.insert(name.to_string(), entry) {
            stale.event_task.abort();
            stale.connector.disconnect().await;
        }

        self.connect_upstream(name).await;
    }

    /// Connect one upstream and, on success, discover its capabilities into
    /// the registry. Failures mark the record and schedule a reconnect.
    pub fn connect_upstream<'a>(
        &'a self,
        name: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let connector = {
                let mut upstreams = self.upstreams.write().await;
                let Some(entry) = upstreams.get_mut(name) else {
                    return;
                };
                entry.record.status = ConnectorStatus::Connecting;
                entry.connector.clone()
            };

            match connector.connect().await {
                Ok(()) => {
                    {
                        let mut upstreams = self.upstreams.write().await;
                        if let Some(entry) = upstreams.get_mut(name) {
                            entry.record.status = ConnectorStatus::Connected;
                            entry.record.connected_at = Some(Utc::now());
                            entry.record.last_error = None;
                            entry.consecutive_failures = 0;
                        }
                    }
                    self.discover_upstream(name, &connector).await;
                }
                Err(e) => {
                    warn!(upstream = name, error = %e, "upstream connection failed");
                    {
                        let mut upstreams = self.upstreams.write().await;
                        if let Some(entry) = upstreams.get_mut(name) {
                            entry.record.status = ConnectorStatus::Error;
                            entry.record.last_error = Some(e.to_string());
                            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                        }
                    }
                    self.schedule_reconnect(name).await;
                }
            }
        })
    }

    async fn discover_upstream(&self, name: &str, connector: &UpstreamConnector) {
        let caps = connector.discover_capabilities(name).await;
        let errors = caps.errors;

        let tools = self.registry.register_tools(name, caps.tools).await;
        let resources = self.registry.register_resources(name, caps.resources).await;
        let prompts = self.registry.register_prompts(name, caps.prompts).await;

        let mut upstreams = self.upstreams.write().await;
        let Some(entry) = upstreams.get_mut(name) else {
            // Removed while discovery was in flight; drop the results.
            drop(upstreams);
            self.registry.clear_upstream(name).await;
            return;
        };
        entry.record.tools = tools;
        entry.record.resources = resources;
        entry.record.prompts = prompts;
        if !errors.is_empty() {
            let message = format!("capability discovery failed: {}", errors.join("; "));
            warn!(upstream = name, error = %message, "discovery degraded");
            entry.record.last_error = Some(message);
        }
    }

    /// Synchronously tear one upstream down: cancel its reconnect timer,
    /// stop its event loop, disconnect, and purge its capabilities.
    pub async fn remove_upstream(&self, name: &str) {
        if let Some(timer) = self.reconnects.lock().await.remove(name) {
            timer.abort();
        }
        let entry = self.upstreams.write().await.remove(name);
        if let Some(entry) = entry {
            entry.event_task.abort();
            entry.connector.disconnect().await;
            self.registry.clear_upstream(name).await;
            info!(upstream = name, "upstream removed");
        }
    }

    /// Forward a pre-built request to the named upstream.
    pub async fn route_message(
        &self,
        upstream: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let connector = {
            let upstreams = self.upstreams.read().await;
            upstreams
                .get(upstream)
                .ok_or(ConnectorError::NotConnected)?
                .connector
                .clone()
        };
        if !connector.is_connected() {
            return Err(ConnectorError::NotConnected);
        }
        connector.send_request(method, params).await
    }

    /// Cancel every reconnect timer, disconnect all connectors (best
    /// effort), and clear the registry.
    pub async fn shutdown(&self) {
        for (_, timer) in self.reconnects.lock().await.drain() {
            timer.abort();
        }

        let entries: Vec<(String, Arc<UpstreamConnector>)> = {
            let mut upstreams = self.upstreams.write().await;
            upstreams
                .drain()
                .map(|(name, entry)| {
                    entry.event_task.abort();
                    (name, entry.connector)
                })
                .collect()
        };

        let disconnects = entries.iter().map(|(name, connector)| async move {
            connector.disconnect().await;
            debug!(upstream = %name, "disconnected");
        });
        futures_util::future::join_all(disconnects).await;

        self.registry.clear().await;
        info!("upstream manager shut down");
    }

    pub async fn connected_count(&self) -> usize {
        let upstreams = self.upstreams.read().await;
        upstreams
            .values()
            .filter(|e| e.record.status == ConnectorStatus::Connected)
            .count()
    }

    pub async fn records(&self) -> Vec<UpstreamRecord> {
        let upstreams = self.upstreams.read().await;
        let mut records: Vec<UpstreamRecord> =
            upstreams.values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.upstreams.read().await.contains_key(name)
    }

    fn spawn_event_loop(
        &self,
        name: String,
        mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
    ) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(mgr) = weak.upgrade() else {
                    break;
                };
                mgr.handle_connector_event(&name, event).await;
            }
        })
    }

    async fn handle_connector_event(&self, name: &str, event: ConnectorEvent) {
        match event {
            ConnectorEvent::Connected => {
                debug!(upstream = name, "connector reported connected");
            }
            ConnectorEvent::StatusChanged { status } => {
                debug!(upstream = name, status = %status, "connector status changed");
            }
            ConnectorEvent::Disconnected { reason } => {
                self.mark_down(name, ConnectorStatus::Disconnected, reason)
                    .await;
            }
            ConnectorEvent::Error { message } => {
                self.mark_down(name, ConnectorStatus::Error, message).await;
            }
            ConnectorEvent::Notification(n) => {
                info!(upstream = name, method = %n.method, "upstream notification");
                if n.method.ends_with("list_changed") {
                    self.rediscover(name).await;
                }
            }
        }
    }

    /// Shared handling for disconnect and error events: purge capabilities
    /// before the status change is observable, then schedule a reconnect.
    async fn mark_down(&self, name: &str, status: ConnectorStatus, reason: String) {
        warn!(upstream = name, status = %status, reason = %reason, "upstream down");
        self.registry.clear_upstream(name).await;
        {
            let mut upstreams = self.upstreams.write().await;
            let Some(entry) = upstreams.get_mut(name) else {
                return;
            };
            entry.record.status = status;
            entry.record.last_error = Some(reason);
            entry.record.connected_at = None;
            entry.record.tools = 0;
            entry.record.resources = 0;
            entry.record.prompts = 0;
            entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        }
        self.schedule_reconnect(name).await;
    }

    /// Re-run discovery on a live upstream (used for `*/list_changed`).
    async fn rediscover(&self, name: &str) {
        let connector = {
            let upstreams = self.upstreams.read().await;
            match upstreams.get(name) {
                Some(entry) => entry.connector.clone(),
                None => return,
            }
        };
        if connector.is_connected() {
            self.discover_upstream(name, &connector).await;
        }
    }

    /// Arm the per-upstream reconnect timer. A no-op while one is already
    /// pending. The timer re-checks that the upstream still exists before
    /// attempting anything, so a race with removal drops silently.
    async fn schedule_reconnect(&self, name: &str) {
        let mut timers = self.reconnects.lock().await;
        if let Some(existing) = timers.get(name)
            && !existing.is_finished()
        {
            return;
        }

        let failures = {
            let upstreams = self.upstreams.read().await;
            match upstreams.get(name) {
                Some(entry) => entry.consecutive_failures,
                None => return,
            }
        };
        let delay = self.backoff_delay(failures);
        debug!(upstream = name, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let weak = self.weak_self.clone();
        let key = name.to_string();
        let task_name = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(mgr) = weak.upgrade() else {
                return;
            };
            mgr.reconnects.lock().await.remove(&task_name);
            if !mgr.contains(&task_name).await {
                return;
            }
            // Discovery state from the previous connection must be gone
            // before the attempt.
            mgr.registry.clear_upstream(&task_name).await;
            mgr.connect_upstream(&task_name).await;
        });
        timers.insert(key, handle);
    }

    fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(6);
        let delay = self.opts.reconnect_initial * 2u32.pow(exp);
        delay.min(self.opts.reconnect_max)
    }
}
