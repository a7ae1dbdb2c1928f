//! Downstream session table.
//!
//! Each session owns one [`McpConnection`] bound to the shared handler set.
//! Sessions are created by `initialize`, touched on every request, and
//! evicted by a background sweep once idle past the timeout. Eviction only
//! discards the handler binding; upstream state is untouched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use switchboard_mcp::{JsonRpcMessage, JsonRpcResponse, McpConnection};

/// Sessions idle longer than this are evicted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How often the eviction sweep runs.
pub const DEFAULT_EVICTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, thiserror::Error)]
#[error("unknown session id")]
pub struct UnknownSession;

struct SessionEntry {
    conn: McpConnection,
    last_activity: Instant,
}

pub struct SessionTable {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    idle_timeout: Duration,
}

impl SessionTable {
    pub fn new(idle_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        })
    }

    /// Create a session around a fresh connection and feed it its first
    /// message. Returns the new session id and the response.
    pub async fn create_with(
        &self,
        conn: McpConnection,
        first_message: JsonRpcMessage,
    ) -> (String, Option<JsonRpcResponse>) {
        let id = Uuid::new_v4().to_string();
        let mut entry = SessionEntry {
            conn,
            last_activity: Instant::now(),
        };
        let response = entry.conn.handle_message(first_message).await;
        self.sessions.lock().await.insert(id.clone(), entry);
        debug!(session = %id, "session created");
        (id, response)
    }

    /// Dispatch a message on an existing session, refreshing its activity
    /// timestamp. Requests on one session are serialized in arrival order.
    pub async fn dispatch(
        &self,
        session_id: &str,
        message: JsonRpcMessage,
    ) -> Result<Option<JsonRpcResponse>, UnknownSession> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.get_mut(session_id).ok_or(UnknownSession)?;
        entry.last_activity = Instant::now();
        Ok(entry.conn.handle_message(message).await)
    }

    /// Remove sessions idle past the timeout. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_activity.elapsed() < self.idle_timeout);
        let evicted = before - sessions.len();
        if evicted > 0 {
            info!(evicted, remaining = sessions.len(), "evicted idle sessions");
        }
        evicted
    }

    pub fn spawn_eviction_loop(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        let table = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(table) = table.upgrade() else {
                    break;
                };
                table.evict_idle().await;
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    #[cfg(test)]
    async fn backdate(&self, session_id: &str, age: Duration) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_activity = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use switchboard_mcp::{
        CallToolParams, GetPromptParams, HandlerError, JsonRpcId, JsonRpcRequest,
        ListPromptsResult, ListResourcesResult, ListToolsResult, McpHandler, McpServerConfig,
        ReadResourceParams,
    };

    struct NullHandler;

    #[async_trait]
    impl McpHandler for NullHandler {
        async fn list_tools(&self) -> Result<ListToolsResult, HandlerError> {
            Ok(ListToolsResult {
                tools: vec![],
                next_cursor: None,
            })
        }
        async fn call_tool(&self, _: CallToolParams) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
        async fn list_resources(&self) -> Result<ListResourcesResult, HandlerError> {
            Ok(ListResourcesResult {
                resources: vec![],
                next_cursor: None,
            })
        }
        async fn read_resource(&self, _: ReadResourceParams) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
        async fn list_prompts(&self) -> Result<ListPromptsResult, HandlerError> {
            Ok(ListPromptsResult {
                prompts: vec![],
                next_cursor: None,
            })
        }
        async fn get_prompt(&self, _: GetPromptParams) -> Result<Value, HandlerError> {
            Ok(Value::Null)
        }
    }

    fn new_conn() -> McpConnection {
        McpConnection::new(
            McpServerConfig::default_for_binary("test", "0.0.0"),
            Arc::new(NullHandler),
        )
    }

    fn ping(id: u64) -> JsonRpcMessage {
        JsonRpcMessage::Request(JsonRpcRequest::new(JsonRpcId::Number(id), "ping", None))
    }

    #[tokio::test]
    async fn create_and_dispatch() {
        let table = SessionTable::new(DEFAULT_IDLE_TIMEOUT);
        let (id, resp) = table.create_with(new_conn(), ping(1)).await;
        assert!(resp.expect("response").error.is_none());

        let resp = table.dispatch(&id, ping(2)).await.expect("known session");
        assert!(resp.expect("response").error.is_none());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_session_is_rejected() {
        let table = SessionTable::new(DEFAULT_IDLE_TIMEOUT);
        assert!(table.dispatch("missing", ping(1)).await.is_err());
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted_and_active_ones_kept() {
        let table = SessionTable::new(Duration::from_secs(60));
        let (idle, _) = table.create_with(new_conn(), ping(1)).await;
        let (active, _) = table.create_with(new_conn(), ping(1)).await;
        table.backdate(&idle, Duration::from_secs(120)).await;

        let evicted = table.evict_idle().await;

        assert_eq!(evicted, 1);
        assert!(table.dispatch(&idle, ping(2)).await.is_err());
        assert!(table.dispatch(&active, ping(2)).await.is_ok());
    }

    #[tokio::test]
    async fn touch_resets_the_idle_clock() {
        let table = SessionTable::new(Duration::from_secs(60));
        let (id, _) = table.create_with(new_conn(), ping(1)).await;
        table.backdate(&id, Duration::from_secs(59)).await;
        table.dispatch(&id, ping(2)).await.expect("still alive");

        assert_eq!(table.evict_idle().await, 0);
    }
}
