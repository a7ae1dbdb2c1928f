//! Upstream connector surface shared by every transport.
//!
//! Each connector speaks MCP JSON-RPC to one upstream server. The manager
//! owns the connector and the receiving end of its event channel; connectors
//! never hold a reference back to the manager.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, warn};

use switchboard_core::{HttpUpstream, UpstreamConfig};

use crate::http_client::HttpConnector;
use crate::jsonrpc::{JsonRpcId, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::sse_client::SseConnector;
use crate::stdio_client::StdioConnector;
use crate::types::InitializeParams;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for each transport-detection probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Events a connector reports to its owner.
#[derive(Debug)]
pub enum ConnectorEvent {
    Connected,
    Disconnected { reason: String },
    Error { message: String },
    StatusChanged { status: ConnectorStatus },
    Notification(JsonRpcNotification),
}

pub type EventSender = mpsc::UnboundedSender<ConnectorEvent>;

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("upstream is not connected")]
    NotConnected,

    #[error("could not detect a supported transport")]
    UnknownTransport,

    #[error("failed to spawn upstream process: {0}")]
    Spawn(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream returned error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Options shared by every connector.
#[derive(Debug, Clone, Copy)]
pub struct ConnectorOptions {
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

/// Shared request/response machinery: monotone ids, the in-flight map, the
/// status machine, and the event channel.
pub struct ConnectorCore {
    name: String,
    next_id: AtomicU64,
    pending: tokio::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>,
    status: Mutex<ConnectorStatus>,
    events: EventSender,
    pub request_timeout: Duration,
}

impl ConnectorCore {
    pub fn new(name: &str, events: EventSender, request_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            next_id: AtomicU64::new(1),
            pending: tokio::sync::Mutex::new(HashMap::new()),
            status: Mutex::new(ConnectorStatus::Disconnected),
            events,
            request_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn status(&self) -> ConnectorStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectorStatus::Connected
    }

    /// Transition the status machine, emitting `StatusChanged` when the
    /// status actually changes.
    pub fn set_status(&self, status: ConnectorStatus) {
        let changed = {
            let mut guard = self.status.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *guard != status;
            *guard = status;
            changed
        };
        if changed {
            debug!(upstream = %self.name, status = %status, "connector status changed");
            self.emit(ConnectorEvent::StatusChanged { status });
        }
    }

    pub fn emit(&self, event: ConnectorEvent) {
        // The receiver disappears when the manager drops this upstream;
        // nothing left to notify then.
        let _ = self.events.send(event);
    }

    /// Register an in-flight request id and hand back its completion handle.
    pub async fn register(&self, id: u64) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);
        rx
    }

    /// Complete the in-flight request matching the response id, if any.
    pub async fn complete(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_number() else {
            debug!(upstream = %self.name, "response with non-numeric id ignored");
            return;
        };
        let tx = self.pending.lock().await.remove(&id);
        match tx {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                debug!(upstream = %self.name, id, "response for unknown request id");
            }
        }
    }

    /// Drop a single in-flight entry (e.g. after a failed write).
    pub async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
    }

    /// Drop every in-flight handle; awaiting callers observe
    /// [`ConnectorError::ConnectionClosed`].
    pub async fn fail_all_pending(&self) {
        let mut pending = self.pending.lock().await;
        if !pending.is_empty() {
            debug!(
                upstream = %self.name,
                count = pending.len(),
                "failing in-flight requests"
            );
        }
        pending.clear();
    }

    /// Await a registered response with the per-request deadline. On timeout
    /// the pending entry is removed before the error is returned.
    pub async fn await_response(
        &self,
        id: u64,
        rx: oneshot::Receiver<JsonRpcResponse>,
    ) -> Result<JsonRpcResponse, ConnectorError> {
        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ConnectorError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(upstream = %self.name, id, "request timed out");
                Err(ConnectorError::Timeout)
            }
        }
    }
}

/// Unwrap a JSON-RPC response into its result value.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, ConnectorError> {
    if let Some(err) = response.error {
        return Err(ConnectorError::Rpc {
            code: err.code,
            message: err.message,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

/// One upstream connection, whatever the transport.
pub enum UpstreamConnector {
    Stdio(StdioConnector),
    Sse(SseConnector),
    StreamableHttp(HttpConnector),
    Auto(AutoConnector),
}

impl UpstreamConnector {
    /// Build the connector matching a validated upstream config.
    ///
    /// `sse` entries go through the auto-detecting connector so servers that
    /// have migrated to streamable HTTP keep working.
    pub fn for_config(
        name: &str,
        config: &UpstreamConfig,
        events: EventSender,
        opts: ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        match config {
            UpstreamConfig::Stdio(c) => Ok(Self::Stdio(StdioConnector::new(
                name,
                c.clone(),
                events,
                opts,
            ))),
            UpstreamConfig::Sse(c) | UpstreamConfig::Auto(c) => Ok(Self::Auto(
                AutoConnector::new(name, c.clone(), events, opts),
            )),
            UpstreamConfig::StreamableHttp(c) => Ok(Self::StreamableHttp(HttpConnector::new(
                name,
                c.clone(),
                events,
                opts,
            )?)),
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectorError> {
        match self {
            Self::Stdio(c) => c.connect().await,
            Self::Sse(c) => c.connect().await,
            Self::StreamableHttp(c) => c.connect().await,
            Self::Auto(c) => c.connect().await,
        }
    }

    pub async fn disconnect(&self) {
        match self {
            Self::Stdio(c) => c.disconnect().await,
            Self::Sse(c) => c.disconnect().await,
            Self::StreamableHttp(c) => c.disconnect().await,
            Self::Auto(c) => c.disconnect().await,
        }
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        match self {
            Self::Stdio(c) => c.send_request(method, params).await,
            Self::Sse(c) => c.send_request(method, params).await,
            Self::StreamableHttp(c) => c.send_request(method, params).await,
            Self::Auto(c) => c.send_request(method, params).await,
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectorError> {
        match self {
            Self::Stdio(c) => c.send_notification(method, params).await,
            Self::Sse(c) => c.send_notification(method, params).await,
            Self::StreamableHttp(c) => c.send_notification(method, params).await,
            Self::Auto(c) => c.send_notification(method, params).await,
        }
    }

    /// Issue the three list calls concurrently and collect what the
    /// upstream advertises. Never fails as a whole: each category degrades
    /// to empty independently.
    pub async fn discover_capabilities(&self, upstream: &str) -> crate::DiscoveredCapabilities {
        crate::discovery::discover_capabilities(self, upstream).await
    }

    pub fn status(&self) -> ConnectorStatus {
        match self {
            Self::Stdio(c) => c.status(),
            Self::Sse(c) => c.status(),
            Self::StreamableHttp(c) => c.status(),
            Self::Auto(c) => c.status(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectorStatus::Connected
    }
}

enum DetectedConnector {
    Sse(SseConnector),
    StreamableHttp(HttpConnector),
}

/// Connector for url-bearing upstreams with no transport tag. Each
/// `connect()` probes streamable HTTP first, then SSE, and delegates to the
/// winning concrete connector until the next disconnect.
pub struct AutoConnector {
    name: String,
    config: HttpUpstream,
    opts: ConnectorOptions,
    events: EventSender,
    inner: RwLock<Option<DetectedConnector>>,
}

impl AutoConnector {
    pub fn new(
        name: &str,
        config: HttpUpstream,
        events: EventSender,
        opts: ConnectorOptions,
    ) -> Self {
        Self {
            name: name.to_string(),
            config,
            opts,
            events,
            inner: RwLock::new(None),
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectorError> {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.as_ref()
            && detected_status(existing) == ConnectorStatus::Connected
        {
            return Ok(());
        }
        *inner = None;

        let detected = self.probe().await?;
        let connector = match detected {
            ProbedTransport::StreamableHttp => {
                let c = HttpConnector::new(
                    &self.name,
                    self.config.clone(),
                    self.events.clone(),
                    self.opts,
                )?;
                c.connect().await?;
                DetectedConnector::StreamableHttp(c)
            }
            ProbedTransport::Sse => {
                let c = SseConnector::new(
                    &self.name,
                    self.config.clone(),
                    self.events.clone(),
                    self.opts,
                )?;
                c.connect().await?;
                DetectedConnector::Sse(c)
            }
        };
        *inner = Some(connector);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut inner = self.inner.write().await;
        if let Some(detected) = inner.take() {
            match detected {
                DetectedConnector::Sse(c) => c.disconnect().await,
                DetectedConnector::StreamableHttp(c) => c.disconnect().await,
            }
        }
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(DetectedConnector::Sse(c)) => c.send_request(method, params).await,
            Some(DetectedConnector::StreamableHttp(c)) => c.send_request(method, params).await,
            None => Err(ConnectorError::NotConnected),
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectorError> {
        let inner = self.inner.read().await;
        match inner.as_ref() {
            Some(DetectedConnector::Sse(c)) => c.send_notification(method, params).await,
            Some(DetectedConnector::StreamableHttp(c)) => c.send_notification(method, params).await,
            None => Err(ConnectorError::NotConnected),
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        match self.inner.try_read() {
            Ok(inner) => inner
                .as_ref()
                .map(detected_status)
                .unwrap_or(ConnectorStatus::Disconnected),
            Err(_) => ConnectorStatus::Connecting,
        }
    }

    /// Probe the endpoint once. Probe responses are dropped immediately so a
    /// failed detection never leaves a half-open connection behind.
    async fn probe(&self) -> Result<ProbedTransport, ConnectorError> {
        let client = reqwest::Client::builder()
            .timeout(self.opts.probe_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConnectorError::Transport(e.to_string()))?;

        let init = InitializeParams::new_default("switchboard", env!("CARGO_PKG_VERSION"));
        let probe_req = JsonRpcRequest::new(
            JsonRpcId::Number(0),
            "initialize",
            serde_json::to_value(init).ok(),
        );

        let mut post = client
            .post(self.config.url.clone())
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
            .json(&probe_req);
        for (k, v) in &self.config.headers {
            post = post.header(k, v);
        }
        if let Ok(resp) = post.send().await
            && resp.status().is_success()
        {
            debug!(upstream = %self.name, "detected streamable-http transport");
            return Ok(ProbedTransport::StreamableHttp);
        }

        let mut get = client
            .get(self.config.url.clone())
            .header("accept", "text/event-stream");
        for (k, v) in &self.config.headers {
            get = get.header(k, v);
        }
        if let Ok(resp) = get.send().await {
            let is_sse = resp.status().is_success()
                && resp
                    .headers()
                    .get(http::header::CONTENT_TYPE)
                    .and_then(|h| h.to_str().ok())
                    .map(|ct| ct.starts_with("text/event-stream"))
                    .unwrap_or(false);
            if is_sse {
                debug!(upstream = %self.name, "detected sse transport");
                return Ok(ProbedTransport::Sse);
            }
        }

        warn!(upstream = %self.name, url = %self.config.url, "transport detection failed");
        Err(ConnectorError::UnknownTransport)
    }
}

fn detected_status(detected: &DetectedConnector) -> ConnectorStatus {
    match detected {
        DetectedConnector::Sse(c) => c.status(),
        DetectedConnector::StreamableHttp(c) => c.status(),
    }
}

enum ProbedTransport {
    Sse,
    StreamableHttp,
}
