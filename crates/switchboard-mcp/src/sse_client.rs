//! SSE connector.
//!
//! The handshake opens a long-lived GET stream; the server's `endpoint`
//! event names the paired POST URL. Requests are POSTed there and their
//! responses arrive as `message` events on the stream, correlated by id
//! through the shared pending map.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use switchboard_core::HttpUpstream;

use crate::connector::{
    ConnectorCore, ConnectorError, ConnectorEvent, ConnectorOptions, ConnectorStatus, EventSender,
    extract_result,
};
use crate::jsonrpc::{JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use crate::sse::{SseDecoder, SseEvent};
use crate::types::{InitializeParams, InitializeResult};

pub struct SseConnector {
    core: Arc<ConnectorCore>,
    config: HttpUpstream,
    http: reqwest::Client,
    request_timeout: std::time::Duration,
    link: Mutex<Option<SseLink>>,
}

struct SseLink {
    post_url: Url,
    stream_task: JoinHandle<()>,
}

impl SseConnector {
    pub fn new(
        name: &str,
        config: HttpUpstream,
        events: EventSender,
        opts: ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        // No client-level timeout: the GET stream stays open for the life of
        // the connection. POSTs get a per-request deadline instead.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConnectorError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            core: Arc::new(ConnectorCore::new(name, events, opts.request_timeout)),
            config,
            http,
            request_timeout: opts.request_timeout,
            link: Mutex::new(None),
        })
    }

    pub fn status(&self) -> ConnectorStatus {
        self.core.status()
    }

    pub async fn connect(&self) -> Result<(), ConnectorError> {
        {
            let mut link = self.link.lock().await;
            if let Some(stale) = link.take() {
                stale.stream_task.abort();
            }
            self.core.set_status(ConnectorStatus::Connecting);

            match self.open_stream().await {
                Ok(new_link) => *link = Some(new_link),
                Err(e) => {
                    self.core.set_status(ConnectorStatus::Error);
                    return Err(e);
                }
            }
        }

        match self.handshake().await {
            Ok(init) => {
                info!(
                    upstream = %self.core.name(),
                    server = %init.server_info.name,
                    version = %init.protocol_version,
                    "sse upstream initialized"
                );
                self.core.set_status(ConnectorStatus::Connected);
                self.core.emit(ConnectorEvent::Connected);
                Ok(())
            }
            Err(e) => {
                let mut link = self.link.lock().await;
                if let Some(stale) = link.take() {
                    stale.stream_task.abort();
                }
                self.core.fail_all_pending().await;
                self.core.set_status(ConnectorStatus::Error);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        let taken = self.link.lock().await.take();
        if let Some(link) = taken {
            link.stream_task.abort();
        }
        self.core.fail_all_pending().await;
        self.core.set_status(ConnectorStatus::Disconnected);
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let post_url = {
            let link = self.link.lock().await;
            link.as_ref()
                .ok_or(ConnectorError::NotConnected)?
                .post_url
                .clone()
        };

        let id = self.core.next_id();
        let rx = self.core.register(id).await;
        let request = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);

        if let Err(e) = self.post(&post_url, &request).await {
            self.core.forget(id).await;
            self.report_transport_failure(&e);
            return Err(e);
        }

        let response = self.core.await_response(id, rx).await?;
        extract_result(response)
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectorError> {
        let post_url = {
            let link = self.link.lock().await;
            link.as_ref()
                .ok_or(ConnectorError::NotConnected)?
                .post_url
                .clone()
        };
        self.post(&post_url, &JsonRpcNotification::new(method, params))
            .await
    }

    /// GET the event stream, wait for the `endpoint` handshake event, and
    /// hand the remaining stream to a background reader task.
    async fn open_stream(&self) -> Result<SseLink, ConnectorError> {
        let mut req = self
            .http
            .get(self.config.url.clone())
            .header("accept", "text/event-stream");
        for (k, v) in &self.config.headers {
            req = req.header(k, v);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ConnectorError::Transport(format!("open sse stream: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ConnectorError::Transport(format!("http status {status}")));
        }
        let content_type = resp
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("text/event-stream") {
            return Err(ConnectorError::Transport(format!(
                "unexpected content-type: {content_type}"
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut utf8 = Utf8ChunkBuffer::default();

        let endpoint = tokio::time::timeout(self.request_timeout, async {
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| ConnectorError::Transport(format!("sse stream: {e}")))?;
                for event in decoder.feed(&utf8.push(&chunk)) {
                    if event.event.as_deref() == Some("endpoint") {
                        return Ok(event.data);
                    }
                    handle_stream_event(&self.core, event).await;
                }
            }
            Err(ConnectorError::Transport(
                "sse stream ended before the endpoint event".to_string(),
            ))
        })
        .await
        .map_err(|_| ConnectorError::Timeout)??;

        let post_url = self
            .config
            .url
            .join(&endpoint)
            .map_err(|e| ConnectorError::Transport(format!("bad endpoint url: {e}")))?;
        debug!(upstream = %self.core.name(), post_url = %post_url, "sse endpoint established");

        let core = self.core.clone();
        let stream_task = tokio::spawn(async move {
            let mut stream = stream;
            let reason = loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        for event in decoder.feed(&utf8.push(&chunk)) {
                            handle_stream_event(&core, event).await;
                        }
                    }
                    Some(Err(e)) => break format!("sse stream error: {e}"),
                    None => break "sse stream closed".to_string(),
                }
            };
            warn!(upstream = %core.name(), reason = %reason, "sse upstream disconnected");
            core.fail_all_pending().await;
            core.set_status(ConnectorStatus::Disconnected);
            core.emit(ConnectorEvent::Disconnected { reason });
        });

        Ok(SseLink {
            post_url,
            stream_task,
        })
    }

    async fn handshake(&self) -> Result<InitializeResult, ConnectorError> {
        let params = InitializeParams::new_default("switchboard", env!("CARGO_PKG_VERSION"));
        let result = self
            .send_request("initialize", serde_json::to_value(params).ok())
            .await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ConnectorError::Transport(format!("bad initialize result: {e}")))?;
        self.send_notification("notifications/initialized", None)
            .await?;
        Ok(init)
    }

    async fn post<T: serde::Serialize>(
        &self,
        post_url: &Url,
        message: &T,
    ) -> Result<(), ConnectorError> {
        let mut req = self
            .http
            .post(post_url.clone())
            .timeout(self.request_timeout)
            .header("content-type", "application/json")
            .json(message);
        for (k, v) in &self.config.headers {
            req = req.header(k, v);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout
            } else {
                ConnectorError::Transport(format!("post message: {e}"))
            }
        })?;
        if !resp.status().is_success() {
            return Err(ConnectorError::Transport(format!(
                "http status {}",
                resp.status()
            )));
        }
        Ok(())
    }

    fn report_transport_failure(&self, err: &ConnectorError) {
        if !self.core.is_connected() {
            return;
        }
        if matches!(err, ConnectorError::Transport(_) | ConnectorError::Timeout) {
            self.core.set_status(ConnectorStatus::Error);
            self.core.emit(ConnectorEvent::Error {
                message: err.to_string(),
            });
        }
    }
}

async fn handle_stream_event(core: &Arc<ConnectorCore>, event: SseEvent) {
    match event.event.as_deref() {
        None | Some("message") => match serde_json::from_str::<JsonRpcMessage>(&event.data) {
            Ok(JsonRpcMessage::Response(resp)) => {
                core.complete(resp).await;
            }
            Ok(JsonRpcMessage::Notification(n)) => {
                core.emit(ConnectorEvent::Notification(n));
            }
            Ok(JsonRpcMessage::Request(req)) => {
                debug!(
                    upstream = %core.name(),
                    method = %req.method,
                    "ignoring server-initiated request"
                );
            }
            Err(e) => {
                debug!(upstream = %core.name(), error = %e, "undecodable sse message event");
            }
        },
        Some(other) => {
            debug!(upstream = %core.name(), event = %other, "ignoring sse event");
        }
    }
}

/// Accumulates raw bytes and yields only complete UTF-8 prefixes, so a
/// multi-byte character split across chunk boundaries survives decoding.
#[derive(Debug, Default)]
struct Utf8ChunkBuffer {
    partial: Vec<u8>,
}

impl Utf8ChunkBuffer {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.partial.extend_from_slice(chunk);
        match std::str::from_utf8(&self.partial) {
            Ok(s) => {
                let out = s.to_string();
                self.partial.clear();
                out
            }
            Err(e) => {
                let valid = e.valid_up_to();
                let out = String::from_utf8_lossy(&self.partial[..valid]).into_owned();
                self.partial.drain(..valid);
                out
            }
        }
    }
}
