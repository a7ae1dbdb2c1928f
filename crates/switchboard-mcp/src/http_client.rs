//! Streamable-HTTP connector.
//!
//! A single endpoint accepts POSTed JSON-RPC messages; responses come back
//! as `application/json` or as a short `text/event-stream` body. The
//! `mcp-session-id` response header is captured once and echoed on every
//! subsequent request.

use std::sync::{Arc, Mutex};

use http::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, info};

use switchboard_core::HttpUpstream;

use crate::PROTOCOL_VERSION_LATEST;
use crate::connector::{
    ConnectorCore, ConnectorError, ConnectorEvent, ConnectorOptions, ConnectorStatus, EventSender,
    extract_result,
};
use crate::jsonrpc::{JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use crate::sse::parse_first_json_message_from_sse;
use crate::types::{InitializeParams, InitializeResult};

pub struct HttpConnector {
    core: Arc<ConnectorCore>,
    config: HttpUpstream,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<String>,
}

impl HttpConnector {
    pub fn new(
        name: &str,
        config: HttpUpstream,
        events: EventSender,
        opts: ConnectorOptions,
    ) -> Result<Self, ConnectorError> {
        let http = reqwest::Client::builder()
            .timeout(opts.request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ConnectorError::Transport(format!("build http client: {e}")))?;
        Ok(Self {
            core: Arc::new(ConnectorCore::new(name, events, opts.request_timeout)),
            config,
            http,
            session_id: Mutex::new(None),
            protocol_version: Mutex::new(PROTOCOL_VERSION_LATEST.to_string()),
        })
    }

    pub fn status(&self) -> ConnectorStatus {
        self.core.status()
    }

    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub async fn connect(&self) -> Result<(), ConnectorError> {
        self.core.set_status(ConnectorStatus::Connecting);
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;

        match self.handshake().await {
            Ok(init) => {
                info!(
                    upstream = %self.core.name(),
                    server = %init.server_info.name,
                    version = %init.protocol_version,
                    "streamable-http upstream initialized"
                );
                *self
                    .protocol_version
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = init.protocol_version;
                self.core.set_status(ConnectorStatus::Connected);
                self.core.emit(ConnectorEvent::Connected);
                Ok(())
            }
            Err(e) => {
                self.core.set_status(ConnectorStatus::Error);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        self.core.fail_all_pending().await;
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.core.set_status(ConnectorStatus::Disconnected);
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let id = self.core.next_id();
        let request = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);

        let value = match self.post_message(&request).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                return Err(ConnectorError::Transport(
                    "server accepted the request without a response".to_string(),
                ));
            }
            Err(e) => {
                self.report_transport_failure(&e);
                return Err(e);
            }
        };

        let message: JsonRpcMessage = serde_json::from_value(value)
            .map_err(|e| ConnectorError::Transport(format!("parse json-rpc: {e}")))?;
        let JsonRpcMessage::Response(response) = message else {
            return Err(ConnectorError::Transport(
                "expected a json-rpc response".to_string(),
            ));
        };
        if response.id.as_number() != Some(id) {
            return Err(ConnectorError::Transport(format!(
                "response id mismatch (sent {id})"
            )));
        }
        extract_result(response)
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ConnectorError> {
        let notification = JsonRpcNotification::new(method, params);
        self.post_message(&notification).await.map(|_| ())
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

    /// POST one JSON-RPC message. Returns `Ok(None)` for 202-accepted
    /// notifications, otherwise the decoded response body.
    async fn post_message<T: serde::Serialize>(
        &self,
        message: &T,
    ) -> Result<Option<Value>, ConnectorError> {
        let protocol_version = self
            .protocol_version
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut req = self
            .http
            .post(self.config.url.clone())
            .header("accept", "application/json, text/event-stream")
            .header("content-type", "application/json")
            .header("mcp-protocol-version", protocol_version)
            .json(message);
        for (k, v) in &self.config.headers {
            req = req.header(k, v);
        }
        if let Some(sid) = self.session_id() {
            req = req.header("mcp-session-id", sid);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ConnectorError::Timeout
            } else {
                ConnectorError::Transport(format!("send request: {e}"))
            }
        })?;

        let status = resp.status();
        if let Some(sid) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|h| h.to_str().ok())
        {
            *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(sid.to_string());
        }

        if status == StatusCode::ACCEPTED {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ConnectorError::Transport(format!("http status {status}")));
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = resp
            .text()
            .await
            .map_err(|e| ConnectorError::Transport(format!("read response body: {e}")))?;
        debug!(upstream = %self.core.name(), content_type = %content_type, "mcp http response");

        if body.is_empty() {
            return Ok(None);
        }
        let value = if content_type.starts_with("text/event-stream") {
            parse_first_json_message_from_sse(&body)
                .map_err(|e| ConnectorError::Transport(e.to_string()))?
        } else {
            serde_json::from_str::<Value>(&body)
                .map_err(|e| ConnectorError::Transport(format!("parse application/json: {e}")))?
        };
        Ok(Some(value))
    }

    /// An established connection that stops responding is reported so the
    /// owner can purge capabilities and schedule a reconnect.
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
