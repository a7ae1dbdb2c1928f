//! Child-process (stdio) connector.
//!
//! Spawns the configured command and frames JSON-RPC messages line-delimited
//! over the child's stdin/stdout. Stderr lines are forwarded to the log
//! sink. Process exit surfaces as a `Disconnected` event carrying the exit
//! status.

use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use switchboard_core::StdioUpstream;

use crate::connector::{
    ConnectorCore, ConnectorError, ConnectorEvent, ConnectorOptions, ConnectorStatus, EventSender,
    extract_result,
};
use crate::jsonrpc::{JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use crate::types::{InitializeParams, InitializeResult};

pub struct StdioConnector {
    core: Arc<ConnectorCore>,
    config: StdioUpstream,
    link: Mutex<Option<StdioLink>>,
}

struct StdioLink {
    writer: Arc<Mutex<ChildStdin>>,
    kill_tx: oneshot::Sender<()>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl StdioConnector {
    pub fn new(
        name: &str,
        config: StdioUpstream,
        events: EventSender,
        opts: ConnectorOptions,
    ) -> Self {
        Self {
            core: Arc::new(ConnectorCore::new(name, events, opts.request_timeout)),
            config,
            link: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectorStatus {
        self.core.status()
    }

    pub async fn connect(&self) -> Result<(), ConnectorError> {
        {
            let mut link = self.link.lock().await;
            if let Some(stale) = link.take() {
                teardown(stale, &self.core).await;
            }

            self.core.set_status(ConnectorStatus::Connecting);

            let mut cmd = Command::new(&self.config.command);
            cmd.args(&self.config.args)
                .envs(&self.config.env)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(cwd) = &self.config.cwd {
                cmd.current_dir(cwd);
            }

            let mut child = cmd.spawn().map_err(|e| {
                self.core.set_status(ConnectorStatus::Error);
                ConnectorError::Spawn(format!("'{}': {e}", self.config.command))
            })?;

            let stdin = child.stdin.take().ok_or_else(|| {
                self.core.set_status(ConnectorStatus::Error);
                ConnectorError::Spawn("stdin not captured".to_string())
            })?;
            let stdout = child.stdout.take().ok_or_else(|| {
                self.core.set_status(ConnectorStatus::Error);
                ConnectorError::Spawn("stdout not captured".to_string())
            })?;
            let stderr = child.stderr.take();

            let reader_task = spawn_reader(self.core.clone(), stdout);
            let stderr_task = stderr.map(|s| spawn_stderr_forwarder(self.core.clone(), s));
            let (kill_tx, kill_rx) = oneshot::channel();
            spawn_exit_watcher(self.core.clone(), child, kill_rx);

            let mut io_tasks = vec![reader_task];
            io_tasks.extend(stderr_task);
            *link = Some(StdioLink {
                writer: Arc::new(Mutex::new(stdin)),
                kill_tx,
                io_tasks,
            });
        }

        match self.handshake().await {
            Ok(init) => {
                info!(
                    upstream = %self.core.name(),
                    server = %init.server_info.name,
                    version = %init.protocol_version,
                    "stdio upstream initialized"
                );
                self.core.set_status(ConnectorStatus::Connected);
                self.core.emit(ConnectorEvent::Connected);
                Ok(())
            }
            Err(e) => {
                let mut link = self.link.lock().await;
                if let Some(stale) = link.take() {
                    teardown(stale, &self.core).await;
                }
                self.core.set_status(ConnectorStatus::Error);
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        let taken = self.link.lock().await.take();
        if let Some(link) = taken {
            teardown(link, &self.core).await;
        }
        self.core.set_status(ConnectorStatus::Disconnected);
    }

    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ConnectorError> {
        let writer = {
            let link = self.link.lock().await;
            link.as_ref()
                .ok_or(ConnectorError::NotConnected)?
                .writer
                .clone()
        };

        let id = self.core.next_id();
        let rx = self.core.register(id).await;
        let request = JsonRpcRequest::new(JsonRpcId::Number(id), method, params);

        if let Err(e) = write_line(&writer, &request).await {
            self.core.forget(id).await;
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
        let writer = {
            let link = self.link.lock().await;
            link.as_ref()
                .ok_or(ConnectorError::NotConnected)?
                .writer
                .clone()
        };
        write_line(&writer, &JsonRpcNotification::new(method, params)).await
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
}

async fn write_line<T: serde::Serialize>(
    writer: &Arc<Mutex<ChildStdin>>,
    message: &T,
) -> Result<(), ConnectorError> {
    let mut line =
        serde_json::to_string(message).map_err(|e| ConnectorError::Transport(e.to_string()))?;
    line.push('\n');

    let mut guard = writer.lock().await;
    guard
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ConnectorError::Transport(format!("write to stdin: {e}")))?;
    guard
        .flush()
        .await
        .map_err(|e| ConnectorError::Transport(format!("flush stdin: {e}")))
}

fn spawn_reader(
    core: Arc<ConnectorCore>,
    stdout: tokio::process::ChildStdout,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JsonRpcMessage>(trimmed) {
                        Ok(JsonRpcMessage::Response(resp)) => core.complete(resp).await,
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
                        Err(_) => {
                            // Not JSON-RPC; likely stray log output on stdout.
                            debug!(upstream = %core.name(), line = %trimmed, "non-jsonrpc stdout line");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(upstream = %core.name(), error = %e, "error reading upstream stdout");
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_forwarder(
    core: Arc<ConnectorCore>,
    stderr: tokio::process::ChildStderr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(upstream = %core.name(), line = %line, "upstream stderr");
        }
    })
}

/// Watches the child. A deliberate disconnect fires the kill channel and
/// suppresses the `Disconnected` event; an unexpected exit reports it.
fn spawn_exit_watcher(
    core: Arc<ConnectorCore>,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let reason = match status {
                    Ok(s) => format!("process exited with {s}"),
                    Err(e) => format!("process wait failed: {e}"),
                };
                warn!(upstream = %core.name(), reason = %reason, "stdio upstream exited");
                core.fail_all_pending().await;
                core.set_status(ConnectorStatus::Disconnected);
                core.emit(ConnectorEvent::Disconnected { reason });
            }
            _ = kill_rx => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    });
}

async fn teardown(link: StdioLink, core: &Arc<ConnectorCore>) {
    let _ = link.kill_tx.send(());
    for task in link.io_tasks {
        task.abort();
    }
    core.fail_all_pending().await;
}
