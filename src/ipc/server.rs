//! Local IPC server for `tensorwatch-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the local API.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list"}
//! {"command": "status", "session": "9f1c..."}
//! {"command": "tensor", "session": "9f1c...", "node": "conv1/weight", "step": 3}
//! {"command": "watch", "session": "9f1c...", "patterns": ["conv1/*"], "condition": {"kind": "has_nan"}}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": {"kind": "not_found", "message": "session 9f1c... not found"}}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::api::{self, TensorQuery};
use crate::errors::ErrorKind;
use crate::models::command::Command;
use crate::models::watchpoint::{Condition, WatchpointId};
use crate::orchestrator::session_manager::SessionManager;
use crate::{AppError, Result};

/// Inbound IPC request from `tensorwatch-ctl`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Target session.
    #[serde(default)]
    pub session: Option<String>,
    /// Device for `graph` and `tensor`.
    #[serde(default)]
    pub device: Option<String>,
    /// Node for `tensor`, `compare`, and `step`.
    #[serde(default)]
    pub node: Option<String>,
    /// Output slot for `tensor`.
    #[serde(default)]
    pub output_index: Option<u32>,
    /// Step for `tensor`, `compare`, `hits`, and `history`.
    #[serde(default)]
    pub step: Option<u64>,
    /// Watchpoint id for `unwatch` and `toggle`.
    #[serde(default)]
    pub id: Option<WatchpointId>,
    /// Enabled flag for `watch` and `toggle`.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Node patterns for `watch`.
    #[serde(default)]
    pub patterns: Option<Vec<String>>,
    /// Condition for `watch`.
    #[serde(default)]
    pub condition: Option<Condition>,
    /// Tolerance for `compare`; defaults to zero.
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// Shared-secret authentication token.
    #[serde(default)]
    pub auth_token: Option<String>,
}

/// Typed failure carried in an [`IpcResponse`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IpcError {
    /// Error discriminant.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

/// Outbound IPC response to `tensorwatch-ctl`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<IpcError>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn failure(err: &AppError) -> Self {
        let message = match err {
            AppError::Config(m)
            | AppError::Protocol(m)
            | AppError::NotFound(m)
            | AppError::InvalidState(m)
            | AppError::InvalidParam(m)
            | AppError::LimitExceeded(m)
            | AppError::CommandInProgress(m)
            | AppError::CommandTimeout(m)
            | AppError::CommandRejected(m)
            | AppError::SessionClosed(m)
            | AppError::Fatal(m)
            | AppError::Ipc(m)
            | AppError::Io(m) => m.clone(),
        };
        Self {
            ok: false,
            data: None,
            error: Some(IpcError {
                kind: err.kind(),
                message,
            }),
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| serde_json::to_value(value).map_err(AppError::from)) {
            Ok(data) => Self::success(data),
            Err(err) => Self::failure(&err),
        }
    }
}

/// Everything a connection handler needs.
#[derive(Debug, Clone)]
pub struct IpcContext {
    /// Session table.
    pub manager: Arc<SessionManager>,
    /// Expected auth token; `None` accepts every request.
    pub auth_token: Option<String>,
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    ctx: IpcContext,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = ctx.manager.config().ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let span = info_span!("ipc_server", name = %name);
    let handle = tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, ctx.clone()));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span),
    );

    Ok(handle)
}

async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, ctx: IpcContext) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &ctx).await,
                        Err(err) => IpcResponse::failure(&AppError::InvalidParam(format!(
                            "invalid json: {err}"
                        ))),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":{"kind":"ipc","message":"serialization failed"}}"#
                            .to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the local API.
pub async fn dispatch_command(request: &IpcRequest, ctx: &IpcContext) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        if let Some(ref expected) = ctx.auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!("IPC request rejected: invalid auth token");
                    return IpcResponse::failure(&AppError::Ipc("unauthorized".into()));
                }
            }
        }

        let manager = ctx.manager.as_ref();
        if request.command == "list" {
            return IpcResponse::from_result(Ok(api::list_sessions(manager)));
        }
        let session = match require(request.session.as_deref(), "session") {
            Ok(session) => session,
            Err(err) => return IpcResponse::failure(&err),
        };

        match request.command.as_str() {
            "status" => IpcResponse::from_result(api::session_status(manager, session)),
            "graph" => IpcResponse::from_result(
                require(request.device.as_deref(), "device")
                    .and_then(|device| api::get_graph(manager, session, device)),
            ),
            "tensor" => IpcResponse::from_result(
                tensor_query(request).and_then(|query| api::get_tensor(manager, session, &query)),
            ),
            "compare" => IpcResponse::from_result(tensor_query(request).and_then(|query| {
                api::compare_tensor(manager, session, &query, request.tolerance.unwrap_or_default())
            })),
            "hits" => IpcResponse::from_result(api::list_hits(manager, session, request.step)),
            "recheck" => IpcResponse::from_result(api::recheck(manager, session).await),
            "clear_hits" => IpcResponse::from_result(api::clear_hits(manager, session).await),
            "history" => IpcResponse::from_result(
                require(request.step, "step")
                    .and_then(|step| api::get_history(manager, session, step)),
            ),
            "watchpoints" => IpcResponse::from_result(api::list_watchpoints(manager, session)),
            "close" => IpcResponse::from_result(api::close_session(manager, session)),
            verb => match command_for(verb, request) {
                Ok(command) => {
                    let outcome = api::issue_command(manager, session, command).await;
                    if outcome.is_ok() {
                        info!(session_id = session, command = verb, "command applied via IPC");
                    }
                    IpcResponse::from_result(outcome)
                }
                Err(err) => IpcResponse::failure(&err),
            },
        }
    }
    .instrument(span)
    .await
}

fn command_for(verb: &str, request: &IpcRequest) -> Result<Command> {
    match verb {
        "continue" => Ok(Command::Continue),
        "pause" => Ok(Command::Pause),
        "step" => Ok(Command::StepToNextNode {
            node: request.node.clone(),
            device_id: request.device.clone(),
        }),
        "watch" => Ok(Command::SetWatchpoint {
            patterns: require(request.patterns.clone(), "patterns")?,
            condition: require(request.condition.clone(), "condition")?,
            enabled: request.enabled.unwrap_or(true),
        }),
        "unwatch" => Ok(Command::RemoveWatchpoint {
            id: require(request.id, "id")?,
        }),
        "toggle" => Ok(Command::ToggleWatchpoint {
            id: require(request.id, "id")?,
            enabled: require(request.enabled, "enabled")?,
        }),
        "terminate" => Ok(Command::Terminate),
        other => Err(AppError::InvalidParam(format!("unknown command: {other}"))),
    }
}

fn tensor_query(request: &IpcRequest) -> Result<TensorQuery> {
    Ok(TensorQuery {
        device: request.device.clone(),
        node: require(request.node.clone(), "node")?,
        output_index: request.output_index.unwrap_or_default(),
        step: require(request.step, "step")?,
    })
}

fn require<T>(value: Option<T>, field: &str) -> Result<T> {
    value.ok_or_else(|| AppError::InvalidParam(format!("missing required '{field}' field")))
}
