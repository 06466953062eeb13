//! Agent endpoints: thin callers of a channel's RPC and shell surface.
//!
//! - `GET  /api/agents`: snapshot of every registered channel
//! - `POST /api/agents/{agentId}/exec`: `EXEC_COMMAND` RPC
//! - `POST /api/agents/{agentId}/files`: `FILE_ACTION` RPC (not `download`)
//! - `POST /api/agents/{agentId}/download`: chunked download, raw bytes back
//! - `GET  /api/agents/{agentId}/shell?token=<key>`: operator shell socket
//!
//! An agent with no credential is `404 UNKNOWN_AGENT`; a known agent with no
//! active channel is `502 ROUTE_UNAVAILABLE`.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::RelayError;
use crate::state::MasterState;
use crate::tunnel::channel::{ChannelHandle, ShellEvent};
use crate::tunnel::frame::{encode_bytes, ExecRequest, FileAction};

/// The agent's active channel, or the error explaining why there is none.
async fn channel_for(state: &MasterState, agent_id: &str) -> Result<ChannelHandle, RelayError> {
    if let Some(handle) = state.registry.get(agent_id).await {
        return Ok(handle);
    }
    if state.credentials.is_tunnel_capable(agent_id) {
        Err(RelayError::RouteUnavailable(agent_id.to_string()))
    } else {
        Err(RelayError::UnknownAgent(agent_id.to_string()))
    }
}

/// `GET /api/agents`: every registered channel with its streams, pending
/// requests, shells and last metrics.
pub async fn list(State(state): State<MasterState>) -> Json<Value> {
    let mut agents = Vec::new();
    for handle in state.registry.list().await {
        match handle.snapshot().await {
            Ok(snapshot) => agents.push(snapshot),
            // Closed between list and snapshot.
            Err(e) => debug!(agent_id = %handle.agent_id(), "Skipping channel: {e}"),
        }
    }
    Json(json!({ "agents": agents }))
}

/// `POST /api/agents/{agentId}/exec`: run one command on the agent.
///
/// Body: `{command, root, cwd?, timeoutMs?}`. Returns the agent's result,
/// including the `cwd` to send with the next command.
///
/// # Errors
///
/// - `403` with `{"code":"JAIL_VIOLATION"}`: `cd` target escapes `root`
/// - `504` with `{"code":"TIMEOUT"}`: no reply before the deadline
pub async fn exec(
    State(state): State<MasterState>,
    Path(agent_id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Result<Json<Value>, RelayError> {
    let handle = channel_for(&state, &agent_id).await?;
    info!(agent_id = %agent_id, root = %request.root, "Exec requested");
    Ok(Json(handle.exec(request).await?))
}

/// `POST /api/agents/{agentId}/files`: one non-download file action.
pub async fn files(
    State(state): State<MasterState>,
    Path(agent_id): Path<String>,
    Json(action): Json<FileAction>,
) -> Result<Json<Value>, RelayError> {
    let handle = channel_for(&state, &agent_id).await?;
    Ok(Json(handle.file_action(action).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub root: String,
    pub path: String,
    pub chunk_size: Option<usize>,
}

/// `POST /api/agents/{agentId}/download`: reassembled `FILE_CHUNK`s as an
/// `application/octet-stream` body, capped at `files.max_file_size`.
pub async fn download(
    State(state): State<MasterState>,
    Path(agent_id): Path<String>,
    Json(request): Json<DownloadRequest>,
) -> Result<Response, RelayError> {
    let handle = channel_for(&state, &agent_id).await?;
    let body = handle
        .download(
            request.root,
            request.path,
            request.chunk_size,
            state.config.files.max_file_size,
        )
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

#[derive(Deserialize)]
pub struct ShellQuery {
    /// Admin key (browsers can't set headers on WebSocket upgrades).
    pub token: String,
}

/// `GET /api/agents/{agentId}/shell?token=<key>`: interactive shell socket.
///
/// Client text or binary messages become `SHELL_INPUT`. The server sends
/// `{"type":"output","stream","data"}` (base64 `data`) and a final
/// `{"type":"exit","code"}`. Closing the socket kills the shell.
pub async fn shell_upgrade(
    State(state): State<MasterState>,
    Path(agent_id): Path<String>,
    Query(query): Query<ShellQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(
        state.config.master.admin_key.as_bytes(),
        query.token.as_bytes(),
    ) {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    let handle = match channel_for(&state, &agent_id).await {
        Ok(handle) => handle,
        Err(e) => return e.into_response(),
    };

    let shell_id = Uuid::new_v4().to_string();
    ws.on_upgrade(move |socket| {
        let span = info_span!("operator_shell", agent_id = %agent_id, shell_id = %shell_id);
        bridge_shell(socket, handle, shell_id).instrument(span)
    })
}

async fn bridge_shell(socket: WebSocket, handle: ChannelHandle, shell_id: String) {
    let (mut sink, mut stream) = socket.split();
    let mut events = match handle.start_shell(shell_id.clone()).await {
        Ok(events) => events,
        Err(e) => {
            warn!("Shell start failed: {e}");
            let msg = json!({"type": "error", "code": e.code(), "error": e.to_string()});
            let _ = sink.send(WsMessage::Text(msg.to_string().into())).await;
            let _ = sink.send(WsMessage::Close(None)).await;
            return;
        }
    };
    info!("Operator shell opened");

    let mut exited = false;
    loop {
        tokio::select! {
            event = events.recv() => {
                let msg = match event {
                    Some(ShellEvent::Output { stream, data }) => {
                        json!({"type": "output", "stream": stream, "data": encode_bytes(&data)})
                    }
                    Some(ShellEvent::Exit { code }) => {
                        exited = true;
                        json!({"type": "exit", "code": code})
                    }
                    None => {
                        exited = true;
                        json!({"type": "error", "code": "CHANNEL_LOSS", "error": "tunnel channel lost"})
                    }
                };
                if sink.send(WsMessage::Text(msg.to_string().into())).await.is_err() || exited {
                    break;
                }
            }
            msg = stream.next() => {
                let input = match msg {
                    Some(Ok(WsMessage::Text(text))) => text.as_str().as_bytes().to_vec(),
                    Some(Ok(WsMessage::Binary(data))) => data.to_vec(),
                    Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                if let Err(e) = handle.shell_input(shell_id.clone(), input).await {
                    warn!("Shell input failed: {e}");
                    break;
                }
            }
        }
    }

    if !exited {
        let _ = handle.kill_shell(shell_id).await;
    }
    let _ = sink.send(WsMessage::Close(None)).await;
    info!("Operator shell closed");
}
