//! Master side of the tunnel: the `/tunnel` WebSocket endpoint.
//!
//! An agent connects with `x-agent-id` / `x-agent-secret` headers. Bad
//! credentials get a plain 401 before the upgrade, so no frame is ever sent.
//! After the upgrade the connection is wired to a [`Channel`] actor:
//!
//! - a writer task drains the actor's outbound queue into the socket,
//! - a reader task stamps the last-seen clock and forwards text frames,
//! - the actor itself runs on the connection task until it ends.
//!
//! On exit the registry entry is removed by generation, so a connection that
//! was superseded never evicts its replacement.

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::channel::Channel;
use crate::state::MasterState;

const INBOUND_QUEUE: usize = 256;
/// Time given to the writer to flush queued frames after the actor ends.
const WRITER_FLUSH: Duration = Duration::from_secs(2);

/// `GET /tunnel`: agent connection upgrade.
pub async fn tunnel_upgrade(
    State(state): State<MasterState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let agent_id = match state.credentials.authenticate(&headers) {
        Ok(id) => id,
        Err(e) => {
            warn!(error = %e, "Rejected tunnel connection");
            return e.into_response();
        }
    };

    let tracker = state.connections.clone();
    ws.on_upgrade(move |socket| {
        let span = info_span!("tunnel_agent", agent_id = %agent_id);
        tracker.track_future(serve_agent(socket, state, agent_id).instrument(span))
    })
}

async fn serve_agent(socket: WebSocket, state: MasterState, agent_id: String) {
    let registry = state.registry.clone();
    let generation = registry.next_generation();
    let clock = registry.new_clock();
    let (channel, handle, mut outbound) = Channel::new(
        agent_id.clone(),
        generation,
        &state.channel_settings,
        clock.clone(),
    );
    info!(generation, "Agent connected");

    let (mut ws_sink, mut ws_stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match msg.encode() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable frame");
                    continue;
                }
            };
            if ws_sink.send(WsMessage::Text(text.into())).await.is_err() {
                debug!("Transport write failed");
                return;
            }
        }
        let _ = ws_sink.send(WsMessage::Close(None)).await;
    });

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(INBOUND_QUEUE);
    let reader_registry = registry.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_stream.next().await {
            clock.store(reader_registry.now_ms(), Ordering::Relaxed);
            match msg {
                WsMessage::Text(text) => {
                    if inbound_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                WsMessage::Binary(_) => warn!("Ignoring binary frame from agent"),
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    });

    registry.insert(handle.clone()).await;
    if let Err(e) = channel.activate().await {
        warn!(error = %e, "Channel activation failed");
        handle.close();
    }
    channel.run(inbound_rx).await;

    if registry.remove(&agent_id, generation).await {
        info!("Agent disconnected");
    } else {
        debug!("Channel already replaced or evicted");
    }
    reader.abort();
    if tokio::time::timeout(WRITER_FLUSH, &mut writer).await.is_err() {
        writer.abort();
    }
}
