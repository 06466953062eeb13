//! Agent side of the tunnel: the supervised outbound connection.
//!
//! [`run`] dials the master, waits for `HANDSHAKE_ACK`, then serves frames
//! until the channel ends, and reconnects forever with the configured
//! [`Backoff`]. Each connection gets a fresh [`Session`] that owns the shell
//! bridge and the agent-side stream table; both are torn down with the
//! connection so nothing outlives the channel it was opened on.
//!
//! Credentials travel as `x-agent-id` / `x-agent-secret` upgrade headers and
//! never appear in a frame.
//!
//! The writer pings the master every heartbeat interval. A session that
//! hears nothing at all for `idle_timeout_secs` (no frame, no pong) treats
//! the master as gone and reconnects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::channel::ChannelState;
use super::frame::{decode_bytes, Frame, Message};
use super::mux::{Delivery, EndReason, Leg, StreamEvent, StreamSettings, StreamTable};
use crate::agent::metrics::CpuSampler;
use crate::agent::{exec, files, DispatchSettings};
use crate::auth::{AGENT_ID_HEADER, AGENT_SECRET_HEADER};
use crate::config::{AgentConfig, Config};
use crate::error::RelayError;
use crate::shell::bridge::{ShellBridge, ShellExited};
use crate::shell::resolve_shell;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 256;
const SHELL_EXIT_QUEUE: usize = 16;
/// Time given to the writer to flush queued frames after the session ends.
const WRITER_FLUSH: Duration = Duration::from_secs(2);

/// Why a connected session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disconnect {
    /// Master announced a restart; reconnect without growing the delay.
    RelayShutdown,
    /// Transport closed or failed after the channel went active.
    Closed,
    /// Local shutdown requested.
    Shutdown,
}

/// Everything a connection attempt needs, built once from the config.
#[derive(Debug, Clone)]
pub struct TunnelClient {
    agent: AgentConfig,
    shell: String,
    dispatch: Arc<DispatchSettings>,
    streams: StreamSettings,
}

impl TunnelClient {
    pub fn new(config: &Config) -> Result<Self, RelayError> {
        let agent = config
            .agent
            .clone()
            .ok_or_else(|| RelayError::Config("missing [agent] section".into()))?;
        let connect_timeout = Duration::from_secs(agent.connect_timeout_secs);
        Ok(Self {
            shell: resolve_shell(&config.shell.default_shell),
            dispatch: Arc::new(DispatchSettings::from_config(config)),
            streams: StreamSettings::from_config(&config.streams, connect_timeout),
            agent,
        })
    }

    /// Connect and serve until shutdown, reconnecting after every loss.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = Backoff::new(&self.agent.reconnect);
        let mut reconnects: u64 = 0;

        loop {
            info!(url = %self.agent.url, agent_id = %self.agent.agent_id, "Connecting to master");
            let delay = match self.connect_and_run(&shutdown).await {
                Ok(Disconnect::Shutdown) => return,
                Ok(Disconnect::RelayShutdown) => {
                    info!("Master is restarting, reconnecting without backoff");
                    backoff.restart()
                }
                Ok(Disconnect::Closed) => {
                    backoff.reset();
                    backoff.next_delay()
                }
                Err(e) => {
                    warn!(code = e.code(), "Tunnel connection failed: {e}");
                    backoff.next_delay()
                }
            };
            reconnects += 1;
            info!(reconnects, "Reconnecting in {:.1}s", delay.as_secs_f64());

            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection: dial, handshake, serve. Errors are pre-activation
    /// failures; anything after `HANDSHAKE_ACK` ends as a [`Disconnect`].
    async fn connect_and_run(&self, shutdown: &CancellationToken) -> Result<Disconnect, RelayError> {
        let mut state = ChannelState::Connecting;
        let ws = tokio::select! {
            () = shutdown.cancelled() => return Ok(Disconnect::Shutdown),
            ws = self.dial() => ws?,
        };
        advance(&mut state, ChannelState::Connected);

        let (mut sink, mut stream) = ws.split();
        advance(&mut state, ChannelState::Authenticating);
        let handshake = Duration::from_secs(self.agent.handshake_timeout_secs);
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = sink.send(WsMessage::Close(None)).await;
                return Ok(Disconnect::Shutdown);
            }
            ack = tokio::time::timeout(handshake, await_ack(&mut stream)) => {
                ack.map_err(|_| RelayError::Timeout(handshake))??;
            }
        }
        advance(&mut state, ChannelState::Active);
        info!("Tunnel active");

        let cancel = shutdown.child_token();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        let heartbeat_every = Duration::from_secs(self.agent.heartbeat_interval_secs.max(1));
        let mut writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval_at(
                tokio::time::Instant::now() + heartbeat_every,
                heartbeat_every,
            );
            loop {
                let msg = tokio::select! {
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = ping.tick() => {
                        if sink.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            debug!("Transport write failed");
                            return;
                        }
                        continue;
                    }
                };
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Dropping unencodable frame");
                        continue;
                    }
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    debug!("Transport write failed");
                    return;
                }
            }
            let _ = sink.send(WsMessage::Close(None)).await;
        });

        let heartbeat = tokio::spawn(heartbeat_loop(outbound.clone(), heartbeat_every, cancel.clone()));

        let (events_tx, mut stream_events) = mpsc::unbounded_channel();
        let (exit_tx, mut shell_exits) = mpsc::channel::<ShellExited>(SHELL_EXIT_QUEUE);
        let mut session = Session {
            streams: StreamTable::new(
                cancel.clone(),
                outbound.clone(),
                events_tx,
                self.streams.clone(),
            ),
            shells: ShellBridge::new(self.shell.clone(), outbound.clone(), exit_tx),
            outbound,
            dispatch: Arc::clone(&self.dispatch),
            stream_host: self.agent.stream_host.clone(),
            shell_dir: shell_dir(),
            tasks: TaskTracker::new(),
            cancel: cancel.clone(),
        };

        let idle_limit = Duration::from_secs(self.agent.idle_timeout_secs.max(1));
        let mut idle_check = tokio::time::interval(idle_limit / 4);
        let mut last_inbound = Instant::now();

        let reason = loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break Disconnect::Shutdown,
                Some(event) = stream_events.recv() => session.on_stream_event(event).await,
                Some((shell_id, pid)) = shell_exits.recv() => session.shells.exited(&shell_id, pid),
                _ = idle_check.tick() => {
                    if last_inbound.elapsed() >= idle_limit {
                        warn!(idle_secs = idle_limit.as_secs(), "Master silent, dropping connection");
                        break Disconnect::Closed;
                    }
                }
                msg = stream.next() => match msg {
                    Some(Ok(msg)) => {
                        last_inbound = Instant::now();
                        match msg {
                            WsMessage::Text(text) => match Message::decode(text.as_str()) {
                                Ok(Message::Frame(Frame::RelayShutdown)) => {
                                    break Disconnect::RelayShutdown
                                }
                                Ok(Message::Frame(frame)) => session.on_frame(frame).await,
                                Ok(Message::Response(response)) => {
                                    debug!(request_id = %response.request_id, "Unsolicited response (dropped)");
                                }
                                Err(e) => warn!(error = %e, "Dropping malformed frame"),
                            },
                            WsMessage::Binary(_) => warn!("Ignoring binary frame from master"),
                            WsMessage::Close(_) => break Disconnect::Closed,
                            _ => {}
                        }
                    }
                    None => break Disconnect::Closed,
                    Some(Err(e)) => {
                        warn!(error = %e, "Transport read failed");
                        break Disconnect::Closed;
                    }
                },
            }
        };
        advance(&mut state, ChannelState::Closed);

        cancel.cancel();
        heartbeat.abort();
        session.teardown().await;
        drop(session);
        if tokio::time::timeout(WRITER_FLUSH, &mut writer).await.is_err() {
            writer.abort();
        }
        info!(?reason, "Tunnel closed");
        Ok(reason)
    }

    async fn dial(&self) -> Result<WsStream, RelayError> {
        let mut request = self
            .agent
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RelayError::Config(format!("agent.url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(AGENT_ID_HEADER, header_value(&self.agent.agent_id)?);
        headers.insert(AGENT_SECRET_HEADER, header_value(&self.agent.secret)?);

        let timeout = Duration::from_secs(self.agent.connect_timeout_secs);
        let (ws, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| RelayError::Timeout(timeout))?
            .map_err(connect_error)?;
        Ok(ws)
    }
}

fn advance(state: &mut ChannelState, next: ChannelState) {
    if state.can_advance(next) {
        debug!(from = ?*state, to = ?next, "Channel state");
        *state = next;
    }
}

fn header_value(value: &str) -> Result<HeaderValue, RelayError> {
    HeaderValue::from_str(value)
        .map_err(|_| RelayError::Config("agent credentials must be visible ASCII".into()))
}

fn connect_error(e: WsError) -> RelayError {
    match e {
        WsError::Http(response) if response.status().as_u16() == 401 => RelayError::AuthFailure,
        WsError::Io(e) => RelayError::Io(e),
        other => RelayError::ChannelLoss(other.to_string()),
    }
}

fn shell_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Read until `HANDSHAKE_ACK`. Anything else before it is ignored.
async fn await_ack(stream: &mut futures_util::stream::SplitStream<WsStream>) -> Result<(), RelayError> {
    while let Some(msg) = stream.next().await {
        match msg.map_err(connect_error)? {
            WsMessage::Text(text) => match Message::decode(text.as_str()) {
                Ok(Message::Frame(Frame::HandshakeAck)) => return Ok(()),
                Ok(other) => debug!(?other, "Frame before HANDSHAKE_ACK (ignored)"),
                Err(e) => warn!(error = %e, "Malformed frame during handshake"),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(RelayError::ChannelLoss("closed during handshake".into()))
}

async fn heartbeat_loop(outbound: mpsc::Sender<Message>, every: Duration, cancel: CancellationToken) {
    let mut sampler = CpuSampler::new();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        let data = sampler.sample();
        if outbound.send(Frame::Heartbeat { data }.into()).await.is_err() {
            return;
        }
    }
}

/// Per-connection agent state, owned by the connection loop.
struct Session {
    outbound: mpsc::Sender<Message>,
    streams: StreamTable,
    shells: ShellBridge,
    dispatch: Arc<DispatchSettings>,
    stream_host: String,
    shell_dir: PathBuf,
    /// RPC dispatch tasks; cancelled with the connection.
    tasks: TaskTracker,
    cancel: CancellationToken,
}

impl Session {
    async fn send(&self, msg: impl Into<Message>) {
        if self.outbound.send(msg.into()).await.is_err() {
            debug!("Outbound queue closed");
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::ExecCommand { request_id, data } => {
                let outbound = self.outbound.clone();
                let dispatch = Arc::clone(&self.dispatch);
                self.spawn_rpc(async move {
                    let response = exec::handle(&request_id, &data, &dispatch.exec).await;
                    let _ = outbound.send(response.into()).await;
                });
            }
            Frame::FileAction { request_id, data } => {
                let outbound = self.outbound.clone();
                let dispatch = Arc::clone(&self.dispatch);
                self.spawn_rpc(async move {
                    if let Some(response) =
                        files::handle(&request_id, &data, &dispatch.files, &outbound).await
                    {
                        let _ = outbound.send(response.into()).await;
                    }
                });
            }
            Frame::StartShell { shell_id } => {
                match self.shells.start(shell_id.clone(), &self.shell_dir) {
                    Ok(_) => {}
                    Err(RelayError::Protocol(e)) => warn!(shell_id = %shell_id, "{e}"),
                    Err(e) => {
                        warn!(shell_id = %shell_id, "Shell failed to start: {e}");
                        self.send(Frame::ShellExit { shell_id, code: None }).await;
                    }
                }
            }
            Frame::ShellInput { shell_id, input } => match decode_bytes(&input) {
                Ok(bytes) => {
                    self.shells.input(&shell_id, bytes);
                }
                Err(e) => warn!(shell_id = %shell_id, error = %e, "Bad shell input"),
            },
            Frame::KillShell { shell_id } => {
                self.shells.kill(&shell_id);
            }
            Frame::StreamOpen {
                connection_id,
                port,
            } => {
                let leg = Leg::Dial {
                    host: self.stream_host.clone(),
                    port,
                };
                self.streams.open(connection_id, port, leg);
            }
            Frame::StreamData {
                connection_id,
                data,
            } => match decode_bytes(&data) {
                Ok(bytes) => {
                    if self.streams.deliver(&connection_id, bytes).await == Delivery::Stalled {
                        self.send(Frame::StreamClose { connection_id }).await;
                    }
                }
                Err(e) => warn!(connection_id = %connection_id, error = %e, "Bad stream data"),
            },
            Frame::StreamEof { connection_id } => {
                self.streams.half_close(&connection_id);
            }
            Frame::StreamClose { connection_id } => {
                self.streams.close(&connection_id);
            }
            Frame::HandshakeAck => debug!("Duplicate HANDSHAKE_ACK (ignored)"),
            other => debug!(kind = other.kind(), "Unexpected frame from master (ignored)"),
        }
    }

    async fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected { connection_id } => self.streams.mark_open(&connection_id),
            StreamEvent::Ended {
                connection_id,
                reason,
            } => {
                if let EndReason::Unreachable(e) = &reason {
                    info!(connection_id = %connection_id, "Stream target unreachable: {e}");
                }
                if self.streams.finished(&connection_id) {
                    self.send(Frame::StreamClose { connection_id }).await;
                }
            }
        }
    }

    fn spawn_rpc<F>(&self, work: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = work => {}
            }
        });
    }

    async fn teardown(&mut self) {
        let streams = self.streams.close_all();
        let shells = self.shells.kill_all();
        self.tasks.close();
        self.tasks.wait().await;
        if streams + shells > 0 {
            info!(streams, shells, "Released session resources");
        }
    }
}
