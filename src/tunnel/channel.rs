//! Tunnel channel: one agent connection as an owned actor.
//!
//! The actor task owns everything tied to the channel: the RPC
//! [`Correlator`], the [`StreamTable`], shell subscribers and in-flight
//! downloads. Nothing outside the task touches those maps; callers go
//! through a cloneable [`ChannelHandle`] that sends typed [`Command`]s.
//!
//! ```text
//!   WS reader ──text──▶ ┌───────────────┐ ──Message──▶ WS writer
//!   ChannelHandle ─cmd─▶│ Channel actor │
//!   stream pumps ─evt──▶└───────────────┘
//! ```
//!
//! When the actor stops, for any reason, it rejects every pending request
//! with [`RelayError::ChannelLoss`] and hard-cancels every stream before it
//! returns. Nothing owned by a channel outlives it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::correlator::{Correlator, RpcResult};
use super::frame::{
    decode_bytes, encode_bytes, ExecRequest, FileAction, FileOp, Frame, Message, Metrics,
    OutputStream, RpcResponse,
};
use super::mux::{Delivery, Leg, StreamEvent, StreamInfo, StreamSettings, StreamTable};
use crate::error::RelayError;

/// How often pending requests are checked against their deadlines.
const EXPIRY_TICK: Duration = Duration::from_millis(500);

/// Extra wait on top of a call deadline before the caller gives up on its own.
const REPLY_GRACE: Duration = Duration::from_secs(1);

/// Exec calls wait this much longer than the command's own timeout.
const EXEC_SLACK: Duration = Duration::from_secs(5);

const COMMAND_QUEUE: usize = 64;
const SHELL_EVENT_QUEUE: usize = 256;
const DOWNLOAD_QUEUE: usize = 16;

/// Lifecycle of a channel. Both ends walk the same machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Connecting,
    Connected,
    Authenticating,
    Active,
    Closed,
}

impl ChannelState {
    pub fn can_advance(self, next: Self) -> bool {
        use ChannelState::{Active, Authenticating, Closed, Connected, Connecting};
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Authenticating)
                | (Authenticating, Active)
                | (Connecting | Connected | Authenticating | Active, Closed)
        )
    }
}

/// Per-channel tunables.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub rpc_timeout: Duration,
    pub streams: StreamSettings,
    pub outbound_depth: usize,
}

/// Event delivered to whoever started a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Output { stream: OutputStream, data: Vec<u8> },
    Exit { code: Option<i32> },
}

/// Diagnostic view of a live channel.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub agent_id: String,
    pub state: ChannelState,
    pub connected_secs: u64,
    pub last_heartbeat_secs: Option<u64>,
    pub metrics: Option<Metrics>,
    pub streams: Vec<StreamInfo>,
    pub pending_requests: usize,
    pub shells: Vec<String>,
    pub dropped_shell_output: u64,
}

pub enum Command {
    Call {
        request_id: String,
        kind: &'static str,
        timeout: Duration,
        frame: Frame,
        reply: oneshot::Sender<RpcResult>,
    },
    Cancel {
        request_id: String,
    },
    Download {
        request_id: String,
        timeout: Duration,
        frame: Frame,
        chunks: mpsc::Sender<Vec<u8>>,
        reply: oneshot::Sender<RpcResult>,
    },
    OpenStream {
        port: u16,
        socket: TcpStream,
    },
    StartShell {
        shell_id: String,
        events: mpsc::Sender<ShellEvent>,
        reply: oneshot::Sender<Result<(), RelayError>>,
    },
    ShellInput {
        shell_id: String,
        data: Vec<u8>,
    },
    KillShell {
        shell_id: String,
    },
    Snapshot {
        reply: oneshot::Sender<ChannelSnapshot>,
    },
    /// Queue a control frame; `reply` fires once it is on the outbound queue.
    Notify {
        frame: Frame,
        reply: oneshot::Sender<()>,
    },
}

/// The actor half. Create with [`Channel::new`], then [`Channel::activate`]
/// and [`Channel::run`] on the connection task.
pub struct Channel {
    agent_id: String,
    state: watch::Sender<ChannelState>,
    outbound: mpsc::Sender<Message>,
    commands: mpsc::Receiver<Command>,
    stream_events: mpsc::UnboundedReceiver<StreamEvent>,
    correlator: Correlator,
    streams: StreamTable,
    shells: HashMap<String, mpsc::Sender<ShellEvent>>,
    downloads: HashMap<String, mpsc::Sender<Vec<u8>>>,
    metrics: Option<Metrics>,
    last_heartbeat: Option<Instant>,
    connected_at: Instant,
    dropped_shell_output: u64,
    stall_timeout: Duration,
    cancel: CancellationToken,
}

impl Channel {
    /// Build the actor and its handle. The returned receiver yields the
    /// frames to write to the transport.
    pub fn new(
        agent_id: String,
        generation: u64,
        settings: &ChannelSettings,
        last_seen_ms: Arc<AtomicU64>,
    ) -> (Self, ChannelHandle, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(settings.outbound_depth.max(1));
        let (cmd_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, stream_events) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ChannelState::Authenticating);
        let cancel = CancellationToken::new();
        let connected_at = Instant::now();

        let streams = StreamTable::new(
            cancel.clone(),
            outbound.clone(),
            events_tx,
            settings.streams.clone(),
        );
        let handle = ChannelHandle {
            agent_id: agent_id.clone(),
            generation,
            commands: cmd_tx,
            state: state_rx,
            cancel: cancel.clone(),
            last_seen_ms,
            connected_at,
            rpc_timeout: settings.rpc_timeout,
        };
        let channel = Self {
            agent_id,
            state,
            outbound,
            commands,
            stream_events,
            correlator: Correlator::new(),
            streams,
            shells: HashMap::new(),
            downloads: HashMap::new(),
            metrics: None,
            last_heartbeat: None,
            connected_at,
            dropped_shell_output: 0,
            stall_timeout: settings.streams.stall_timeout,
            cancel,
        };
        (channel, handle, outbound_rx)
    }

    fn advance(&self, next: ChannelState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_advance(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    /// Send `HANDSHAKE_ACK` and go active.
    pub async fn activate(&self) -> Result<(), RelayError> {
        self.send(Frame::HandshakeAck).await?;
        if !self.advance(ChannelState::Active) {
            return Err(RelayError::Protocol("channel is not authenticating".into()));
        }
        info!("Channel active");
        Ok(())
    }

    async fn send(&self, msg: impl Into<Message>) -> Result<(), RelayError> {
        self.outbound
            .send(msg.into())
            .await
            .map_err(|_| RelayError::ChannelLoss("transport writer gone".into()))
    }

    /// Process traffic until the transport ends or the channel is cancelled.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<String>) {
        let mut tick = tokio::time::interval(EXPIRY_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break "channel closed",
                text = inbound.recv() => match text {
                    Some(text) => self.on_text(&text).await,
                    None => break "transport closed",
                },
                Some(cmd) = self.commands.recv() => self.on_command(cmd).await,
                Some(event) = self.stream_events.recv() => self.on_stream_event(event).await,
                _ = tick.tick() => self.expire(),
            }
        };
        self.teardown(reason);
    }

    fn teardown(&mut self, reason: &str) {
        self.advance(ChannelState::Closed);
        let rejected = self.correlator.reject_all(reason);
        let streams = self.streams.close_all();
        let shells = self.shells.len();
        self.shells.clear();
        self.downloads.clear();
        self.cancel.cancel();
        info!(rejected, streams, shells, "Channel closed: {reason}");
    }

    fn expire(&mut self) {
        if self.correlator.expire(Instant::now()) > 0 {
            let correlator = &self.correlator;
            self.downloads.retain(|id, _| correlator.contains(id));
        }
    }

    async fn on_text(&mut self, text: &str) {
        let msg = match Message::decode(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Dropped malformed frame");
                return;
            }
        };
        match msg {
            Message::Response(response) => {
                self.downloads.remove(&response.request_id);
                self.correlator.resolve(response);
            }
            Message::Frame(frame) => self.on_frame(frame).await,
        }
    }

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Heartbeat { data } => {
                debug!(cpu = data.cpu, ram = data.ram, disk = data.disk, "Heartbeat");
                self.metrics = Some(data);
                self.last_heartbeat = Some(Instant::now());
            }
            Frame::StreamData {
                connection_id,
                data,
            } => {
                let Ok(bytes) = decode_bytes(&data) else {
                    warn!(connection_id = %connection_id, "Dropped STREAM_DATA with bad payload");
                    return;
                };
                if self.streams.deliver(&connection_id, bytes).await == Delivery::Stalled {
                    let _ = self.send(Frame::StreamClose { connection_id }).await;
                }
            }
            Frame::StreamEof { connection_id } => {
                self.streams.half_close(&connection_id);
            }
            Frame::StreamClose { connection_id } => {
                self.streams.close(&connection_id);
            }
            Frame::StreamOpen { connection_id, .. } => {
                warn!(connection_id = %connection_id, "Agent-initiated streams are not accepted");
                let _ = self.send(Frame::StreamClose { connection_id }).await;
            }
            Frame::ShellOutput {
                shell_id,
                stream,
                data,
            } => {
                let Some(events) = self.shells.get(&shell_id) else {
                    return;
                };
                let Ok(bytes) = decode_bytes(&data) else {
                    warn!(shell_id = %shell_id, "Dropped SHELL_OUTPUT with bad payload");
                    return;
                };
                if events
                    .try_send(ShellEvent::Output {
                        stream,
                        data: bytes,
                    })
                    .is_err()
                {
                    self.dropped_shell_output += 1;
                    warn!(shell_id = %shell_id, "Dropped shell output (subscriber backpressure)");
                }
            }
            Frame::ShellExit { shell_id, code } => {
                if let Some(events) = self.shells.remove(&shell_id) {
                    info!(shell_id = %shell_id, ?code, "Shell exited");
                    // A full queue still ends the subscriber: the sender drops here.
                    let _ = events.try_send(ShellEvent::Exit { code });
                }
            }
            Frame::FileChunk {
                request_id,
                data,
                is_last,
            } => self.on_file_chunk(request_id, &data, is_last).await,
            other => warn!(frame = other.kind(), "Unexpected frame from agent (dropped)"),
        }
    }

    async fn on_file_chunk(&mut self, request_id: String, data: &str, is_last: bool) {
        let Some(sink) = self.downloads.get(&request_id) else {
            debug!(request_id = %request_id, "Chunk for unknown download (dropped)");
            return;
        };
        let bytes = match decode_bytes(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.downloads.remove(&request_id);
                self.correlator.resolve(RpcResponse::error(
                    request_id,
                    "PROTOCOL_ERROR",
                    format!("bad chunk payload: {e}"),
                ));
                return;
            }
        };
        if !bytes.is_empty() && sink.send_timeout(bytes, self.stall_timeout).await.is_err() {
            warn!(request_id = %request_id, "Download reader gone or stalled, abandoning");
            self.downloads.remove(&request_id);
            self.correlator.cancel(&request_id);
            return;
        }
        self.correlator.touch(&request_id, Instant::now());
        if is_last {
            self.downloads.remove(&request_id);
            self.correlator
                .resolve(RpcResponse::success(request_id, json!({"complete": true})));
        }
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Call {
                request_id,
                kind,
                timeout,
                frame,
                reply,
            } => {
                if self
                    .correlator
                    .register(request_id.clone(), kind, timeout, reply)
                    && self.send(frame).await.is_err()
                {
                    self.correlator.cancel(&request_id);
                }
            }
            Command::Cancel { request_id } => {
                self.downloads.remove(&request_id);
                self.correlator.cancel(&request_id);
            }
            Command::Download {
                request_id,
                timeout,
                frame,
                chunks,
                reply,
            } => {
                if self
                    .correlator
                    .register(request_id.clone(), "FILE_ACTION", timeout, reply)
                {
                    self.downloads.insert(request_id.clone(), chunks);
                    if self.send(frame).await.is_err() {
                        self.downloads.remove(&request_id);
                        self.correlator.cancel(&request_id);
                    }
                }
            }
            Command::OpenStream { port, socket } => {
                let connection_id = Uuid::new_v4().to_string();
                let open = Frame::StreamOpen {
                    connection_id: connection_id.clone(),
                    port,
                };
                // STREAM_OPEN must be queued before the pump can emit data.
                if self.send(open).await.is_ok() {
                    debug!(connection_id = %connection_id, port, "Stream opened");
                    self.streams
                        .open(connection_id, port, Leg::Accepted(socket));
                }
            }
            Command::StartShell {
                shell_id,
                events,
                reply,
            } => {
                if self.shells.contains_key(&shell_id) {
                    let _ = reply.send(Err(RelayError::Protocol(format!(
                        "shell {shell_id} already running"
                    ))));
                    return;
                }
                let frame = Frame::StartShell {
                    shell_id: shell_id.clone(),
                };
                let result = self.send(frame).await;
                if result.is_ok() {
                    self.shells.insert(shell_id, events);
                }
                let _ = reply.send(result);
            }
            Command::ShellInput { shell_id, data } => {
                if self.shells.contains_key(&shell_id) {
                    let input = encode_bytes(&data);
                    let _ = self.send(Frame::ShellInput { shell_id, input }).await;
                }
            }
            Command::KillShell { shell_id } => {
                if self.shells.remove(&shell_id).is_some() {
                    let _ = self.send(Frame::KillShell { shell_id }).await;
                }
            }
            Command::Snapshot { reply } => {
                let mut shells: Vec<String> = self.shells.keys().cloned().collect();
                shells.sort();
                let _ = reply.send(ChannelSnapshot {
                    agent_id: self.agent_id.clone(),
                    state: *self.state.borrow(),
                    connected_secs: self.connected_at.elapsed().as_secs(),
                    last_heartbeat_secs: self.last_heartbeat.map(|t| t.elapsed().as_secs()),
                    metrics: self.metrics.clone(),
                    streams: self.streams.snapshot(),
                    pending_requests: self.correlator.len(),
                    shells,
                    dropped_shell_output: self.dropped_shell_output,
                });
            }
            Command::Notify { frame, reply } => {
                let _ = self.send(frame).await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Connected { connection_id } => self.streams.mark_open(&connection_id),
            StreamEvent::Ended {
                connection_id,
                reason,
            } => {
                debug!(connection_id = %connection_id, ?reason, "Local leg ended");
                if self.streams.finished(&connection_id) {
                    let _ = self.send(Frame::StreamClose { connection_id }).await;
                }
            }
        }
    }
}

/// Cloneable front door to a channel actor.
#[derive(Clone)]
pub struct ChannelHandle {
    agent_id: String,
    generation: u64,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
    last_seen_ms: Arc<AtomicU64>,
    connected_at: Instant,
    rpc_timeout: Duration,
}

impl ChannelHandle {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Registry-assigned, increases with every accepted connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active && !self.cancel.is_cancelled()
    }

    /// Last inbound traffic, in ms since the registry epoch.
    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Force the channel closed. The actor tears down everything it owns.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the channel has been closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    async fn submit(&self, cmd: Command) -> Result<(), RelayError> {
        if !self.is_active() {
            return Err(RelayError::RouteUnavailable(self.agent_id.clone()));
        }
        self.commands
            .send(cmd)
            .await
            .map_err(|_| RelayError::ChannelLoss("channel closed".into()))
    }

    /// Issue one RPC and wait for its single resolution.
    pub async fn call(
        &self,
        kind: &'static str,
        timeout: Duration,
        build: impl FnOnce(String) -> Frame,
    ) -> RpcResult {
        let request_id = Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Call {
            request_id: request_id.clone(),
            kind,
            timeout,
            frame: build(request_id.clone()),
            reply,
        })
        .await?;
        self.await_reply(request_id, timeout, rx).await
    }

    async fn await_reply(
        &self,
        request_id: String,
        timeout: Duration,
        rx: oneshot::Receiver<RpcResult>,
    ) -> RpcResult {
        match tokio::time::timeout(timeout + REPLY_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::ChannelLoss("channel closed".into())),
            Err(_) => {
                let _ = self.commands.try_send(Command::Cancel { request_id });
                Err(RelayError::Timeout(timeout))
            }
        }
    }

    /// `EXEC_COMMAND`. The deadline follows the command's own timeout.
    pub async fn exec(&self, request: ExecRequest) -> RpcResult {
        let timeout = request
            .timeout_ms
            .map_or(self.rpc_timeout, |ms| Duration::from_millis(ms) + EXEC_SLACK);
        self.call("EXEC_COMMAND", timeout, |request_id| Frame::ExecCommand {
            request_id,
            data: request,
        })
        .await
    }

    /// Any `FILE_ACTION` except `download`, which streams; see [`Self::download`].
    pub async fn file_action(&self, action: FileAction) -> RpcResult {
        if matches!(action.op, FileOp::Download { .. }) {
            return Err(RelayError::Protocol(
                "download is chunked; use the download call".into(),
            ));
        }
        self.call("FILE_ACTION", self.rpc_timeout, |request_id| {
            Frame::FileAction {
                request_id,
                data: action,
            }
        })
        .await
    }

    /// Chunked download, reassembled. `max_size` bounds the collected bytes.
    pub async fn download(
        &self,
        root: String,
        path: String,
        chunk_size: Option<usize>,
        max_size: u64,
    ) -> Result<Vec<u8>, RelayError> {
        let request_id = Uuid::new_v4().to_string();
        let (chunks_tx, mut chunks) = mpsc::channel(DOWNLOAD_QUEUE);
        let (reply, rx) = oneshot::channel();
        let frame = Frame::FileAction {
            request_id: request_id.clone(),
            data: FileAction {
                root,
                path,
                op: FileOp::Download { chunk_size },
            },
        };
        self.submit(Command::Download {
            request_id: request_id.clone(),
            timeout: self.rpc_timeout,
            frame,
            chunks: chunks_tx,
            reply,
        })
        .await?;

        let mut body = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            if body.len() as u64 + chunk.len() as u64 > max_size {
                let _ = self.commands.try_send(Command::Cancel { request_id });
                return Err(RelayError::Remote {
                    code: "FILE_TOO_LARGE".into(),
                    message: format!("download exceeds {max_size} bytes"),
                });
            }
            body.extend_from_slice(&chunk);
        }
        self.await_reply(request_id, self.rpc_timeout, rx).await?;
        Ok(body)
    }

    /// Bridge an accepted client socket to `port` on the agent.
    pub async fn open_stream(&self, port: u16, socket: TcpStream) -> Result<(), RelayError> {
        self.submit(Command::OpenStream { port, socket }).await
    }

    /// Start an interactive shell. Events arrive on the returned receiver,
    /// which closes after [`ShellEvent::Exit`] or when the channel closes.
    pub async fn start_shell(
        &self,
        shell_id: String,
    ) -> Result<mpsc::Receiver<ShellEvent>, RelayError> {
        let (events, rx) = mpsc::channel(SHELL_EVENT_QUEUE);
        let (reply, result) = oneshot::channel();
        self.submit(Command::StartShell {
            shell_id,
            events,
            reply,
        })
        .await?;
        result
            .await
            .map_err(|_| RelayError::ChannelLoss("channel closed".into()))??;
        Ok(rx)
    }

    pub async fn shell_input(&self, shell_id: String, data: Vec<u8>) -> Result<(), RelayError> {
        self.submit(Command::ShellInput { shell_id, data }).await
    }

    pub async fn kill_shell(&self, shell_id: String) -> Result<(), RelayError> {
        self.submit(Command::KillShell { shell_id }).await
    }

    /// Send a control frame such as `RELAY_SHUTDOWN`.
    pub async fn notify(&self, frame: Frame) -> Result<(), RelayError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Notify { frame, reply }).await?;
        rx.await
            .map_err(|_| RelayError::ChannelLoss("channel closed".into()))
    }

    pub async fn snapshot(&self) -> Result<ChannelSnapshot, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::Snapshot { reply }).await?;
        rx.await
            .map_err(|_| RelayError::ChannelLoss("channel closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    struct Harness {
        handle: ChannelHandle,
        inbound: mpsc::Sender<String>,
        outbound: mpsc::Receiver<Message>,
        task: JoinHandle<()>,
    }

    fn settings(rpc_timeout: Duration) -> ChannelSettings {
        ChannelSettings {
            rpc_timeout,
            streams: StreamSettings {
                queue_depth: 8,
                read_buffer: 1024,
                stall_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(2),
            },
            outbound_depth: 64,
        }
    }

    async fn start(rpc_timeout: Duration) -> Harness {
        let (channel, handle, mut outbound) = Channel::new(
            "A1".into(),
            1,
            &settings(rpc_timeout),
            Arc::new(AtomicU64::new(0)),
        );
        assert_eq!(handle.state(), ChannelState::Authenticating);
        channel.activate().await.unwrap();
        assert_eq!(
            outbound.recv().await.unwrap(),
            Message::Frame(Frame::HandshakeAck)
        );
        let (inbound, inbound_rx) = mpsc::channel(64);
        let task = tokio::spawn(channel.run(inbound_rx));
        Harness {
            handle,
            inbound,
            outbound,
            task,
        }
    }

    async fn next_out(h: &mut Harness) -> Message {
        tokio::time::timeout(Duration::from_secs(5), h.outbound.recv())
            .await
            .expect("frame in time")
            .expect("outbound open")
    }

    async fn reply(h: &Harness, response: RpcResponse) {
        h.inbound
            .send(Message::from(response).encode().unwrap())
            .await
            .unwrap();
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn exec_request(command: &str) -> ExecRequest {
        ExecRequest {
            command: command.into(),
            cwd: None,
            root: "/srv/site".into(),
            timeout_ms: None,
        }
    }

    #[test]
    fn test_state_transitions() {
        use ChannelState::{Active, Authenticating, Closed, Connected, Connecting};
        assert!(Connecting.can_advance(Connected));
        assert!(Authenticating.can_advance(Active));
        assert!(Authenticating.can_advance(Closed));
        assert!(!Closed.can_advance(Active));
        assert!(!Connecting.can_advance(Active));
        assert!(!Active.can_advance(Authenticating));
    }

    #[tokio::test]
    async fn test_call_resolves_once() {
        let mut h = start(Duration::from_secs(5)).await;
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.exec(exec_request("ls")).await });

        let Message::Frame(Frame::ExecCommand { request_id, data }) = next_out(&mut h).await
        else {
            panic!("expected EXEC_COMMAND");
        };
        assert_eq!(data.command, "ls");
        reply(&h, RpcResponse::success(&request_id, json!({"exitCode": 0}))).await;
        reply(&h, RpcResponse::error(&request_id, "X", "duplicate")).await;

        let value = call.await.unwrap().unwrap();
        assert_eq!(value["exitCode"], 0);
        assert_eq!(h.handle.snapshot().await.unwrap().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_close_channel() {
        let mut h = start(Duration::from_secs(5)).await;
        for junk in ["garbage", "[]", r#"{"type":"NOPE"}"#, r#"{"hello":1}"#] {
            h.inbound.send(junk.into()).await.unwrap();
        }
        h.inbound
            .send(
                Message::from(Frame::Heartbeat {
                    data: Metrics {
                        cpu: 3.5,
                        ..Metrics::default()
                    },
                })
                .encode()
                .unwrap(),
            )
            .await
            .unwrap();
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.state, ChannelState::Active);
        assert!((snap.metrics.unwrap().cpu - 3.5).abs() < f64::EPSILON);
        assert!(snap.last_heartbeat_secs.is_some());
        assert!(h.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_times_out_and_late_reply_is_dropped() {
        let mut h = start(Duration::from_millis(200)).await;
        let handle = h.handle.clone();
        let action = FileAction {
            root: "/srv".into(),
            path: "a".into(),
            op: FileOp::Checksum,
        };
        let call = tokio::spawn(async move { handle.file_action(action).await });
        let Message::Frame(Frame::FileAction { request_id, .. }) = next_out(&mut h).await else {
            panic!("expected FILE_ACTION");
        };
        assert!(matches!(call.await.unwrap(), Err(RelayError::Timeout(_))));
        reply(&h, RpcResponse::success(&request_id, json!(null))).await;
        assert_eq!(h.handle.snapshot().await.unwrap().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_remote_error_maps_to_variant() {
        let mut h = start(Duration::from_secs(5)).await;
        let handle = h.handle.clone();
        let call = tokio::spawn(async move { handle.exec(exec_request("cd ../../etc")).await });
        let Message::Frame(Frame::ExecCommand { request_id, .. }) = next_out(&mut h).await else {
            panic!("expected EXEC_COMMAND");
        };
        reply(
            &h,
            RpcResponse::error(&request_id, "JAIL_VIOLATION", "outside root"),
        )
        .await;
        assert!(matches!(
            call.await.unwrap(),
            Err(RelayError::JailViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_bridges_both_directions() {
        let mut h = start(Duration::from_secs(5)).await;
        let (mut client, server) = tcp_pair().await;
        h.handle.open_stream(22, server).await.unwrap();

        let Message::Frame(Frame::StreamOpen {
            connection_id,
            port,
        }) = next_out(&mut h).await
        else {
            panic!("expected STREAM_OPEN");
        };
        assert_eq!(port, 22);

        client.write_all(b"PING").await.unwrap();
        let Message::Frame(Frame::StreamData { data, .. }) = next_out(&mut h).await else {
            panic!("expected STREAM_DATA");
        };
        assert_eq!(decode_bytes(&data).unwrap(), b"PING");

        let pong = Frame::StreamData {
            connection_id: connection_id.clone(),
            data: encode_bytes(b"PONG"),
        };
        h.inbound
            .send(Message::from(pong).encode().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        // Client hangs up: exactly one STREAM_CLOSE goes to the agent.
        drop(client);
        assert_eq!(
            next_out(&mut h).await,
            Message::Frame(Frame::StreamClose {
                connection_id: connection_id.clone()
            })
        );
        // Agent's own close for the same id is a no-op.
        h.inbound
            .send(
                Message::from(Frame::StreamClose { connection_id })
                    .encode()
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(h.handle.snapshot().await.unwrap().streams.is_empty());
    }

    #[tokio::test]
    async fn test_close_cascades_to_streams_and_requests() {
        let mut h = start(Duration::from_secs(30)).await;

        let mut clients = Vec::new();
        for _ in 0..5 {
            let (client, server) = tcp_pair().await;
            h.handle.open_stream(8080, server).await.unwrap();
            clients.push(client);
        }
        let calls: Vec<_> = (0..3)
            .map(|i| {
                let handle = h.handle.clone();
                tokio::spawn(async move { handle.exec(exec_request(&format!("sleep {i}"))).await })
            })
            .collect();
        // Wait until all 8 frames went out so every call is registered.
        for _ in 0..8 {
            next_out(&mut h).await;
        }
        let snap = h.handle.snapshot().await.unwrap();
        assert_eq!(snap.streams.len(), 5);
        assert_eq!(snap.pending_requests, 3);

        h.handle.close();
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();

        for call in calls {
            assert!(matches!(
                call.await.unwrap(),
                Err(RelayError::ChannelLoss(_))
            ));
        }
        for client in &mut clients {
            let mut buf = [0u8; 1];
            let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert_eq!(h.handle.state(), ChannelState::Closed);
        assert!(matches!(
            h.handle.exec(exec_request("ls")).await,
            Err(RelayError::RouteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_events_are_routed() {
        let mut h = start(Duration::from_secs(5)).await;
        let mut events = h.handle.start_shell("s1".into()).await.unwrap();
        assert_eq!(
            next_out(&mut h).await,
            Message::Frame(Frame::StartShell {
                shell_id: "s1".into()
            })
        );
        assert!(matches!(
            h.handle.start_shell("s1".into()).await,
            Err(RelayError::Protocol(_))
        ));

        h.handle
            .shell_input("s1".into(), b"echo hi\n".to_vec())
            .await
            .unwrap();
        let Message::Frame(Frame::ShellInput { input, .. }) = next_out(&mut h).await else {
            panic!("expected SHELL_INPUT");
        };
        assert_eq!(decode_bytes(&input).unwrap(), b"echo hi\n");

        for frame in [
            Frame::ShellOutput {
                shell_id: "s1".into(),
                stream: OutputStream::Stdout,
                data: encode_bytes(b"hi\n"),
            },
            Frame::ShellExit {
                shell_id: "s1".into(),
                code: Some(0),
            },
        ] {
            h.inbound
                .send(Message::from(frame).encode().unwrap())
                .await
                .unwrap();
        }
        assert_eq!(
            events.recv().await,
            Some(ShellEvent::Output {
                stream: OutputStream::Stdout,
                data: b"hi\n".to_vec()
            })
        );
        assert_eq!(events.recv().await, Some(ShellEvent::Exit { code: Some(0) }));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_download_reassembles_chunks() {
        let mut h = start(Duration::from_secs(5)).await;
        let handle = h.handle.clone();
        let download = tokio::spawn(async move {
            handle
                .download("/srv".into(), "big.bin".into(), Some(3), 1024)
                .await
        });
        let Message::Frame(Frame::FileAction { request_id, data }) = next_out(&mut h).await else {
            panic!("expected FILE_ACTION");
        };
        assert_eq!(data.op, FileOp::Download { chunk_size: Some(3) });
        for (chunk, is_last) in [(&b"abc"[..], false), (b"de", true)] {
            let frame = Frame::FileChunk {
                request_id: request_id.clone(),
                data: encode_bytes(chunk),
                is_last,
            };
            h.inbound
                .send(Message::from(frame).encode().unwrap())
                .await
                .unwrap();
        }
        assert_eq!(download.await.unwrap().unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn test_download_outlives_timeout_while_chunks_flow() {
        let mut h = start(Duration::from_secs(1)).await;
        let handle = h.handle.clone();
        let download = tokio::spawn(async move {
            handle
                .download("/srv".into(), "slow.bin".into(), Some(1), 1024)
                .await
        });
        let Message::Frame(Frame::FileAction { request_id, .. }) = next_out(&mut h).await else {
            panic!("expected FILE_ACTION");
        };
        // Four chunks 600ms apart: 2.4s in total, each gap inside the 1s timeout.
        let chunks = [(&b"a"[..], false), (b"b", false), (b"c", false), (b"d", true)];
        for (chunk, is_last) in chunks {
            tokio::time::sleep(Duration::from_millis(600)).await;
            let frame = Frame::FileChunk {
                request_id: request_id.clone(),
                data: encode_bytes(chunk),
                is_last,
            };
            h.inbound
                .send(Message::from(frame).encode().unwrap())
                .await
                .unwrap();
        }
        assert_eq!(download.await.unwrap().unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_download_error_before_first_chunk() {
        let mut h = start(Duration::from_secs(5)).await;
        let handle = h.handle.clone();
        let download = tokio::spawn(async move {
            handle
                .download("/srv".into(), "missing".into(), None, 1024)
                .await
        });
        let Message::Frame(Frame::FileAction { request_id, .. }) = next_out(&mut h).await else {
            panic!("expected FILE_ACTION");
        };
        reply(&h, RpcResponse::error(&request_id, "NOT_FOUND", "missing")).await;
        let err = download.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}
