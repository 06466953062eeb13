//! Stream multiplexer: many TCP connections over one channel.
//!
//! A [`StreamTable`] belongs to exactly one channel actor. Each logical
//! stream gets a pump task that owns the local socket:
//!
//! ```text
//!   local socket ──read──▶ STREAM_DATA ──▶ outbound frame queue (bounded)
//!   local socket ◀─write── per-stream write queue (bounded) ◀── deliver()
//! ```
//!
//! Both directions apply backpressure: a pump stops reading its socket while
//! the outbound queue is full, and [`StreamTable::deliver`] waits for room
//! in the stream's queue. A stream that refuses data for longer than the
//! stall timeout is closed so it cannot hold up its siblings.
//!
//! The two directions end independently, like a TCP half-close. Local EOF
//! sends `STREAM_EOF` and the pump keeps writing; a remote `STREAM_EOF`
//! ([`StreamTable::half_close`]) flushes the queue, shuts down the socket's
//! write side and the pump keeps reading. Once both directions are done the
//! stream ends and `STREAM_CLOSE` removes it on both sides.
//!
//! Closing comes in two strengths. [`StreamTable::close`] (remote sent
//! `STREAM_CLOSE`) lets the pump flush what is already queued and then shut
//! the socket. [`StreamTable::close_all`] (channel teardown) cancels every
//! pump at once through the channel's cancellation token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use super::frame::{encode_bytes, Frame, Message};
use crate::config::StreamConfig;

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Chunks buffered toward the local socket.
    pub queue_depth: usize,
    pub read_buffer: usize,
    pub stall_timeout: Duration,
    /// Dial timeout for agent-side targets.
    pub connect_timeout: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &StreamConfig, connect_timeout: Duration) -> Self {
        Self {
            queue_depth: config.queue_depth.max(1),
            read_buffer: config.read_buffer.max(512),
            stall_timeout: config.stall_timeout(),
            connect_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Opening,
    Open,
    /// Remote sent `STREAM_EOF`; only local → remote data still flows.
    HalfClosed,
    /// Remote closed; the pump is flushing queued bytes.
    Closing,
}

/// How a stream's local leg is obtained.
pub enum Leg {
    /// Master side: the forwarder already accepted the client.
    Accepted(TcpStream),
    /// Agent side: dial the target.
    Dial { host: String, port: u16 },
}

#[derive(Debug)]
pub enum EndReason {
    /// Both directions reached EOF.
    LocalClosed,
    LocalError(String),
    Unreachable(String),
    Stalled,
    /// Write queue closed after a remote `STREAM_CLOSE` and fully flushed.
    Drained,
}

/// Reported by pumps to the owning actor.
#[derive(Debug)]
pub enum StreamEvent {
    Connected { connection_id: String },
    Ended { connection_id: String, reason: EndReason },
}

#[derive(Debug, Default)]
pub struct StreamCounters {
    /// Bytes written to the local socket.
    pub to_local: AtomicU64,
    /// Bytes read from the local socket.
    pub from_local: AtomicU64,
}

/// Diagnostics view of one stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub connection_id: String,
    pub port: u16,
    pub state: StreamState,
    pub bytes_to_local: u64,
    pub bytes_from_local: u64,
    pub age_secs: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Unknown, closing or already finished stream; the data is dropped.
    Dropped,
    /// The stream was closed for refusing data; tell the remote.
    Stalled,
}

struct StreamEntry {
    port: u16,
    state: StreamState,
    writer: Option<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
    /// Set by `STREAM_CLOSE`; tells a pump whose write side already ended
    /// to stop reading too.
    remote_closed: CancellationToken,
    counters: Arc<StreamCounters>,
    opened_at: Instant,
}

pub struct StreamTable {
    streams: HashMap<String, StreamEntry>,
    parent: CancellationToken,
    outbound: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<StreamEvent>,
    settings: StreamSettings,
}

impl StreamTable {
    /// `parent` is the owning channel's token; every pump runs under a child.
    pub fn new(
        parent: CancellationToken,
        outbound: mpsc::Sender<Message>,
        events: mpsc::UnboundedSender<StreamEvent>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            streams: HashMap::new(),
            parent,
            outbound,
            events,
            settings,
        }
    }

    /// Register a stream and start its pump. A reused `connection_id` is
    /// refused and the leg is dropped.
    pub fn open(&mut self, connection_id: String, port: u16, leg: Leg) -> bool {
        if self.streams.contains_key(&connection_id) {
            warn!(connection_id = %connection_id, "Duplicate stream id (ignored)");
            return false;
        }
        let (writer, write_rx) = mpsc::channel(self.settings.queue_depth);
        let cancel = self.parent.child_token();
        let remote_closed = CancellationToken::new();
        let counters = Arc::new(StreamCounters::default());

        let pump = Pump {
            connection_id: connection_id.clone(),
            write_rx,
            outbound: self.outbound.clone(),
            events: self.events.clone(),
            cancel: cancel.clone(),
            remote_closed: remote_closed.clone(),
            counters: Arc::clone(&counters),
            settings: self.settings.clone(),
        };
        let span = info_span!("stream", connection_id = %connection_id, port);
        tokio::spawn(pump.run(leg).instrument(span));

        self.streams.insert(
            connection_id,
            StreamEntry {
                port,
                state: StreamState::Opening,
                writer: Some(writer),
                cancel,
                remote_closed,
                counters,
                opened_at: Instant::now(),
            },
        );
        true
    }

    pub fn mark_open(&mut self, connection_id: &str) {
        if let Some(entry) = self.streams.get_mut(connection_id) {
            if entry.state == StreamState::Opening {
                entry.state = StreamState::Open;
            }
        }
    }

    /// Queue bytes for the stream's local socket, waiting for room up to the
    /// stall timeout.
    pub async fn deliver(&mut self, connection_id: &str, data: Vec<u8>) -> Delivery {
        let Some(writer) = self
            .streams
            .get(connection_id)
            .and_then(|e| e.writer.clone())
        else {
            debug!(connection_id, "Data for unknown or closing stream (dropped)");
            return Delivery::Dropped;
        };
        match writer.send_timeout(data, self.settings.stall_timeout).await {
            Ok(()) => Delivery::Delivered,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(connection_id, "Stream stalled, closing");
                if let Some(entry) = self.streams.remove(connection_id) {
                    entry.cancel.cancel();
                }
                Delivery::Stalled
            }
            // Pump already exited; its Ended event is on the way.
            Err(SendTimeoutError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// Remote reached EOF. Queued bytes are flushed, then the local socket's
    /// write side is shut down. Unknown, closing or already half-closed ids
    /// are a no-op.
    pub fn half_close(&mut self, connection_id: &str) -> bool {
        match self.streams.get_mut(connection_id) {
            Some(entry) if matches!(entry.state, StreamState::Opening | StreamState::Open) => {
                entry.state = StreamState::HalfClosed;
                // Dropping the sender ends the pump's write direction once drained.
                entry.writer = None;
                true
            }
            _ => false,
        }
    }

    /// Remote asked to close. Idempotent: unknown or closing ids are a no-op.
    pub fn close(&mut self, connection_id: &str) -> bool {
        match self.streams.get_mut(connection_id) {
            Some(entry) if entry.state != StreamState::Closing => {
                entry.state = StreamState::Closing;
                entry.remote_closed.cancel();
                // Dropping the sender lets the pump drain and then exit.
                entry.writer = None;
                true
            }
            _ => false,
        }
    }

    /// A pump ended. Returns `true` when the remote still believes the
    /// stream is open and must be sent `STREAM_CLOSE`.
    pub fn finished(&mut self, connection_id: &str) -> bool {
        match self.streams.remove(connection_id) {
            Some(entry) => {
                entry.cancel.cancel();
                entry.state != StreamState::Closing
            }
            None => false,
        }
    }

    /// Hard-cancel every stream. Used on channel teardown.
    pub fn close_all(&mut self) -> usize {
        let count = self.streams.len();
        for (_, entry) in self.streams.drain() {
            entry.cancel.cancel();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn snapshot(&self) -> Vec<StreamInfo> {
        let mut infos: Vec<StreamInfo> = self
            .streams
            .iter()
            .map(|(id, e)| StreamInfo {
                connection_id: id.clone(),
                port: e.port,
                state: e.state,
                bytes_to_local: e.counters.to_local.load(Ordering::Relaxed),
                bytes_from_local: e.counters.from_local.load(Ordering::Relaxed),
                age_secs: e.opened_at.elapsed().as_secs(),
            })
            .collect();
        infos.sort_by(|a, b| a.connection_id.cmp(&b.connection_id));
        infos
    }
}

struct Pump {
    connection_id: String,
    write_rx: mpsc::Receiver<Vec<u8>>,
    outbound: mpsc::Sender<Message>,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: CancellationToken,
    remote_closed: CancellationToken,
    counters: Arc<StreamCounters>,
    settings: StreamSettings,
}

impl Pump {
    async fn run(mut self, leg: Leg) {
        let socket = match leg {
            Leg::Accepted(socket) => socket,
            Leg::Dial { host, port } => {
                let dial = tokio::time::timeout(
                    self.settings.connect_timeout,
                    TcpStream::connect((host.as_str(), port)),
                );
                let result = tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => return,
                    r = dial => r,
                };
                match result {
                    Ok(Ok(socket)) => socket,
                    Ok(Err(e)) => return self.end(EndReason::Unreachable(e.to_string())),
                    Err(_) => return self.end(EndReason::Unreachable("connect timed out".into())),
                }
            }
        };
        let _ = socket.set_nodelay(true);
        let _ = self.events.send(StreamEvent::Connected {
            connection_id: self.connection_id.clone(),
        });

        let (mut reader, mut writer) = socket.into_split();
        let mut buf = vec![0u8; self.settings.read_buffer];
        let mut read_done = false;
        let mut write_done = false;
        let reason = loop {
            if read_done && write_done {
                break EndReason::LocalClosed;
            }
            tokio::select! {
                biased;
                // Hard cancel: the socket halves drop with this future.
                () = self.cancel.cancelled() => return,
                () = self.remote_closed.cancelled(), if write_done => break EndReason::Drained,
                chunk = self.write_rx.recv(), if !write_done => {
                    let Some(data) = chunk else {
                        if self.remote_closed.is_cancelled() {
                            break EndReason::Drained;
                        }
                        // Remote EOF: pass it on and keep reading.
                        if let Err(e) = writer.shutdown().await {
                            break EndReason::LocalError(e.to_string());
                        }
                        write_done = true;
                        continue;
                    };
                    let write = tokio::time::timeout(self.settings.stall_timeout, writer.write_all(&data));
                    match write.await {
                        Ok(Ok(())) => {
                            self.counters.to_local.fetch_add(data.len() as u64, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => break EndReason::LocalError(e.to_string()),
                        Err(_) => break EndReason::Stalled,
                    }
                }
                read = reader.read(&mut buf), if !read_done => {
                    let frame = match read {
                        Ok(0) => {
                            read_done = true;
                            Frame::StreamEof {
                                connection_id: self.connection_id.clone(),
                            }
                        }
                        Ok(n) => {
                            self.counters.from_local.fetch_add(n as u64, Ordering::Relaxed);
                            Frame::StreamData {
                                connection_id: self.connection_id.clone(),
                                data: encode_bytes(&buf[..n]),
                            }
                        }
                        Err(e) => break EndReason::LocalError(e.to_string()),
                    };
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return,
                        sent = self.outbound.send(frame.into()) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        };
        if !write_done {
            let _ = writer.shutdown().await;
        }
        self.end(reason);
    }

    fn end(self, reason: EndReason) {
        debug!(
            ?reason,
            to_local = self.counters.to_local.load(Ordering::Relaxed),
            from_local = self.counters.from_local.load(Ordering::Relaxed),
            "Stream ended"
        );
        let _ = self.events.send(StreamEvent::Ended {
            connection_id: self.connection_id,
            reason,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::frame::decode_bytes;
    use tokio::net::TcpListener;

    struct Harness {
        table: StreamTable,
        parent: CancellationToken,
        out_rx: mpsc::Receiver<Message>,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    }

    fn harness() -> Harness {
        let parent = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::channel(64);
        let (ev_tx, events) = mpsc::unbounded_channel();
        let settings = StreamSettings {
            queue_depth: 8,
            read_buffer: 1024,
            stall_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
        };
        Harness {
            table: StreamTable::new(parent.clone(), out_tx, ev_tx, settings),
            parent,
            out_rx,
            events,
        }
    }

    async fn next_event(h: &mut Harness) -> StreamEvent {
        tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .expect("event in time")
            .expect("events open")
    }

    async fn dial_target(h: &mut Harness, id: &str) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(h.table.open(
            id.into(),
            port,
            Leg::Dial {
                host: "127.0.0.1".into(),
                port
            }
        ));
        let (socket, _) = listener.accept().await.unwrap();
        match next_event(h).await {
            StreamEvent::Connected { connection_id } => {
                assert_eq!(connection_id, id);
                h.table.mark_open(&connection_id);
            }
            other => panic!("unexpected {other:?}"),
        }
        socket
    }

    async fn read_exact_n(socket: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_stream_isolation() {
        let mut h = harness();
        let mut a = dial_target(&mut h, "A").await;
        let mut b = dial_target(&mut h, "B").await;

        assert_eq!(h.table.deliver("A", b"aaaa".to_vec()).await, Delivery::Delivered);
        assert_eq!(h.table.deliver("B", b"bb".to_vec()).await, Delivery::Delivered);
        assert_eq!(h.table.deliver("A", b"AA".to_vec()).await, Delivery::Delivered);
        assert_eq!(read_exact_n(&mut a, 6).await, b"aaaaAA");
        assert_eq!(read_exact_n(&mut b, 2).await, b"bb");

        b.write_all(b"from-b").await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(5), h.out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Frame(Frame::StreamData { connection_id, data }) = msg else {
            panic!("unexpected {msg:?}");
        };
        assert_eq!(connection_id, "B");
        assert_eq!(decode_bytes(&data).unwrap(), b"from-b");

        let info = h.table.snapshot();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].connection_id, "A");
        assert_eq!(info[0].state, StreamState::Open);
        h.table.close_all();
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_drains() {
        let mut h = harness();
        let mut a = dial_target(&mut h, "A").await;

        assert_eq!(h.table.deliver("A", b"last words".to_vec()).await, Delivery::Delivered);
        assert!(h.table.close("A"));
        assert!(!h.table.close("A"));
        assert!(!h.table.close("nope"));
        assert_eq!(h.table.deliver("A", b"late".to_vec()).await, Delivery::Dropped);

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), a.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"last words");

        match next_event(&mut h).await {
            StreamEvent::Ended { connection_id, reason } => {
                assert!(matches!(reason, EndReason::Drained));
                // Remote initiated the close, so nothing is owed back.
                assert!(!h.table.finished(&connection_id));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.table.is_empty());
    }

    async fn next_frame(h: &mut Harness) -> Frame {
        let msg = tokio::time::timeout(Duration::from_secs(5), h.out_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            Message::Frame(frame) => frame,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_close_reports_once() {
        let mut h = harness();
        let a = dial_target(&mut h, "A").await;
        drop(a);
        assert_eq!(
            next_frame(&mut h).await,
            Frame::StreamEof {
                connection_id: "A".into()
            }
        );
        // The write direction stays open until the remote finishes too.
        assert!(h.table.half_close("A"));
        assert!(!h.table.half_close("A"));
        match next_event(&mut h).await {
            StreamEvent::Ended { connection_id, reason } => {
                assert!(matches!(reason, EndReason::LocalClosed));
                assert!(h.table.finished(&connection_id));
                assert!(!h.table.finished(&connection_id));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_half_close_keeps_reverse_direction() {
        let mut h = harness();
        let mut a = dial_target(&mut h, "A").await;

        assert_eq!(h.table.deliver("A", b"request".to_vec()).await, Delivery::Delivered);
        assert!(h.table.half_close("A"));
        assert_eq!(h.table.snapshot()[0].state, StreamState::HalfClosed);

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), a.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"request");

        // The target answers after seeing EOF, then closes.
        a.write_all(b"reply").await.unwrap();
        drop(a);
        let Frame::StreamData { data, .. } = next_frame(&mut h).await else {
            panic!("expected STREAM_DATA");
        };
        assert_eq!(decode_bytes(&data).unwrap(), b"reply");
        assert!(matches!(next_frame(&mut h).await, Frame::StreamEof { .. }));
        match next_event(&mut h).await {
            StreamEvent::Ended { connection_id, reason } => {
                assert!(matches!(reason, EndReason::LocalClosed));
                assert!(h.table.finished(&connection_id));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(h.table.is_empty());
    }

    #[tokio::test]
    async fn test_close_after_local_eof_ends_pump() {
        let mut h = harness();
        let mut a = dial_target(&mut h, "A").await;
        a.shutdown().await.unwrap();
        assert!(matches!(next_frame(&mut h).await, Frame::StreamEof { .. }));

        assert!(h.table.close("A"));
        match next_event(&mut h).await {
            StreamEvent::Ended { connection_id, reason } => {
                assert!(matches!(reason, EndReason::Drained));
                assert!(!h.table.finished(&connection_id));
            }
            other => panic!("unexpected {other:?}"),
        }
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), a.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_unreachable_target() {
        let mut h = harness();
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        h.table.open(
            "X".into(),
            port,
            Leg::Dial {
                host: "127.0.0.1".into(),
                port,
            },
        );
        match next_event(&mut h).await {
            StreamEvent::Ended { connection_id, reason } => {
                assert!(matches!(reason, EndReason::Unreachable(_)));
                assert!(h.table.finished(&connection_id));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_id_refused() {
        let mut h = harness();
        let _a = dial_target(&mut h, "A").await;
        assert!(!h.table.open(
            "A".into(),
            1,
            Leg::Dial {
                host: "127.0.0.1".into(),
                port: 1
            }
        ));
        assert_eq!(h.table.len(), 1);
        h.table.close_all();
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_every_socket() {
        let mut h = harness();
        let mut sockets = Vec::new();
        for id in ["A", "B", "C"] {
            sockets.push(dial_target(&mut h, id).await);
        }
        h.parent.cancel();
        for socket in &mut sockets {
            let mut buf = [0u8; 8];
            let n = tokio::time::timeout(Duration::from_secs(5), socket.read(&mut buf))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_eq!(n, 0);
        }
        assert_eq!(h.table.close_all(), 3);
    }
}
