//! TCP Forwarder: one listener per active mapping.
//!
//! Each accepted client becomes a logical stream on the target agent's
//! channel. When the agent has no active channel the client is closed
//! straight away.
//!
//! [`TcpForwarder::reload`] applies a new mapping set as a diff: removed
//! ports stop first, retargeted ports swap their target in place, unchanged
//! ports keep running, and added ports start. Each new port binds on its
//! own; one that fails is reported in [`ReloadReport::failed`] and retried
//! on the next reload, without holding back the rest of the diff.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::mapping::TunnelMapping;
use super::registry::ChannelRegistry;
use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    agent_id: String,
    agent_port: u16,
}

struct ActiveListener {
    target: watch::Sender<Target>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// What a reload changed, by master port.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub added: Vec<u16>,
    pub removed: Vec<u16>,
    pub updated: Vec<u16>,
    pub unchanged: Vec<u16>,
    pub failed: Vec<BindFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BindFailure {
    pub master_port: u16,
    pub error: String,
}

impl ReloadReport {
    /// The bind error for `port`, if that port failed in this reload.
    pub fn failure(&self, port: u16) -> Option<RelayError> {
        self.failed
            .iter()
            .find(|f| f.master_port == port)
            .map(BindFailure::to_error)
    }

    /// `Err` with the first bind failure, if any port failed.
    pub fn check(&self) -> Result<(), RelayError> {
        self.failed.first().map_or(Ok(()), |f| Err(f.to_error()))
    }
}

impl BindFailure {
    fn to_error(&self) -> RelayError {
        RelayError::Bind {
            port: self.master_port,
            reason: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub master_port: u16,
    pub local_addr: String,
    pub agent_id: String,
    pub agent_port: u16,
    pub agent_online: bool,
}

pub struct TcpForwarder {
    bind_host: String,
    registry: ChannelRegistry,
    /// Also serializes reloads.
    listeners: Mutex<HashMap<u16, ActiveListener>>,
    shutdown: CancellationToken,
}

impl TcpForwarder {
    pub fn new(bind_host: String, registry: ChannelRegistry) -> Self {
        Self {
            bind_host,
            registry,
            listeners: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Make the listener set match the active entries of `mappings`.
    pub async fn reload(&self, mappings: &[TunnelMapping]) -> Result<ReloadReport, RelayError> {
        let mut desired = BTreeMap::new();
        for m in mappings.iter().filter(|m| m.is_active) {
            let target = Target {
                agent_id: m.agent_id.clone(),
                agent_port: m.agent_port,
            };
            if desired.insert(m.master_port, target).is_some() {
                return Err(RelayError::PortConflict(m.master_port));
            }
        }

        let mut listeners = self.listeners.lock().await;
        let mut report = ReloadReport::default();

        let stale: Vec<u16> = listeners
            .keys()
            .filter(|port| !desired.contains_key(port))
            .copied()
            .collect();
        for port in stale {
            if let Some(active) = listeners.remove(&port) {
                active.cancel.cancel();
                let _ = active.task.await;
                report.removed.push(port);
            }
        }

        for (&port, target) in &desired {
            if let Some(active) = listeners.get(&port) {
                if active.target.send_if_modified(|current| {
                    let changed = current != target;
                    if changed {
                        current.clone_from(target);
                    }
                    changed
                }) {
                    report.updated.push(port);
                } else {
                    report.unchanged.push(port);
                }
                continue;
            }

            let listener = match TcpListener::bind((self.bind_host.as_str(), port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    warn!(master_port = port, "Bind failed: {e}");
                    report.failed.push(BindFailure {
                        master_port: port,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let local_addr = listener.local_addr()?;
            let (target_tx, target_rx) = watch::channel(target.clone());
            let cancel = self.shutdown.child_token();
            let span = info_span!("forwarder", master_port = port);
            let task = tokio::spawn(
                accept_loop(listener, target_rx, self.registry.clone(), cancel.clone())
                    .instrument(span),
            );
            listeners.insert(
                port,
                ActiveListener {
                    target: target_tx,
                    local_addr,
                    cancel,
                    task,
                },
            );
            report.added.push(port);
        }
        report.removed.sort_unstable();
        report.updated.sort_unstable();
        report.unchanged.sort_unstable();

        info!(
            added = ?report.added,
            removed = ?report.removed,
            updated = ?report.updated,
            failed = report.failed.len(),
            "Forwarder reloaded"
        );
        Ok(report)
    }

    pub async fn status(&self) -> Vec<ListenerStatus> {
        let snapshot: Vec<(u16, SocketAddr, Target)> = {
            let listeners = self.listeners.lock().await;
            listeners
                .iter()
                .map(|(port, l)| (*port, l.local_addr, l.target.borrow().clone()))
                .collect()
        };
        let mut out = Vec::with_capacity(snapshot.len());
        for (port, addr, target) in snapshot {
            out.push(ListenerStatus {
                master_port: port,
                local_addr: addr.to_string(),
                agent_online: self.registry.is_active(&target.agent_id).await,
                agent_id: target.agent_id,
                agent_port: target.agent_port,
            });
        }
        out.sort_by_key(|s| s.master_port);
        out
    }

    pub async fn bound_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Stop every listener.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut listeners = self.listeners.lock().await;
        for (_, active) in listeners.drain() {
            let _ = active.task.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    target: watch::Receiver<Target>,
    registry: ChannelRegistry,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        let Target {
            agent_id,
            agent_port,
        } = target.borrow().clone();
        let Some(channel) = registry.get(&agent_id).await else {
            info!(%peer, agent_id = %agent_id, "Agent offline, closing client");
            continue;
        };
        match channel.open_stream(agent_port, socket).await {
            Ok(()) => debug!(%peer, agent_id = %agent_id, agent_port, "Client bridged"),
            Err(e) => info!(%peer, agent_id = %agent_id, "Could not open stream: {e}"),
        }
    }
    debug!("Listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::channel::{Channel, ChannelHandle, ChannelSettings};
    use crate::tunnel::frame::{Frame, Message};
    use crate::tunnel::mux::StreamSettings;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    async fn free_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    fn mapping(master_port: u16, agent_port: u16) -> TunnelMapping {
        TunnelMapping {
            agent_id: "A1".into(),
            master_port,
            agent_port,
            description: String::new(),
            is_active: true,
        }
    }

    async fn connected_agent(
        registry: &ChannelRegistry,
    ) -> (ChannelHandle, mpsc::Receiver<Message>, mpsc::Sender<String>) {
        let settings = ChannelSettings {
            rpc_timeout: Duration::from_secs(5),
            streams: StreamSettings {
                queue_depth: 4,
                read_buffer: 512,
                stall_timeout: Duration::from_secs(1),
                connect_timeout: Duration::from_secs(1),
            },
            outbound_depth: 16,
        };
        let (channel, handle, mut outbound) = Channel::new(
            "A1".into(),
            registry.next_generation(),
            &settings,
            registry.new_clock(),
        );
        registry.insert(handle.clone()).await;
        channel.activate().await.unwrap();
        outbound.recv().await.unwrap();
        let (inbound, inbound_rx) = mpsc::channel(16);
        tokio::spawn(channel.run(inbound_rx));
        (handle, outbound, inbound)
    }

    async fn expect_closed(port: u16) {
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_reload_applies_diff() {
        let fwd = TcpForwarder::new("127.0.0.1".into(), ChannelRegistry::new());
        let (p1, p2, p3) = (free_port().await, free_port().await, free_port().await);

        let report = fwd.reload(&[mapping(p1, 22), mapping(p2, 80)]).await.unwrap();
        let mut added = vec![p1, p2];
        added.sort_unstable();
        assert_eq!(report.added, added);

        let report = fwd
            .reload(&[mapping(p2, 8080), mapping(p3, 443)])
            .await
            .unwrap();
        assert_eq!(report.removed, vec![p1]);
        assert_eq!(report.updated, vec![p2]);
        assert_eq!(report.added, vec![p3]);
        assert!(TcpStream::connect(("127.0.0.1", p1)).await.is_err());

        let report = fwd
            .reload(&[mapping(p2, 8080), mapping(p3, 443)])
            .await
            .unwrap();
        assert!(report.added.is_empty() && report.removed.is_empty());
        let mut unchanged = vec![p2, p3];
        unchanged.sort_unstable();
        assert_eq!(report.unchanged, unchanged);
        fwd.shutdown().await;
        assert!(fwd.bound_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported_per_port() {
        let fwd = TcpForwarder::new("127.0.0.1".into(), ChannelRegistry::new());
        let keep = free_port().await;
        fwd.reload(&[mapping(keep, 22)]).await.unwrap();

        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();
        let fresh = free_port().await;

        let report = fwd
            .reload(&[mapping(keep, 22), mapping(fresh, 1), mapping(taken, 2)])
            .await
            .unwrap();
        assert_eq!(report.added, vec![fresh]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(
            report.failure(taken),
            Some(RelayError::Bind { port, .. }) if port == taken
        ));
        assert!(report.check().is_err());
        let mut bound = vec![keep, fresh];
        bound.sort_unstable();
        assert_eq!(fwd.bound_ports().await, bound);

        // Freed ports are picked up by the next reload.
        drop(blocker);
        let report = fwd
            .reload(&[mapping(keep, 22), mapping(fresh, 1), mapping(taken, 2)])
            .await
            .unwrap();
        assert_eq!(report.added, vec![taken]);
        assert!(report.check().is_ok());
        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_removal_survives_unbindable_port() {
        let fwd = TcpForwarder::new("127.0.0.1".into(), ChannelRegistry::new());
        let (p1, p2) = (free_port().await, free_port().await);
        fwd.reload(&[mapping(p1, 22), mapping(p2, 80)]).await.unwrap();

        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let p3 = blocker.local_addr().unwrap().port();

        let report = fwd.reload(&[mapping(p1, 22), mapping(p3, 443)]).await.unwrap();
        assert_eq!(report.removed, vec![p2]);
        assert!(matches!(
            report.failure(p3),
            Some(RelayError::Bind { port, .. }) if port == p3
        ));
        assert_eq!(fwd.bound_ports().await, vec![p1]);
        assert!(TcpStream::connect(("127.0.0.1", p2)).await.is_err());
        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_ports_rejected() {
        let fwd = TcpForwarder::new("127.0.0.1".into(), ChannelRegistry::new());
        let p = free_port().await;
        assert!(matches!(
            fwd.reload(&[mapping(p, 1), mapping(p, 2)]).await,
            Err(RelayError::PortConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_agent_closes_client() {
        let fwd = TcpForwarder::new("127.0.0.1".into(), ChannelRegistry::new());
        let p = free_port().await;
        fwd.reload(&[mapping(p, 22)]).await.unwrap();
        expect_closed(p).await;
        let status = fwd.status().await;
        assert!(!status[0].agent_online);
        fwd.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_opens_stream_on_current_target() {
        let registry = ChannelRegistry::new();
        let (_handle, mut outbound, _inbound) = connected_agent(&registry).await;
        let fwd = TcpForwarder::new("127.0.0.1".into(), registry);
        let p = free_port().await;

        fwd.reload(&[mapping(p, 22)]).await.unwrap();
        let _c1 = TcpStream::connect(("127.0.0.1", p)).await.unwrap();
        let Some(Message::Frame(Frame::StreamOpen { port, .. })) = outbound.recv().await else {
            panic!("expected STREAM_OPEN");
        };
        assert_eq!(port, 22);

        fwd.reload(&[mapping(p, 2022)]).await.unwrap();
        let _c2 = TcpStream::connect(("127.0.0.1", p)).await.unwrap();
        let Some(Message::Frame(Frame::StreamOpen { port, .. })) = outbound.recv().await else {
            panic!("expected STREAM_OPEN");
        };
        assert_eq!(port, 2022);
        assert!(fwd.status().await[0].agent_online);
        fwd.shutdown().await;
    }
}
