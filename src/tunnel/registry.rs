//! Channel Registry: `agentId` → the one live [`ChannelHandle`].
//!
//! The registry is the only process-wide mutable state on the master. All
//! check-then-act sequences (supersede on reconnect, stale sweep) happen
//! under a single write lock so two callers can never both act on the same
//! entry.
//!
//! Every accepted connection gets a fresh generation number. A connection
//! task removes its entry with [`ChannelRegistry::remove`] passing its own
//! generation, so a superseded task can never evict its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::channel::ChannelHandle;
use super::frame::Frame;

#[derive(Clone)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, ChannelHandle>>>,
    /// Process epoch for lock-free last-seen timestamps.
    epoch: Instant,
    generation: Arc<AtomicU64>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            epoch: Instant::now(),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Milliseconds since the registry was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A last-seen clock for a new channel, starting at "now".
    pub fn new_clock(&self) -> Arc<AtomicU64> {
        Arc::new(AtomicU64::new(self.now_ms()))
    }

    /// Install `handle` as the channel for its agent. A previous channel for
    /// the same agent is closed and returned.
    pub async fn insert(&self, handle: ChannelHandle) -> Option<ChannelHandle> {
        let agent_id = handle.agent_id().to_string();
        let previous = self.channels.write().await.insert(agent_id, handle);
        if let Some(old) = &previous {
            warn!(
                agent_id = %old.agent_id(),
                generation = old.generation(),
                "Agent reconnected while a channel exists, closing the old one"
            );
            old.close();
        }
        previous
    }

    /// Remove the entry for `agent_id` only if it is still `generation`.
    pub async fn remove(&self, agent_id: &str, generation: u64) -> bool {
        let mut channels = self.channels.write().await;
        match channels.get(agent_id) {
            Some(current) if current.generation() == generation => {
                channels.remove(agent_id);
                true
            }
            _ => false,
        }
    }

    /// The agent's channel, if it is active.
    pub async fn get(&self, agent_id: &str) -> Option<ChannelHandle> {
        self.channels
            .read()
            .await
            .get(agent_id)
            .filter(|h| h.is_active())
            .cloned()
    }

    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.get(agent_id).await.is_some()
    }

    /// Every registered channel, sorted by agent id.
    pub async fn list(&self) -> Vec<ChannelHandle> {
        let mut handles: Vec<ChannelHandle> =
            self.channels.read().await.values().cloned().collect();
        handles.sort_by(|a, b| a.agent_id().cmp(b.agent_id()));
        handles
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }

    /// Close and remove channels with no inbound traffic for `timeout`.
    /// Returns the evicted agent ids.
    ///
    /// Single write-lock pass with atomic last-seen reads, so traffic that
    /// lands mid-sweep cannot race an eviction.
    pub async fn sweep_stale(&self, timeout: Duration) -> Vec<String> {
        let timeout_ms = timeout.as_millis() as u64;
        let now_ms = self.now_ms();
        let mut channels = self.channels.write().await;

        let stale: Vec<String> = channels
            .iter()
            .filter(|(_, h)| now_ms.saturating_sub(h.last_seen_ms()) > timeout_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in &stale {
            if let Some(handle) = channels.remove(agent_id) {
                handle.close();
                warn!(agent_id = %agent_id, "Evicted agent (heartbeat timeout)");
            }
        }
        stale
    }

    /// Run [`Self::sweep_stale`] every `every` until the task is aborted.
    pub fn spawn_heartbeat_sweep(&self, every: Duration, timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let evicted = registry.sweep_stale(timeout).await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "Heartbeat sweep evicted agents");
                }
            }
        })
    }

    /// Send a control frame to every active channel. Channels that cannot
    /// take it are closed and removed.
    pub async fn broadcast(&self, frame: &Frame) {
        let mut dead = Vec::new();
        for handle in self.list().await {
            if handle.notify(frame.clone()).await.is_err() {
                warn!(agent_id = %handle.agent_id(), "Broadcast failed, evicting");
                dead.push(handle);
            }
        }
        for handle in dead {
            handle.close();
            self.remove(handle.agent_id(), handle.generation()).await;
        }
    }

    /// Close every channel and clear the registry. Used at shutdown.
    pub async fn drain_all(&self) -> usize {
        let mut channels = self.channels.write().await;
        let count = channels.len();
        for (agent_id, handle) in channels.drain() {
            handle.close();
            info!(agent_id = %agent_id, "Closed channel for relay shutdown");
        }
        count
    }
}
