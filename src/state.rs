//! Master application state shared by every handler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

use crate::auth::AgentCredentials;
use crate::config::Config;
use crate::error::RelayError;
use crate::tunnel::channel::ChannelSettings;
use crate::tunnel::forwarder::{ReloadReport, TcpForwarder};
use crate::tunnel::mapping::{MappingStore, TunnelMapping};
use crate::tunnel::mux::StreamSettings;
use crate::tunnel::registry::ChannelRegistry;

const OUTBOUND_QUEUE: usize = 256;

/// Passed to handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct MasterState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    pub registry: ChannelRegistry,
    pub forwarder: Arc<TcpForwarder>,
    pub mappings: Arc<MappingStore>,
    pub credentials: Arc<AgentCredentials>,
    pub channel_settings: ChannelSettings,
    /// Live agent connection tasks, awaited on shutdown.
    pub connections: TaskTracker,
    /// Monotonic instant when the master started (for uptime).
    pub start_time: Instant,
    /// Held from a mapping write until the forwarder has applied it, so
    /// reloads land in the order their writes did.
    mapping_writes: Arc<Mutex<()>>,
}

impl MasterState {
    /// Build the state and load the persisted mapping set. Listeners are
    /// not bound until the caller runs the first reload.
    pub async fn new(config: Config) -> Result<Self, RelayError> {
        let registry = ChannelRegistry::new();
        let mappings = MappingStore::open(config.master.mappings_path.as_ref().map(PathBuf::from)).await?;
        let channel_settings = ChannelSettings {
            rpc_timeout: config.master.rpc_timeout(),
            // The master never dials; connect_timeout only applies on agents.
            streams: StreamSettings::from_config(&config.streams, Duration::ZERO),
            outbound_depth: OUTBOUND_QUEUE,
        };
        Ok(Self {
            forwarder: Arc::new(TcpForwarder::new(
                config.master.bind_host.clone(),
                registry.clone(),
            )),
            credentials: Arc::new(AgentCredentials::new(&config.master.agents)),
            mappings: Arc::new(mappings),
            registry,
            channel_settings,
            connections: TaskTracker::new(),
            start_time: Instant::now(),
            mapping_writes: Arc::new(Mutex::new(())),
            config: Arc::new(config),
        })
    }

    /// Re-apply the store's active mappings to the forwarder.
    pub async fn apply_mappings(&self) -> Result<ReloadReport, RelayError> {
        let _writes = self.mapping_writes.lock().await;
        let active = self.mappings.active().await;
        self.forwarder.reload(&active).await
    }

    /// Validate and persist `mapping`, then reload the forwarder.
    pub async fn create_mapping(&self, mapping: TunnelMapping) -> Result<ReloadReport, RelayError> {
        let _writes = self.mapping_writes.lock().await;
        let active = self.mappings.create(mapping, &self.credentials).await?;
        self.forwarder.reload(&active).await
    }

    /// Delete the mappings on `master_port`, then reload. `None` when there
    /// was nothing to delete.
    pub async fn delete_mapping(
        &self,
        master_port: u16,
    ) -> Result<Option<(usize, ReloadReport)>, RelayError> {
        let _writes = self.mapping_writes.lock().await;
        let (removed, active) = self.mappings.delete(master_port).await?;
        if removed == 0 {
            return Ok(None);
        }
        let report = self.forwarder.reload(&active).await?;
        Ok(Some((removed, report)))
    }

    /// Re-read the mapping file and reload. Returns the active count.
    pub async fn reload_mappings(&self) -> Result<(usize, ReloadReport), RelayError> {
        let _writes = self.mapping_writes.lock().await;
        let active = self.mappings.reread().await?;
        let report = self.forwarder.reload(&active).await?;
        Ok((active.len(), report))
    }
}
