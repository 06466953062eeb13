//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `REVTUN_ADMIN_KEY`, `REVTUN_LISTEN`,
//!    `REVTUN_AGENT_ID`, `REVTUN_AGENT_SECRET`, `REVTUN_AGENT_URL`
//! 2. **Config file**: path via `--config <path>`, or `revtun.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [master]
//! listen = "0.0.0.0:7070"
//! bind_host = "0.0.0.0"          # forwarder listeners
//! heartbeat_timeout_secs = 90
//! sweep_interval_secs = 30
//! rpc_timeout_secs = 60
//! mappings_path = "/var/lib/revtun/mappings.json"
//! admin_key = "admin-secret"
//!
//! [[master.agents]]
//! agent_id = "A1"
//! secret = "agent-secret"
//!
//! [agent]
//! url = "wss://master.example.com/tunnel"
//! agent_id = "A1"
//! secret = "agent-secret"
//! heartbeat_interval_secs = 30
//! idle_timeout_secs = 90
//!
//! [agent.reconnect]
//! strategy = "exponential"       # or "fixed"
//! initial_delay_secs = 5
//! max_delay_secs = 60
//! jitter = true
//!
//! [shell]
//! default_shell = "/bin/sh"
//!
//! [exec]
//! timeout_ms = 30000
//!
//! [files]
//! max_file_size = 8388608  # 8 MB
//! chunk_size = 65536
//!
//! [streams]
//! queue_depth = 64
//! read_buffer = 16384
//! stall_timeout_secs = 30
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::RelayError;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub master: MasterConfig,
    /// Present only on agent hosts.
    pub agent: Option<AgentConfig>,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub streams: StreamConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Master-side listener, liveness and routing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Socket address for the admin API and the `/tunnel` endpoint (default `0.0.0.0:7070`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Host the TCP forwarder binds mapping listeners on (default `0.0.0.0`).
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Seconds without any inbound traffic before a channel is stale (default 90).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds between staleness sweeps (default 30).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Default RPC deadline in seconds (default 60).
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// JSON file holding the persisted mapping set. No file means no mappings.
    pub mappings_path: Option<String>,
    /// Bearer token for `/api/*`. Override with `REVTUN_ADMIN_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_admin_key")]
    pub admin_key: String,
    /// Agents allowed to open a tunnel.
    #[serde(default)]
    pub agents: Vec<AgentCredential>,
}

/// One entry of the master's credential store.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentCredential {
    pub agent_id: String,
    pub secret: String,
}

/// Agent-side tunnel client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Master endpoint, e.g. `wss://master.example.com/tunnel`.
    pub url: String,
    pub agent_id: String,
    pub secret: String,
    /// Seconds between `HEARTBEAT` frames (default 30).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without any inbound traffic before the master is presumed
    /// dead and the agent reconnects (default 90). WebSocket pings go out
    /// every heartbeat interval, so a live master always answers in time.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Seconds to wait for `HANDSHAKE_ACK` after the upgrade (default 10).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Seconds allowed for the WebSocket dial and for local stream dials (default 10).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Host that `STREAM_OPEN` targets are dialled on (default `127.0.0.1`).
    #[serde(default = "default_stream_host")]
    pub stream_host: String,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// How the agent spaces out reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectStrategy {
    #[default]
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub strategy: ReconnectStrategy,
    /// First delay after a disconnect (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub initial_delay_secs: u64,
    /// Upper bound on the exponential delay (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub max_delay_secs: u64,
    /// Spread each delay uniformly over `[delay/2, delay]` (default true).
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Shell defaults for sessions and one-shot commands.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Shell binary (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub default_shell: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecConfig {
    /// Per-command timeout in milliseconds when the request has none (default 30 000).
    #[serde(default = "default_exec_timeout_ms")]
    pub timeout_ms: u64,
    /// Maximum captured bytes per output stream (default 1 MB).
    #[serde(default = "default_max_output")]
    pub max_output: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    /// Maximum file size for `read`/`write`/`upload` (default 8 MB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Default `FILE_CHUNK` payload size for downloads (default 64 KB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Stream multiplexer flow-control settings, shared by both ends.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Chunks buffered per stream before channel reads pause (default 64).
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Local socket read size in bytes (default 16 KB).
    #[serde(default = "default_read_buffer")]
    pub read_buffer: usize,
    /// Seconds a stream may refuse data before it is closed (default 30).
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:7070".to_string()
}
fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    90
}
fn default_sweep_interval() -> u64 {
    30
}
fn default_rpc_timeout() -> u64 {
    60
}
fn default_admin_key() -> String {
    "change-me".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    90
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_stream_host() -> String {
    "127.0.0.1".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_exec_timeout_ms() -> u64 {
    30000
}
fn default_max_output() -> usize {
    1024 * 1024 // 1 MB
}
fn default_max_file_size() -> u64 {
    8 * 1024 * 1024 // 8 MB
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_queue_depth() -> usize {
    64
}
fn default_read_buffer() -> usize {
    16 * 1024
}
fn default_stall_timeout() -> u64 {
    30
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            bind_host: default_bind_host(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            rpc_timeout_secs: default_rpc_timeout(),
            mappings_path: None,
            admin_key: default_admin_key(),
            agents: Vec::new(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: ReconnectStrategy::default(),
            initial_delay_secs: default_reconnect_delay(),
            max_delay_secs: default_reconnect_max_delay(),
            jitter: default_true(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
        }
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_exec_timeout_ms(),
            max_output: default_max_output(),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_depth: default_queue_depth(),
            read_buffer: default_read_buffer(),
            stall_timeout_secs: default_stall_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl StreamConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }
}

impl MasterConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `revtun.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, RelayError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("revtun.toml").exists() => {
                Self::from_file(Path::new("revtun.toml"))?
            }
            None => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, RelayError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| RelayError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse a TOML document without consulting the environment.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("REVTUN_ADMIN_KEY") {
            self.master.admin_key = key;
        }
        if let Ok(listen) = std::env::var("REVTUN_LISTEN") {
            self.master.listen = listen;
        }
        if let Some(agent) = self.agent.as_mut() {
            if let Ok(id) = std::env::var("REVTUN_AGENT_ID") {
                agent.agent_id = id;
            }
            if let Ok(secret) = std::env::var("REVTUN_AGENT_SECRET") {
                agent.secret = secret;
            }
            if let Ok(url) = std::env::var("REVTUN_AGENT_URL") {
                agent.url = url;
            }
        }
    }
}
