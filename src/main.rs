#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # revtun
//!
//! Reverse tunnel relay. Agents behind NAT dial one WebSocket to the master;
//! the master then reaches their TCP ports, shells and files through it.
//!
//! ## Subcommands
//!
//! - `revtun master`: agent endpoint, admin API, TCP forwarder, heartbeat sweep
//! - `revtun agent`: supervised tunnel client, shells, exec/file dispatch
//!
//! ## API surface (master)
//!
//! | Method | Path                              | Auth    | Description                     |
//! |--------|-----------------------------------|---------|---------------------------------|
//! | GET    | `/api/health`                     | No      | Liveness check                  |
//! | GET    | `/api/agents`                     | Yes     | Channel snapshots               |
//! | POST   | `/api/agents/{agentId}/exec`      | Yes     | One-shot command on the agent   |
//! | POST   | `/api/agents/{agentId}/files`     | Yes     | File action on the agent        |
//! | POST   | `/api/agents/{agentId}/download`  | Yes     | Chunked download                |
//! | GET    | `/api/agents/{agentId}/shell`     | Yes*    | Interactive shell WebSocket     |
//! | GET    | `/api/mappings`                   | Yes     | Mappings and listener status    |
//! | POST   | `/api/mappings`                   | Yes     | Create mapping                  |
//! | DELETE | `/api/mappings/{masterPort}`      | Yes     | Delete mapping                  |
//! | POST   | `/api/mappings/reload`            | Yes     | Re-read mapping file            |
//! | GET    | `/tunnel`                         | Agent   | Agent WebSocket                 |
//!
//! *WebSocket auth is via `?token=<key>`. Agents authenticate with
//! `x-agent-id` / `x-agent-secret` headers.
//!
//! ## Architecture
//!
//! ```text
//! main.rs         : entry point, clap subcommands, signals, shutdown order
//! auth.rs         : Bearer middleware, agent credential store
//! config.rs       : TOML + env-var configuration
//! error.rs        : RelayError taxonomy
//! jail.rs         : root-confined path resolution
//! state.rs        : MasterState
//! routes/         : admin API handlers
//! agent/          : exec, file and metrics handlers (agent side)
//! shell/          : process spawning, shell session bridge
//! tunnel/         : frames, channel actor, mux, registry, forwarder, client
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use revtun::config::Config;
use revtun::error::RelayError;
use revtun::routes;
use revtun::state::MasterState;
use revtun::tunnel::client::TunnelClient;
use revtun::tunnel::frame::Frame;

/// How long shutdown waits for agent connections to finish.
const CONNECTION_DRAIN: Duration = Duration::from_secs(5);

/// Reverse tunnel relay.
#[derive(Parser)]
#[command(name = "revtun", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master: agent endpoint, admin API and forwarder.
    Master {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run an agent that dials the master.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config_path, is_master) = match &cli.command {
        Commands::Master { config } => (config.as_deref(), true),
        Commands::Agent { config } => (config.as_deref(), false),
    };

    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("revtun: {e}");
            return ExitCode::FAILURE;
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    info!("revtun v{} starting", env!("CARGO_PKG_VERSION"));

    let result = if is_master {
        run_master(config).await
    } else {
        run_agent(config).await
    };
    match result {
        Ok(()) => {
            info!("Goodbye");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(code = e.code(), "{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_master(config: Config) -> Result<(), RelayError> {
    if config.master.admin_key == "change-me" {
        warn!("Using default admin key, set REVTUN_ADMIN_KEY or update config");
    }
    if config.master.agents.is_empty() {
        warn!("No [[master.agents]] configured, every tunnel will be refused");
    }

    let state = MasterState::new(config).await?;
    // A listener that cannot be bound at startup is fatal.
    let report = state.apply_mappings().await?;
    report.check()?;
    info!(listeners = report.added.len(), "Forwarder ready");

    let listener = TcpListener::bind(&state.config.master.listen)
        .await
        .map_err(|e| RelayError::Config(format!("bind {}: {e}", state.config.master.listen)))?;
    info!("Listening on {}", state.config.master.listen);

    let sweep_task = state.registry.spawn_heartbeat_sweep(
        Duration::from_secs(state.config.master.sweep_interval_secs.max(1)),
        state.config.master.heartbeat_timeout(),
    );

    let app = routes::router(state.clone());
    let shutdown_state = state.clone();
    let shutdown = async move {
        shutdown_signal().await;
        // Agents must hear RELAY_SHUTDOWN before their channels close.
        info!("Notifying agents of relay shutdown...");
        shutdown_state.registry.broadcast(&Frame::RelayShutdown).await;
        let drained = shutdown_state.registry.drain_all().await;
        info!(drained, "Channels closed");
        shutdown_state.forwarder.shutdown().await;
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Shutting down...");
    sweep_task.abort();
    state.connections.close();
    if tokio::time::timeout(CONNECTION_DRAIN, state.connections.wait())
        .await
        .is_err()
    {
        warn!(
            remaining = state.connections.len(),
            "Agent connections still open at exit"
        );
    }
    Ok(())
}

async fn run_agent(config: Config) -> Result<(), RelayError> {
    let client = TunnelClient::new(&config)?;
    let shutdown = CancellationToken::new();

    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { client.run(shutdown).await }
    });

    shutdown_signal().await;
    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = task.await {
        warn!("Tunnel client task failed: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received SIGINT");
    }
}
