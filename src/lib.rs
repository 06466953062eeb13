#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! revtun library: the building blocks of both the master and the agent.
//!
//! - `tunnel`: wire frames, channel actor, stream mux, registry, forwarder, client
//! - `routes`: admin HTTP API handlers and the master router
//! - `agent`: exec, file and metrics handlers run on agents
//! - `shell`: process spawning and the shell session bridge
//! - `jail`: root-confined path resolution
//! - `auth`: admin Bearer middleware and agent credentials
//! - `config`: configuration loading
//! - `error`: the `RelayError` taxonomy

pub mod agent;
pub mod auth;
pub mod config;
pub mod error;
pub mod jail;
pub mod routes;
pub mod shell;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use error::RelayError;
pub use state::MasterState;
pub use tunnel::client::TunnelClient;
