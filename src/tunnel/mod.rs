//! Reverse tunnel between the master and its agents.
//!
//! Agents dial the master; everything afterwards rides that one channel.
//!
//! - [`frame`]: wire format (tagged JSON frames, RPC envelopes)
//! - [`channel`]: master-side channel actor and its handle
//! - [`correlator`]: `requestId` → pending reply, owned by the actor
//! - [`mux`]: logical TCP streams over a channel (both sides)
//! - [`registry`]: `agentId` → live channel
//! - [`forwarder`]: master listeners for port mappings
//! - [`mapping`]: persisted mapping records
//! - [`relay`]: the `/tunnel` WebSocket endpoint
//! - [`client`]: the agent's supervised connection
//! - [`backoff`]: agent reconnect delays

pub mod backoff;
pub mod channel;
pub mod client;
pub mod correlator;
pub mod forwarder;
pub mod frame;
pub mod mapping;
pub mod mux;
pub mod registry;
pub mod relay;
