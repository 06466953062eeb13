//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::MasterState;

/// `GET /api/health`: liveness check.
///
/// Returns status, uptime, version, connected agent count and the number of
/// bound forwarder listeners. No authentication required.
pub async fn health(State(state): State<MasterState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "agents": state.registry.len().await,
        "listeners": state.forwarder.bound_ports().await.len(),
    }))
}
