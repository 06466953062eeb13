//! HTTP route handlers for the master.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] and the two WebSocket upgrades require authentication via the
//! [`crate::auth::require_api_key`] middleware. The operator shell socket
//! checks `?token=` itself; `/tunnel` checks agent credentials.

pub mod agents;
pub mod health;
pub mod mappings;

use axum::{
    middleware,
    routing::{delete, get, post},
    Extension, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::state::MasterState;
use crate::tunnel::relay;

/// In-flight admin requests; RPC calls can each hold a slot for a full timeout.
const ADMIN_CONCURRENCY: usize = 64;

/// The full master router: admin API plus the agent endpoint.
pub fn router(state: MasterState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/agents", get(agents::list))
        .route("/api/agents/{agent_id}/exec", post(agents::exec))
        .route("/api/agents/{agent_id}/files", post(agents::files))
        .route("/api/agents/{agent_id}/download", post(agents::download))
        .route("/api/mappings", get(mappings::list).post(mappings::create))
        .route("/api/mappings/reload", post(mappings::reload))
        .route("/api/mappings/{master_port}", delete(mappings::remove))
        .layer(middleware::from_fn(auth::require_api_key))
        .layer(ConcurrencyLimitLayer::new(ADMIN_CONCURRENCY));

    let ws_routes = Router::new()
        .route("/api/agents/{agent_id}/shell", get(agents::shell_upgrade))
        .route("/tunnel", get(relay::tunnel_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_routes)
        .layer(Extension(ApiKey(state.config.master.admin_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
