//! Port mapping endpoints.
//!
//! - `GET    /api/mappings`: persisted records plus live listener status
//! - `POST   /api/mappings`: validate, persist, then reload the forwarder
//! - `DELETE /api/mappings/{masterPort}`: delete, then reload
//! - `POST   /api/mappings/reload`: re-read the mapping file and re-bind
//!
//! Every write reloads the forwarder, so only the listeners that changed are
//! touched. Writes and their reloads are serialized through [`MasterState`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::info;

use crate::error::RelayError;
use crate::state::MasterState;
use crate::tunnel::mapping::TunnelMapping;

/// `GET /api/mappings`
pub async fn list(State(state): State<MasterState>) -> Json<Value> {
    Json(json!({
        "mappings": state.mappings.list().await,
        "listeners": state.forwarder.status().await,
    }))
}

/// `POST /api/mappings`: create one mapping.
///
/// # Errors
///
/// - `400` with `{"code":"INVALID_MAPPING"}`: zero port or agent without credentials
/// - `409` with `{"code":"PORT_CONFLICT"}`: an active mapping already owns `masterPort`
/// - `409` with `{"code":"BIND_FAILED"}`: saved, but the listener could not be bound
pub async fn create(
    State(state): State<MasterState>,
    Json(mapping): Json<TunnelMapping>,
) -> Result<Response, RelayError> {
    let report = state.create_mapping(mapping.clone()).await?;
    if let Some(e) = report.failure(mapping.master_port) {
        return Err(e);
    }
    info!(
        master_port = mapping.master_port,
        agent_id = %mapping.agent_id,
        agent_port = mapping.agent_port,
        "Mapping created"
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({"mapping": mapping, "reload": report})),
    )
        .into_response())
}

/// `DELETE /api/mappings/{masterPort}`
pub async fn remove(
    State(state): State<MasterState>,
    Path(master_port): Path<u16>,
) -> Result<Response, RelayError> {
    let Some((removed, report)) = state.delete_mapping(master_port).await? else {
        return Ok((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no mapping on port {master_port}"), "code": "NOT_FOUND"})),
        )
            .into_response());
    };
    info!(master_port, removed, "Mapping deleted");
    Ok(Json(json!({"removed": removed, "reload": report})).into_response())
}

/// `POST /api/mappings/reload`: pick up edits made to the file directly.
pub async fn reload(State(state): State<MasterState>) -> Result<Json<Value>, RelayError> {
    let (active, report) = state.reload_mappings().await?;
    info!(active, failed = report.failed.len(), "Mappings reloaded");
    Ok(Json(json!({"active": active, "reload": report})))
}
