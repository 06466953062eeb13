//! Admin and agent authentication.
//!
//! Two credentials are in play:
//!
//! - **Admin API**: every `/api/*` endpoint except `/api/health` requires an
//!   `Authorization: Bearer <admin_key>` header. The shell WebSocket uses a
//!   `?token=` query parameter instead (browsers can't set headers on
//!   WebSocket upgrades).
//! - **Agents**: the `/tunnel` upgrade carries `x-agent-id` and
//!   `x-agent-secret` headers, checked against the `[[master.agents]]`
//!   credential store before any frame is exchanged. The store keeps only
//!   SHA-256 digests of the configured secrets.

use std::collections::HashMap;

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::config::AgentCredential;
use crate::error::RelayError;

/// Header carrying the agent identity on the `/tunnel` upgrade.
pub const AGENT_ID_HEADER: &str = "x-agent-id";
/// Header carrying the agent shared secret on the `/tunnel` upgrade.
pub const AGENT_SECRET_HEADER: &str = "x-agent-secret";

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but invalid
/// - `500 Internal Server Error`: [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let api_key = match request.extensions().get::<ApiKey>() {
        Some(key) => key.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    let provided = match request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
    {
        Some(token) => token,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing or invalid Authorization header"})),
            )
                .into_response();
        }
    };

    if !constant_time_eq(api_key.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension type carrying the expected admin key, injected into the router
/// layer so [`require_api_key`] can access it without touching `MasterState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// The master's agent credential store.
///
/// An agent is *tunnel-capable* exactly when it has an entry here; mappings
/// for any other agent id are rejected at creation.
#[derive(Debug, Clone, Default)]
pub struct AgentCredentials {
    digests: HashMap<String, [u8; 32]>,
}

fn secret_digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

impl AgentCredentials {
    pub fn new(entries: &[AgentCredential]) -> Self {
        Self {
            digests: entries
                .iter()
                .map(|c| (c.agent_id.clone(), secret_digest(&c.secret)))
                .collect(),
        }
    }

    pub fn is_tunnel_capable(&self, agent_id: &str) -> bool {
        self.digests.contains_key(agent_id)
    }

    /// Check the upgrade headers and return the authenticated agent id.
    ///
    /// Every failure collapses into [`RelayError::AuthFailure`] so the caller
    /// cannot tell an unknown id from a wrong secret.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<String, RelayError> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        let (Some(agent_id), Some(secret)) = (header(AGENT_ID_HEADER), header(AGENT_SECRET_HEADER))
        else {
            return Err(RelayError::AuthFailure);
        };

        // Unknown ids compare against a zero digest so timing is uniform.
        let (known, expected) = match self.digests.get(agent_id) {
            Some(d) => (true, *d),
            None => (false, [0u8; 32]),
        };
        if constant_time_eq(&expected, &secret_digest(secret)) && known {
            Ok(agent_id.to_string())
        } else {
            Err(RelayError::AuthFailure)
        }
    }
}
