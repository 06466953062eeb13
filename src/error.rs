//! Relay error taxonomy.
//!
//! Every failure the relay can produce is recoverable at the component
//! boundary and ends up as one of these variants: an RPC rejection, an error
//! envelope on the wire (via [`RelayError::code`]), an HTTP error at the admin
//! edge, or a `STREAM_CLOSE`. The only fatal one is [`RelayError::Bind`] at
//! startup.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors surfaced by the tunnel, the forwarder and the agent dispatchers.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Bad agent credentials. The transport is closed without any frame.
    #[error("authentication failed")]
    AuthFailure,

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The target agent has no active channel.
    #[error("agent '{0}' has no active tunnel")]
    RouteUnavailable(String),

    /// The agent could not reach the requested local target.
    #[error("target unreachable: {0}")]
    TargetUnreachable(String),

    /// A resolved path escapes its jail root.
    #[error("access denied: '{0}' is outside the jail root")]
    JailViolation(String),

    /// No terminal response within the deadline.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The owning channel closed while the operation was in flight.
    #[error("tunnel channel lost: {0}")]
    ChannelLoss(String),

    /// Error envelope returned by the remote side.
    #[error("remote error ({code}): {message}")]
    Remote { code: String, message: String },

    /// A required listener port could not be bound.
    #[error("failed to bind port {port}: {reason}")]
    Bind { port: u16, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    /// A mapping record failed validation.
    #[error("invalid mapping: {0}")]
    InvalidMapping(String),

    /// An active mapping already owns this master port.
    #[error("master port {0} is already mapped")]
    PortConflict(u16),

    /// No credential exists for this agent id.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Stable machine-readable code, used in error envelopes and HTTP bodies.
    pub fn code(&self) -> &str {
        match self {
            Self::AuthFailure => "AUTH_FAILURE",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::RouteUnavailable(_) => "ROUTE_UNAVAILABLE",
            Self::TargetUnreachable(_) => "TARGET_UNREACHABLE",
            Self::JailViolation(_) => "JAIL_VIOLATION",
            Self::Timeout(_) => "TIMEOUT",
            Self::ChannelLoss(_) => "CHANNEL_LOSS",
            Self::Remote { code, .. } => code,
            Self::Bind { .. } => "BIND_FAILED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::InvalidMapping(_) => "INVALID_MAPPING",
            Self::PortConflict(_) => "PORT_CONFLICT",
            Self::UnknownAgent(_) => "UNKNOWN_AGENT",
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => "NOT_FOUND",
            Self::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                "PERMISSION_DENIED"
            }
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Rebuild a typed error from a remote error envelope.
    ///
    /// Codes that belong to the shared taxonomy map back to their variant so
    /// callers can match on them; anything else stays [`RelayError::Remote`].
    pub fn from_remote(code: Option<&str>, message: Option<&str>) -> Self {
        let message = message.unwrap_or("remote error").to_string();
        match code {
            Some("JAIL_VIOLATION") => Self::JailViolation(message),
            Some("TARGET_UNREACHABLE") => Self::TargetUnreachable(message),
            Some("PROTOCOL_ERROR") => Self::Protocol(message),
            Some(code) => Self::Remote {
                code: code.to_string(),
                message,
            },
            None => Self::Remote {
                code: "REMOTE_ERROR".to_string(),
                message,
            },
        }
    }

    /// HTTP status used when this error reaches the admin API.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthFailure => StatusCode::UNAUTHORIZED,
            Self::Protocol(_) | Self::Config(_) | Self::InvalidMapping(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::UnknownAgent(_) => StatusCode::NOT_FOUND,
            Self::JailViolation(_) => StatusCode::FORBIDDEN,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::RouteUnavailable(_)
            | Self::TargetUnreachable(_)
            | Self::ChannelLoss(_)
            | Self::Remote { .. } => StatusCode::BAD_GATEWAY,
            Self::Bind { .. } | Self::PortConflict(_) => StatusCode::CONFLICT,
            Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({"error": self.to_string(), "code": self.code()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_codes_map_back_to_taxonomy() {
        let err = RelayError::from_remote(Some("JAIL_VIOLATION"), Some("../../etc"));
        assert!(matches!(err, RelayError::JailViolation(ref p) if p == "../../etc"));

        let err = RelayError::from_remote(Some("TIMEOUT"), None);
        assert_eq!(err.code(), "TIMEOUT");
        assert!(matches!(err, RelayError::Remote { .. }));

        let err = RelayError::from_remote(None, Some("boom"));
        assert_eq!(err.code(), "REMOTE_ERROR");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::Timeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::RouteUnavailable("a1".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::JailViolation("/etc".into()).status(),
            StatusCode::FORBIDDEN
        );
        let nf = RelayError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(nf.code(), "NOT_FOUND");
        assert_eq!(nf.status(), StatusCode::NOT_FOUND);
    }
}
