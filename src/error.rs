//! Error taxonomy shared by every component.
//!
//! Per-call errors (daemon unavailable) become scoped replies, connection
//! errors (transport, protocol during handshake) drive the tunnel reconnect
//! loop, and configuration errors are only ever fatal at startup.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors the agent can produce.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The Docker daemon could not be reached, or the call failed in transit.
    #[error("Docker request failed: {0}")]
    DaemonUnavailable(String),

    /// Missing or mismatched shared token.
    #[error("Unauthorized")]
    Unauthorized,

    /// Malformed or unexpected tunnel message.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// The remote peer rejected the handshake.
    #[error("rejected by control plane: {0}")]
    Rejected(String),

    /// Tunnel connection lost or could not be established.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Unusable startup configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl AgentError {
    /// HTTP status used when this error terminates an HTTP exchange.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DaemonUnavailable(_) | Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Unauthorized | Self::Rejected(_) => StatusCode::UNAUTHORIZED,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable code carried in tunnel `error` messages.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::DaemonUnavailable(_) => "DOCKER_UNAVAILABLE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Protocol(e) => e.code(),
            Self::Rejected(_) => "REJECTED",
            Self::Transport(_) => "TRANSPORT",
            Self::Config(_) => "CONFIG",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AgentError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
