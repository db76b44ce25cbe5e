//! # Error Handling
//!
//! Every runtime failure in the relay is scoped to a single session. This module
//! defines the one error type those failures travel in, how each one is named
//! on the wire, and how the few that happen during the HTTP upgrade become
//! HTTP responses.
//!
//! ## Error Taxonomy:
//! - **ChannelSend**: a send was attempted on a channel that is not open
//! - **UpstreamProtocol**: the recognition service sent something we could not use
//! - **UpstreamConnection**: the handshake failed or the upstream socket dropped
//! - **ClientDisconnect**: the client went away, cleanly or not
//! - **Configuration**: a startup parameter is missing or invalid (fatal, never per-session)
//! - **ResourceExhausted**: the audio backlog overflowed under the `abort` policy
//! - **CapacityExceeded / ShuttingDown**: admission refused before a session exists
//!
//! ## Propagation:
//! None of these ever crosses a session boundary. The bridge logs them, tells
//! the client when the client can still hear it, and tears the session down.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Session-scoped errors raised by the bridge and its channels.
///
/// ## Usage Example:
/// ```rust
/// return Err(BridgeError::ChannelSend("upstream not open".to_string()));
/// ```
#[derive(Debug)]
pub enum BridgeError {
    /// Send attempted while the channel was not open
    ChannelSend(String),

    /// Malformed or unexpected upstream event
    UpstreamProtocol(String),

    /// Handshake failure or abrupt upstream close
    UpstreamConnection(String),

    /// Clean or abrupt client close
    ClientDisconnect(String),

    /// Missing or invalid startup parameter
    Configuration(String),

    /// Audio backlog exceeded its bound under the abort policy
    ResourceExhausted(String),

    /// The registry already holds the maximum number of sessions
    CapacityExceeded(usize),

    /// The process is draining and no longer accepts sessions
    ShuttingDown,
}

impl BridgeError {
    /// Stable, machine-readable code sent to clients in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::ChannelSend(_) => "channel_send",
            BridgeError::UpstreamProtocol(_) => "upstream_protocol",
            BridgeError::UpstreamConnection(_) => "upstream_connection",
            BridgeError::ClientDisconnect(_) => "client_disconnect",
            BridgeError::Configuration(_) => "configuration",
            BridgeError::ResourceExhausted(_) => "resource_exhausted",
            BridgeError::CapacityExceeded(_) => "capacity_exceeded",
            BridgeError::ShuttingDown => "shutting_down",
        }
    }

    /// Whether this error ends the session on its own.
    ///
    /// A single malformed upstream event does not; the bridge counts those and
    /// escalates only after a run of them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BridgeError::UpstreamProtocol(_))
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::ChannelSend(msg) => write!(f, "Channel send failed: {}", msg),
            BridgeError::UpstreamProtocol(msg) => write!(f, "Upstream protocol error: {}", msg),
            BridgeError::UpstreamConnection(msg) => write!(f, "Upstream connection error: {}", msg),
            BridgeError::ClientDisconnect(msg) => write!(f, "Client disconnected: {}", msg),
            BridgeError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            BridgeError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {}", msg),
            BridgeError::CapacityExceeded(max) => {
                write!(f, "Maximum concurrent sessions ({}) reached", max)
            }
            BridgeError::ShuttingDown => write!(f, "Server is shutting down"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Converts errors that surface during the WebSocket upgrade into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - CapacityExceeded/ShuttingDown → 503 (Service Unavailable)
/// - Configuration → 500
/// - everything else → 502 (the failure is on a channel we relay to)
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "capacity_exceeded",
///     "message": "Maximum concurrent sessions (100) reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for BridgeError {
    fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::CapacityExceeded(_) | BridgeError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Configuration loading failures are always startup failures.
impl From<config::ConfigError> for BridgeError {
    fn from(err: config::ConfigError) -> Self {
        BridgeError::Configuration(err.to_string())
    }
}

/// Upstream payloads are JSON; a decode failure means the provider sent
/// something outside the protocol we speak.
impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::UpstreamProtocol(format!("invalid JSON: {}", err))
    }
}

/// Shorthand for results carrying a [`BridgeError`].
pub type BridgeResult<T> = Result<T, BridgeError>;
