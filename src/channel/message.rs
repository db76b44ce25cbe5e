//! Messages sent to the client as JSON text frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client-facing message.
///
/// Final and interim results are different variants on purpose: a client
/// reading `type` never has to inspect `isFinal` to avoid showing a
/// provisional result as settled text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once, immediately after the WebSocket upgrade
    #[serde(rename_all = "camelCase")]
    Connection {
        status: String,
        session_id: String,
    },

    /// A final recognition result
    #[serde(rename_all = "camelCase")]
    Transcript {
        text: String,
        is_final: bool,
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
    },

    /// A provisional result, only when interim forwarding is enabled
    #[serde(rename_all = "camelCase")]
    InterimTranscript {
        text: String,
        is_final: bool,
        timestamp: DateTime<Utc>,
    },

    /// Something went wrong; `message` is meant for humans
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn connected(session_id: &str) -> Self {
        ServerMessage::Connection {
            status: "connected".to_string(),
            session_id: session_id.to_string(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Value of the `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::Transcript { .. } => "transcript",
            ServerMessage::InterimTranscript { .. } => "interim_transcript",
            ServerMessage::Error { .. } => "error",
        }
    }
}
