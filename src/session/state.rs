//! # Session State and Events
//!
//! The vocabulary of the per-session state machine: where a session is
//! ([`SessionState`]), what can happen to it ([`SessionEvent`]), and why it
//! ended ([`TeardownCause`]).
//!
//! ## State Transitions:
//! CONNECTING → READY → STREAMING → CLOSING → CLOSED
//!
//! Any state may jump forward to CLOSING. Nothing ever moves backward.

use crate::audio::Payload;
use crate::channel::{CloseNotice, ServerMessage};
use crate::error::BridgeError;
use crate::transcription::TranscriptEvent;
use std::fmt;

/// Lifecycle position of a session. Ordered: later variants compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Upstream handshake pending; client audio goes to the backlog
    Connecting,
    /// Upstream open, backlog being flushed
    Ready,
    /// Audio forwarded directly
    Streaming,
    /// Teardown in progress
    Closing,
    /// The bridge has released both channels. The registry entry goes once
    /// the upstream socket has closed as well.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// True once teardown has begun.
    pub fn is_terminating(&self) -> bool {
        *self >= SessionState::Closing
    }

    pub fn is_closed(&self) -> bool {
        *self == SessionState::Closed
    }

    /// True while audio may flow straight to the upstream channel.
    pub fn is_forwarding(&self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Streaming)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can happen to a session, in the order it happened.
///
/// Events from the client socket, the upstream connection task and the two
/// session timers all funnel into one queue per session, and the bridge
/// consumes them one at a time.
#[derive(Debug)]
pub enum SessionEvent {
    /// Binary frame from the client
    ClientAudio(Payload),
    /// Non-binary frame from the client
    ClientText(String),
    /// Pong (or ping) from the client
    LivenessReply,
    /// Client closed the connection, cleanly or by dropping it
    ClientClosed(Option<String>),
    /// Client socket protocol error
    ClientError(String),
    /// Upstream handshake completed
    UpstreamOpen,
    UpstreamTranscript(TranscriptEvent),
    /// Upstream sent something undecodable; recoverable on its own
    UpstreamMalformed(BridgeError),
    /// Upstream failed in a way that ends the session
    UpstreamFailed(BridgeError),
    /// Upstream closed the stream
    UpstreamClosed(String),
    KeepaliveTick,
    DeadlineReached,
    /// Process shutdown requested by the registry
    Shutdown,
}

impl SessionEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            SessionEvent::ClientAudio(_) => "client_audio",
            SessionEvent::ClientText(_) => "client_text",
            SessionEvent::LivenessReply => "liveness_reply",
            SessionEvent::ClientClosed(_) => "client_closed",
            SessionEvent::ClientError(_) => "client_error",
            SessionEvent::UpstreamOpen => "upstream_open",
            SessionEvent::UpstreamTranscript(_) => "upstream_transcript",
            SessionEvent::UpstreamMalformed(_) => "upstream_malformed",
            SessionEvent::UpstreamFailed(_) => "upstream_failed",
            SessionEvent::UpstreamClosed(_) => "upstream_closed",
            SessionEvent::KeepaliveTick => "keepalive_tick",
            SessionEvent::DeadlineReached => "deadline_reached",
            SessionEvent::Shutdown => "shutdown",
        }
    }
}

/// Why a session was torn down.
#[derive(Debug)]
pub enum TeardownCause {
    /// Client close frame or end of stream; carries `ClientDisconnect`
    ClientClosed(BridgeError),
    /// Client socket protocol error; carries `ClientDisconnect`
    ClientError(BridgeError),
    UpstreamClosed(String),
    UpstreamFailed(BridgeError),
    /// A send to either channel failed
    SendFailed(BridgeError),
    /// Backlog overflow under the abort policy
    BacklogOverflow(BridgeError),
    /// Too many consecutive malformed upstream events
    ProtocolErrors(BridgeError),
    DeadlineReached,
    /// No liveness reply for too many consecutive probes
    Stale,
    Shutdown,
    /// The bridge was dropped while still active
    Abandoned,
}

impl TeardownCause {
    pub fn label(&self) -> &'static str {
        match self {
            TeardownCause::ClientClosed(_) => "client_closed",
            TeardownCause::ClientError(_) => "client_error",
            TeardownCause::UpstreamClosed(_) => "upstream_closed",
            TeardownCause::UpstreamFailed(_) => "upstream_failed",
            TeardownCause::SendFailed(_) => "send_failed",
            TeardownCause::BacklogOverflow(_) => "backlog_overflow",
            TeardownCause::ProtocolErrors(_) => "protocol_errors",
            TeardownCause::DeadlineReached => "deadline_reached",
            TeardownCause::Stale => "stale",
            TeardownCause::Shutdown => "shutdown",
            TeardownCause::Abandoned => "abandoned",
        }
    }

    /// Error message sent to the client before the close frame.
    pub fn client_notice(&self) -> Option<ServerMessage> {
        let message = match self {
            TeardownCause::UpstreamClosed(reason) => ServerMessage::error(
                "upstream_closed",
                format!("Recognition service closed the stream: {}", reason),
            ),
            TeardownCause::UpstreamFailed(err)
            | TeardownCause::SendFailed(err)
            | TeardownCause::BacklogOverflow(err)
            | TeardownCause::ProtocolErrors(err) => ServerMessage::error(err.code(), err.to_string()),
            TeardownCause::DeadlineReached => ServerMessage::error(
                "session_expired",
                "Maximum session duration reached; open a new session to continue",
            ),
            TeardownCause::Stale => ServerMessage::error(
                "liveness_timeout",
                "No keepalive reply from client",
            ),
            TeardownCause::Shutdown => {
                ServerMessage::error("shutting_down", "Server is shutting down")
            }
            TeardownCause::ClientClosed(_)
            | TeardownCause::ClientError(_)
            | TeardownCause::Abandoned => return None,
        };
        Some(message)
    }

    /// Close frame for the client connection.
    pub fn close_notice(&self) -> CloseNotice {
        match self {
            TeardownCause::ClientClosed(_) | TeardownCause::ClientError(_) | TeardownCause::Abandoned => {
                CloseNotice::new(CloseNotice::NORMAL, "")
            }
            TeardownCause::UpstreamClosed(_) | TeardownCause::UpstreamFailed(_) => {
                CloseNotice::new(CloseNotice::INTERNAL_ERROR, "recognition service unavailable")
            }
            TeardownCause::SendFailed(_) | TeardownCause::ProtocolErrors(_) => {
                CloseNotice::new(CloseNotice::INTERNAL_ERROR, "relay error")
            }
            TeardownCause::BacklogOverflow(_) => {
                CloseNotice::new(CloseNotice::TRY_AGAIN_LATER, "audio backlog exhausted")
            }
            TeardownCause::DeadlineReached => {
                CloseNotice::new(CloseNotice::NORMAL, "session duration limit reached")
            }
            TeardownCause::Stale => CloseNotice::new(CloseNotice::POLICY, "keepalive timeout"),
            TeardownCause::Shutdown => CloseNotice::new(CloseNotice::GOING_AWAY, "server shutting down"),
        }
    }
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownCause::ClientClosed(err) => write!(f, "{}", err),
            TeardownCause::ClientError(err) => write!(f, "client error: {}", err),
            TeardownCause::UpstreamClosed(reason) => write!(f, "upstream closed: {}", reason),
            TeardownCause::UpstreamFailed(err)
            | TeardownCause::SendFailed(err)
            | TeardownCause::BacklogOverflow(err)
            | TeardownCause::ProtocolErrors(err) => write!(f, "{}", err),
            TeardownCause::DeadlineReached => write!(f, "maximum session duration reached"),
            TeardownCause::Stale => write!(f, "client stopped answering keepalives"),
            TeardownCause::Shutdown => write!(f, "server shutdown"),
            TeardownCause::Abandoned => write!(f, "session dropped while active"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_are_ordered() {
        assert!(SessionState::Connecting < SessionState::Ready);
        assert!(SessionState::Ready < SessionState::Streaming);
        assert!(SessionState::Streaming < SessionState::Closing);
        assert!(SessionState::Closing < SessionState::Closed);
    }

    #[test]
    fn test_state_predicates() {
        assert!(!SessionState::Connecting.is_forwarding());
        assert!(SessionState::Ready.is_forwarding());
        assert!(SessionState::Streaming.is_forwarding());
        assert!(SessionState::Closing.is_terminating());
        assert!(!SessionState::Closing.is_closed());
        assert!(SessionState::Closed.is_terminating());
    }

    #[test]
    fn test_client_side_causes_send_no_notice() {
        let closed = TeardownCause::ClientClosed(BridgeError::ClientDisconnect("bye".into()));
        assert!(closed.client_notice().is_none());
        assert_eq!(closed.to_string(), "Client disconnected: bye");

        let reset = TeardownCause::ClientError(BridgeError::ClientDisconnect("reset".into()));
        assert!(reset.client_notice().is_none());
        assert_eq!(reset.close_notice().code, CloseNotice::NORMAL);
    }

    #[test]
    fn test_deadline_notice_explains_resumption() {
        match TeardownCause::DeadlineReached.client_notice() {
            Some(ServerMessage::Error { code, message }) => {
                assert_eq!(code, "session_expired");
                assert!(message.contains("new session"));
            }
            other => panic!("expected error notice, got {:?}", other),
        }
    }

    #[test]
    fn test_upstream_failure_notice_uses_error_code() {
        let cause = TeardownCause::UpstreamFailed(BridgeError::UpstreamConnection("401".into()));
        match cause.client_notice() {
            Some(ServerMessage::Error { code, .. }) => assert_eq!(code, "upstream_connection"),
            other => panic!("expected error notice, got {:?}", other),
        }
        assert_eq!(cause.close_notice().code, CloseNotice::INTERNAL_ERROR);
    }
}
