//! # Channel Abstractions
//!
//! The bridge talks to both ends of a session through these two traits and
//! nothing else. The WebSocket actor implements [`ClientChannel`], the
//! recognition service connection implements [`UpstreamChannel`], and tests
//! substitute recording fakes for both.
//!
//! Both traits are synchronous on purpose: every operation is a non-blocking
//! enqueue onto a task that owns the actual socket, so one stalled peer can
//! never suspend the bridge that drives it.

pub mod message;

pub use message::ServerMessage;

use crate::audio::AudioFrame;
use crate::error::BridgeResult;

/// WebSocket close code and reason delivered to the client on teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseNotice {
    pub code: u16,
    pub reason: String,
}

impl CloseNotice {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY: u16 = 1008;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TRY_AGAIN_LATER: u16 = 1013;

    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// The inbound client connection, as seen by the bridge.
pub trait ClientChannel {
    /// Queue a JSON message for the client.
    fn send(&mut self, message: ServerMessage) -> BridgeResult<()>;

    /// Queue a liveness probe (WebSocket ping).
    fn ping(&mut self) -> BridgeResult<()>;

    /// Close the connection. Must tolerate being called on a connection the
    /// client already closed.
    fn close(&mut self, notice: Option<CloseNotice>);
}

/// The outbound recognition connection, as seen by the bridge.
pub trait UpstreamChannel {
    /// Queue one audio frame. Fails if the channel is not open or its send
    /// queue is full; callers never retry.
    fn send(&mut self, frame: AudioFrame) -> BridgeResult<()>;

    /// Whether the handshake has completed and the socket is still open.
    fn is_ready(&self) -> bool;

    /// Ask the service to flush and close the stream. Idempotent.
    fn finish(&mut self);
}
