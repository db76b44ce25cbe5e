//! # Audio Frames
//!
//! Audio from the client is never decoded here. A frame is an opaque payload
//! plus the order it arrived in; encoding and sample rate are negotiated out of
//! band and announced to the recognition service as-is.
//!
//! ## Key Components:
//! - **AudioFrame**: one binary WebSocket message from the client
//! - **Backlog**: bounded FIFO holding frames while the upstream handshake is pending

pub mod backlog;

pub use backlog::{Backlog, PushOutcome};

/// Raw frame bytes, shared without copying between the client socket and the
/// upstream send queue.
pub type Payload = actix_web::web::Bytes;

/// One opaque audio payload with its arrival sequence number.
///
/// The sequence number exists for ordering diagnostics only. Frames are never
/// reordered: they are appended, drained front to back, or forwarded in the
/// order they were received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence: u64,
    pub payload: Payload,
}

impl AudioFrame {
    pub fn new(sequence: u64, payload: Payload) -> Self {
        Self { sequence, payload }
    }

    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }
}
