//! # Upstream Recognition Service
//!
//! Everything that knows about the speech-to-text provider lives here: the
//! JSON wire format in [`messages`] and the live socket in [`deepgram`]. The
//! rest of the relay sees only the [`UpstreamChannel`](crate::channel::UpstreamChannel)
//! trait and [`SessionEvent`](crate::session::SessionEvent)s.

pub mod deepgram;
pub mod messages;

pub use deepgram::{build_request, DeepgramChannel};
