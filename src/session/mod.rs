//! # Sessions
//!
//! One session per client connection. This module holds the per-session
//! state machine ([`Bridge`]), its vocabulary ([`SessionState`],
//! [`SessionEvent`], [`TeardownCause`]), the timers and liveness tracking it
//! owns, and the process-wide [`SessionRegistry`].

pub mod bridge;
pub mod keepalive;
pub mod registry;
pub mod state;
pub mod timers;

pub use bridge::{Bridge, BridgeSettings};
pub use registry::{SessionLease, SessionRegistry};
pub use state::{SessionEvent, SessionState, TeardownCause};
pub use timers::SessionTimers;
