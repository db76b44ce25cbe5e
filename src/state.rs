//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket upgrade.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: lets every worker thread hold the same configuration and registry
//! - **Memory safety**: the data is freed when the last handler lets go of it
//!
//! ### No RwLock around the config
//! Configuration is loaded once at startup and never changes afterwards, so it
//! is shared read-only. The only mutable cross-session state is the
//! [`SessionRegistry`], which carries its own lock.
//!
//! ### Admission
//! Whether new sessions are accepted is owned by the registry, so that the
//! check and the insert happen under the same lock as the shutdown broadcast.

use crate::config::AppConfig;
use crate::session::SessionRegistry;
use std::sync::Arc;
use std::time::Instant;

/// The main application state that's shared across all HTTP request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Startup configuration (read-only)
    pub config: Arc<AppConfig>,

    /// Every session not yet CLOSED
    pub registry: SessionRegistry,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = SessionRegistry::new(config.performance.max_concurrent_sessions);
        Self {
            config: Arc::new(config),
            registry,
            start_time: Instant::now(),
        }
    }

    /// Whether new sessions are admitted.
    pub fn is_accepting(&self) -> bool {
        self.registry.is_accepting()
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_stops_admission() {
        let state = AppState::new(AppConfig::default());
        assert!(state.is_accepting());

        state.registry.shutdown_all();
        assert!(!state.is_accepting());
    }

    #[test]
    fn test_clones_share_registry() {
        let state = AppState::new(AppConfig::default());
        let clone = state.clone();

        let _lease = clone
            .registry
            .register("a", "peer", tokio::sync::mpsc::unbounded_channel().0)
            .unwrap();
        clone.registry.shutdown_all();

        assert_eq!(state.registry.len(), 1);
        assert!(!state.is_accepting());
    }
}
