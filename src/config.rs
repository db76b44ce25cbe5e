//! # Configuration Management
//!
//! Loads the relay's configuration once at startup from several sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml`
//! - Environment variables with the `APP_` prefix, nested with `__`
//!   (e.g. `APP_SESSION__MAX_DURATION_SECS=600`)
//! - The conventional `DEEPGRAM_API_KEY`, `HOST` and `PORT` variables
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `DEEPGRAM_API_KEY`, `HOST`, `PORT`
//! 2. `APP_*` environment variables
//! 3. `config.toml`
//! 4. Defaults
//!
//! A missing credential is a [`BridgeError::Configuration`] returned from
//! [`AppConfig::validate`]; the process refuses to start rather than failing
//! every session later.

use crate::error::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::env;                    // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
    pub performance: PerformanceConfig,
}

/// Listener settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only local clients (development)
/// - `host = "0.0.0.0"`: any interface (production, containers)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long shutdown waits for open sessions to tear down
    pub shutdown_grace_secs: u64,
}

/// Connection parameters for the streaming recognition service.
///
/// These map one-to-one onto the query string of the live endpoint, except
/// for the transport tuning knobs at the bottom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Service credential. Required.
    pub api_key: String,
    /// Live transcription endpoint (`wss://...`)
    pub url: String,
    pub model: String,
    /// Audio encoding announced to the service (frames are never transcoded)
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: String,
    /// Ask the service for interim results. Whether they reach the client is
    /// decided separately by `session.forward_interim`.
    pub interim_results: bool,
    pub smart_format: bool,
    /// Silence (ms) that ends an utterance; 0 leaves the service default
    pub endpointing_ms: u32,
    /// Utterance-end detection window (ms); 0 disables it
    pub utterance_end_ms: u32,
    /// Idle seconds before the writer sends a provider keepalive
    pub keepalive_secs: u64,
    /// Upper bound on the WebSocket handshake, TLS included
    pub connect_timeout_ms: u64,
    /// Capacity of the per-session upstream send queue (frames)
    pub send_queue_capacity: usize,
    /// Upper bound on how long a finishing upstream socket may linger
    pub close_grace_ms: u64,
}

/// Per-session behaviour of the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard session limit, enforced regardless of activity
    pub max_duration_secs: u64,
    /// Interval between liveness probes sent to the client
    pub keepalive_interval_secs: u64,
    /// Consecutive unanswered probes after which a session is stale
    pub max_missed_pongs: u32,
    /// Surface interim results to the client as `interim_transcript` messages
    pub forward_interim: bool,
    /// Consecutive malformed upstream events tolerated before teardown
    pub max_protocol_errors: u32,
    pub backlog: BacklogConfig,
}

/// Bounds for audio buffered while the upstream handshake is pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogConfig {
    pub max_frames: usize,
    pub max_bytes: usize,
    pub overflow: OverflowPolicy,
}

/// What happens when the backlog is full and another frame arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered frames to make room
    DropOldest,
    /// End the session with a resource-exhaustion error
    Abort,
}

/// Capacity limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,                     // Common development port
                shutdown_grace_secs: 10,
            },
            upstream: UpstreamConfig {
                api_key: String::new(),
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                model: "general".to_string(),
                encoding: "linear16".to_string(),
                sample_rate: 16000,             // 16 kHz mono PCM
                channels: 1,
                language: "es".to_string(),
                interim_results: true,
                smart_format: true,
                endpointing_ms: 400,
                utterance_end_ms: 0,
                keepalive_secs: 5,
                connect_timeout_ms: 10_000,
                send_queue_capacity: 1024,
                close_grace_ms: 2000,
            },
            session: SessionConfig {
                max_duration_secs: 55 * 60, // just under the platform's 60 min hard timeout
                keepalive_interval_secs: 8,
                max_missed_pongs: 3,
                forward_interim: false,
                max_protocol_errors: 3,
                backlog: BacklogConfig {
                    max_frames: 500,
                    max_bytes: 4 * 1024 * 1024,
                    overflow: OverflowPolicy::DropOldest,
                },
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 100,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `DEEPGRAM_API_KEY=...`: service credential
    /// - `APP_UPSTREAM__LANGUAGE=es-419`: override the recognition language
    /// - `APP_SESSION__BACKLOG__OVERFLOW=abort`: switch the overflow policy
    /// - `PORT=3000`: deployment platforms
    pub fn load() -> BridgeResult<Self> {
        let mut settings = config::Config::builder()
            // 1. Defaults from the Default impl
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. config.toml, if present
            .add_source(config::File::with_name("config").required(false))
            // 3. APP_ variables; `__` separates levels so keys may contain `_`
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Conventional variables that don't follow the APP_ prefix
        if let Ok(api_key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("upstream.api_key", api_key)?;
        }

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Check that the configuration can run sessions at all.
    ///
    /// Every failure here is fatal at startup.
    pub fn validate(&self) -> BridgeResult<()> {
        let invalid = |msg: &str| Err(BridgeError::Configuration(msg.to_string()));

        if self.upstream.api_key.trim().is_empty() {
            return invalid("DEEPGRAM_API_KEY missing");
        }
        if self.server.port == 0 {
            return invalid("Server port cannot be 0");
        }
        if !self.upstream.url.starts_with("ws://") && !self.upstream.url.starts_with("wss://") {
            return invalid("Upstream url must be a ws:// or wss:// address");
        }
        if self.upstream.connect_timeout_ms == 0 {
            return invalid("Upstream connect timeout must be greater than 0");
        }
        if self.upstream.sample_rate == 0 || self.upstream.channels == 0 {
            return invalid("Upstream sample rate and channel count must be greater than 0");
        }
        if self.session.max_duration_secs == 0 {
            return invalid("Max session duration must be greater than 0");
        }
        if self.session.keepalive_interval_secs == 0 || self.session.max_missed_pongs == 0 {
            return invalid("Keepalive interval and missed-pong limit must be greater than 0");
        }
        if self.session.backlog.max_frames == 0 || self.session.backlog.max_bytes == 0 {
            return invalid("Backlog bounds must be greater than 0");
        }
        if self.upstream.send_queue_capacity < self.session.backlog.max_frames {
            // the whole backlog is flushed into this queue in one pass
            return invalid("Upstream send queue capacity must be at least backlog.max_frames");
        }
        if self.performance.max_concurrent_sessions == 0 {
            return invalid("Max concurrent sessions must be greater than 0");
        }

        Ok(())
    }
}

impl SessionConfig {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }
}

impl UpstreamConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key() -> AppConfig {
        let mut config = AppConfig::default();
        config.upstream.api_key = "test-key".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.keepalive_interval_secs, 8);
        assert_eq!(config.session.max_missed_pongs, 3);
        assert_eq!(config.session.max_duration(), Duration::from_secs(3300));
        assert_eq!(config.upstream.sample_rate, 16000);
        assert_eq!(config.session.backlog.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn test_missing_credential_is_fatal() {
        let err = AppConfig::default().validate().unwrap_err();
        assert_eq!(err.code(), "configuration");
        assert!(config_with_key().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = config_with_key();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = config_with_key();
        config.upstream.url = "https://api.deepgram.com/v1/listen".to_string();
        assert!(config.validate().is_err());

        let mut config = config_with_key();
        config.session.backlog.max_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = config_with_key();
        config.upstream.connect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backlog_must_fit_in_send_queue() {
        let mut config = config_with_key();
        config.session.backlog.max_frames = 2000;
        config.upstream.send_queue_capacity = 1024;
        assert!(config.validate().is_err());

        config.upstream.send_queue_capacity = 2000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overflow_policy_serialization() {
        let json = serde_json::to_string(&OverflowPolicy::DropOldest).unwrap();
        assert_eq!(json, "\"drop_oldest\"");
        let policy: OverflowPolicy = serde_json::from_str("\"abort\"").unwrap();
        assert_eq!(policy, OverflowPolicy::Abort);
    }
}
