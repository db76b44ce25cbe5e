//! # Speech Relay - Main Application Entry Point
//!
//! A WebSocket relay between audio-streaming clients and a hosted streaming
//! speech-to-text service. Each client connection becomes one session that is
//! bridged to its own upstream recognition stream.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: every connection, upstream stream and timer is a task
//!   on the same runtime
//! - **actors**: each client socket is an Actix actor owning its session
//! - **Result<T, E>**: startup failures are returned from `main` via `anyhow`
//!
//! ## Application Architecture:
//! - **config**: configuration from defaults, `config.toml` and environment variables
//! - **session**: per-session state machine, timers and the session registry
//! - **upstream**: the recognition service connection
//! - **websocket**: the client endpoint
//! - **health / handlers**: status endpoints
//! - **error**: the session-scoped error type

// Module declarations
mod audio;         // Audio frames and the pre-connect backlog (audio/)
mod channel;       // Client/upstream channel traits and client messages (channel/)
mod config;        // Configuration management (config.rs)
mod error;         // Session-scoped error type (error.rs)
mod handlers;      // HTTP request handlers (handlers/ directory)
mod health;        // Health and session listing endpoints (health.rs)
mod session;       // Bridge state machine, timers and registry (session/)
mod state;         // Application state shared by handlers (state.rs)
mod transcription; // Transcript events and client translation (transcription/)
mod upstream;      // Recognition service connection (upstream/)
mod websocket;     // Client WebSocket endpoint (websocket.rs)

use actix_cors::Cors;  // Cross-Origin Resource Sharing support
use actix_web::{web, App, HttpServer};  // Web framework
use anyhow::Result;    // Startup errors, printed on exit
use config::AppConfig;
use state::AppState;
use std::time::Duration;
use tracing::{error, info, warn};  // Structured logging
use tracing_actix_web::TracingLogger;  // Per-request spans
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};  // Logging setup

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** and refuses to start without a credential
/// 2. **Sets up logging**
/// 3. **Configures the HTTP server** with middleware and routes
/// 4. **Drains sessions on shutdown**: stop accepting, tear every session
///    down, wait for the registry to empty, then stop the server
#[actix_web::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    init_tracing()?;

    // Defaults, config.toml, then environment; a missing API key stops here
    let config = AppConfig::load()?;
    config.validate()?;
    // fail here rather than in every session
    upstream::build_request(&config.upstream)?;

    info!("Starting speech-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Upstream {} (model {}, language {}, {} Hz {})",
        config.upstream.url,
        config.upstream.model,
        config.upstream.language,
        config.upstream.sample_rate,
        config.upstream.encoding
    );

    let shutdown_grace = Duration::from_secs(config.server.shutdown_grace_secs);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config);

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    // The closure runs once per worker thread
    let server = HttpServer::new(move || {
        // Browser clients connect from arbitrary origins
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            // WebSocket upgrade; /ws kept as an alias for older clients
            .route("/listen", web::get().to(websocket::listen))
            .route("/ws", web::get().to(websocket::listen))
            // API routes
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/sessions", web::get().to(health::list_sessions))
                    .route("/config", web::get().to(handlers::get_config)),
            )
            // Root health for load balancers
            .route("/health", web::get().to(health::health_check))
    })
    // Signals are handled below so sessions can drain first
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        signal = wait_for_shutdown() => {
            if let Err(e) = signal {
                error!("Signal handler failed, shutting down: {}", e);
            }
            drain_sessions(&app_state, shutdown_grace).await;
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: controls what gets logged (e.g. `speech_relay=trace`)
/// - If not set, defaults to `speech_relay=debug,actix_web=info`
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolves on SIGTERM or SIGINT.
async fn wait_for_shutdown() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Stop admitting sessions, ask every open one to close, and wait for them.
///
/// A session counts as closed once its upstream socket is released too, so
/// this also waits out each stream's `CloseStream` grace.
async fn drain_sessions(state: &AppState, grace: Duration) {
    let notified = state.registry.shutdown_all();
    info!(
        "Shutdown: closing {} session(s), waiting up to {}s",
        notified,
        grace.as_secs()
    );

    if state.registry.wait_until_empty(grace).await {
        info!("All sessions closed");
    } else {
        warn!(
            "{} session(s) still open after {}s, stopping anyway",
            state.registry.len(),
            grace.as_secs()
        );
    }
}
