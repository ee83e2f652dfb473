//! # Interview Voice Backend - Main Application Entry Point
//!
//! Actix-web server for real-time spoken interviews: clients stream microphone
//! audio over a WebSocket, the server detects turns, transcribes them, asks the
//! next question and streams synthesized speech back.
//!
//! ## Application Architecture:
//! - **config**: Configuration (defaults, `config.toml`, environment variables)
//! - **audio**: PCM helpers, turn buffer and voice activity segmenter
//! - **services**: Speech recognition, synthesis and dialog planning providers
//! - **session**: Interview sessions and their store
//! - **conversation**: Conversation actors and the connection manager
//! - **websocket**: The actix WebSocket transport
//! - **state**: Shared application state
//! - **health**, **handlers**, **middleware**: The REST surface
//! - **error**: Error types and HTTP error responses

mod audio;
mod config;
mod conversation;
mod error;
mod handlers;
mod health;
mod middleware;
mod services;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use crate::config::AppConfig;
use crate::services::VoiceServices;
use crate::session::InMemorySessionStore;
use crate::state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Set once SIGINT or SIGTERM arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Build the speech providers and the session store
/// 3. Start the HTTP server
///
/// ## Shutdown:
/// On a signal every conversation actor is cleaned up first, then the server
/// stops accepting connections and drains in-flight requests.
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting interview-voice-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let services = VoiceServices::from_config(&config).context("failed to build voice providers")?;
    info!(providers = %services.provider_stats(), "Voice providers ready");

    let app_state = AppState::new(config.clone(), Arc::new(InMemorySessionStore::new()), services);
    let manager = app_state.manager.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware executes in reverse order for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::HttpMetrics)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::post().to(handlers::create_session))
                    .route("/sessions/{session_id}", web::get().to(handlers::get_session))
                    .route("/sessions/{session_id}", web::delete().to(handlers::delete_session)),
            )
            .service(
                web::scope("/ws")
                    .route("/status", web::get().to(handlers::voice_status))
                    .route("/cleanup", web::post().to(handlers::force_cleanup))
                    .route("/voice/{session_id}", web::get().to(websocket::voice_websocket))
                    .route(
                        "/realtime-voice/{session_id}",
                        web::get().to(websocket::voice_websocket),
                    ),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {}", bind_addr))?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, cleaning up voice sessions...");
            let cleaned = manager.cleanup_all().await;
            info!(cleaned, "Voice sessions cleaned up, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Set up tracing with `RUST_LOG`, defaulting to debug for this crate.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "interview_voice_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        // Failing to install a handler at startup is unrecoverable
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
