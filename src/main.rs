//! CopperHead Server - knockout tournament server for two-player snake
//!
//! This is the main entry point. It handles:
//! - WebSocket connections for players and observers
//! - The competition bracket and one tick loop per match room
//! - HTTP query endpoints for status, rooms, and champion history
//! - Settings hot reload and bot processes

mod app;
mod bots;
mod competition;
mod config;
mod game;
mod http;
mod matchmaking;
mod util;
mod ws;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::AppState;
use crate::config::watch::spawn_settings_watcher;
use crate::config::{Config, GameSettings};
use crate::http::build_router;
use crate::util::time::init_server_time;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config.log_level);
    init_server_time();

    info!("Starting CopperHead Server");
    info!("Server address: {}", config.server_addr);

    let settings = GameSettings::resolve(config.settings_path.as_deref())?;
    info!(
        arenas = settings.arenas,
        points_to_win = settings.points_to_win,
        grid = %settings.grid_size,
        speed = settings.speed,
        bots = settings.bots,
        "Game settings loaded"
    );

    let (state, room_events) = AppState::new(config.clone(), settings);

    // Match results flow from the rooms into the competition
    tokio::spawn(state.competition.clone().run(room_events));
    state.competition.open();

    if let Some(path) = config.settings_path.clone() {
        spawn_settings_watcher(path, state.competition.clone());
    }

    let competition = state.competition.clone();
    let router = build_router(state);

    let addr: SocketAddr = config.server_addr;
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on {}", addr);
    info!("Health check: http://{}/health", addr);
    info!("Player endpoint: ws://{}/ws/join", addr);
    info!("Observer endpoint: ws://{}/ws/observe", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    competition.shutdown();
    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        }
    }
}
