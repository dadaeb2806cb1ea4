//! Guardian-Log API Server

mod error;
mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use guardian_core::GuardianConfig;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use state::AppState;

/// Guardian-Log: self-hosted DNS anomaly detection.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to a JSON config file. Overrides GUARDIAN_CONFIG if set.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(path) = cli.config {
        std::env::set_var("GUARDIAN_CONFIG", path);
    }

    let config = GuardianConfig::load()?;
    guardian_core::logging::init(&config.logging);

    info!("starting Guardian-Log");

    let bind_address = config.server.bind_address.clone();
    let bind_port = config.server.bind_port;

    let state = Arc::new(AppState::new(config).await?);

    let app = Router::new()
        .route("/api/anomalies", get(handlers::list_anomalies))
        .route("/api/anomalies/:id/approve", post(handlers::approve_anomaly))
        .route("/api/anomalies/:id/block", post(handlers::block_anomaly))
        .route("/api/stats", get(handlers::stats))
        .route("/api/settings", get(handlers::settings))
        .route("/api/health", get(handlers::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr: SocketAddr = format!("{bind_address}:{bind_port}").parse()?;
    info!("server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install ctrl-c handler");
    info!("shutdown signal received, draining in-flight work");
    state.shutdown().await;
}
