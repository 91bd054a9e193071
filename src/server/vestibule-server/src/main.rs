//! Vestibule Server - Main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vestibule_auth::SessionCache;
use vestibule_portal::{router, GatewayConfig, PortalRegistry};

/// Interval between session cache sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "vestibule-server")]
#[command(about = "Vestibule - Authentication gateway")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config/vestibule.json", env = "VESTIBULE_CONFIG")]
    config: String,

    /// Server bind address
    #[arg(long, default_value = "0.0.0.0:8080", env = "VESTIBULE_BIND_ADDRESS")]
    bind: SocketAddr,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "VESTIBULE_LOG_FORMAT")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::from_default_env());
    match cli.log_format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    tracing::info!("Starting Vestibule server...");
    tracing::info!("Configuration: {}", cli.config);

    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config))?;

    let sessions = Arc::new(SessionCache::new(Duration::from_secs(
        config.session_ttl_secs,
    )));
    let sweeper = sessions.spawn_sweeper(SWEEP_INTERVAL);

    let registry = PortalRegistry::from_config(&config, Arc::clone(&sessions))
        .context("Failed to provision portals")?;
    if registry.primary().is_none() {
        tracing::warn!("No primary portal configured");
    }

    let app = router(&registry).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cli.bind))?;
    tracing::info!("Bind address: {}", cli.bind);
    tracing::info!("Vestibule server started successfully");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    sweeper.abort();
    tracing::info!("Shutting down...");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
