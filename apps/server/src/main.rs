//! Exo Assist Server - standalone headless pipeline server.
//!
//! Hosts the full agent-assist pipeline in one process: telephony ingest,
//! ASR worker, transcript consumer and SSE fan-out, wired over the
//! configured pub/sub backing. Multi-process deployments run the same
//! binary per role against a shared Redis/Kafka bus.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use exoassist_core::{bootstrap_services, start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Exo Assist Server - real-time call-centre agent assist.
#[derive(Parser, Debug)]
#[command(name = "exoassist-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "EXO_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file).
    #[arg(short = 'p', long, env = "EXO_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Exo Assist Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(port) = args.port {
        config.bind_port = port;
    }

    let core_config = config.to_core_config();
    log::info!(
        "Configuration: bind_port={}, bus={:?}, stt={:?}, llm={:?}",
        config.bind_port,
        core_config.bus.adapter,
        core_config.stt.provider,
        core_config.llm.provider
    );

    // Bootstrap services (fails fast on configuration problems)
    let services = bootstrap_services(core_config)
        .await
        .context("Failed to bootstrap services")?;
    log::info!("Services bootstrapped successfully");

    // Start pipeline background tasks (bus subscriptions, discovery, reaper)
    services
        .start_background_tasks()
        .await
        .context("Failed to start background tasks")?;
    log::info!("Background tasks started");

    // Build app state for the HTTP server
    let app_state = AppState::builder().from_services(&services).build();

    // Spawn the HTTP server on the main runtime
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    // Graceful shutdown: drain consumers, close sessions, close the bus
    services.shutdown().await;

    // Abort the server task (nothing useful left for it to serve)
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
