//! Perpetuals keeper
//!
//! Off-chain keeper for a perpetual futures protocol:
//! - Mirrors position lifecycle events into a local SQLite store
//! - Liquidates positions that fall below maintenance margin
//! - Triggers funding rate updates on a fixed schedule

use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use keeper_core::{KeeperConfig, LogFormat, Orchestrator};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match KeeperConfig::load() {
        Ok(config) => config,
        Err(e) => {
            // Tracing is not up yet
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    info!("Starting perpetuals keeper");
    config.log_config();

    let orchestrator = match Orchestrator::connect(config).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Startup failed");
            return ExitCode::FAILURE;
        }
    };

    match orchestrator.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Keeper stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Keeper stopped on fatal error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(config: &KeeperConfig) {
    // RUST_LOG wins over LOG_LEVEL
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT, initiating graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
