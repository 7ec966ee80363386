//! Colloquy Server - standalone headless server for the Colloquy
//! meeting-intelligence pipeline.
//!
//! One process can run any subset of the subsystems: the WebSocket audio
//! gateway, the transcription collector, the decision listener, and
//! (optionally) the serving side of the remote transcriber. The original
//! deployment splits them into separate containers; toggles in the config
//! make both layouts work from the same binary.

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use colloquy_core::asr::build_transcriber;
use colloquy_core::{collector, decisions, gateway, TrackerStore};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Colloquy Server - meeting transcription and decision tracking.
#[derive(Parser, Debug)]
#[command(name = "colloquy-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Run only the gateway, regardless of config toggles.
    #[arg(long)]
    gateway_only: bool,

    /// Run only the collector, regardless of config toggles.
    #[arg(long)]
    collector_only: bool,

    /// Run only the decision listener, regardless of config toggles.
    #[arg(long)]
    decisions_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Colloquy Server v{}", env!("CARGO_PKG_VERSION"));

    // A config validation failure here is the only non-zero exit path.
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    if args.gateway_only || args.collector_only || args.decisions_only {
        config.enable_gateway = args.gateway_only;
        config.enable_collector = args.collector_only;
        config.enable_decisions = args.decisions_only;
        config.enable_transcriber_service = false;
    }

    log::info!(
        "Subsystems: gateway={}, collector={}, decisions={}, transcriber_service={}",
        config.enable_gateway,
        config.enable_collector,
        config.enable_decisions,
        config.enable_transcriber_service
    );

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    if config.enable_gateway {
        let gateway_config = config.gateway_config();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = gateway::run(gateway_config, token).await {
                log::error!("Gateway terminated: {e}");
            }
        }));
    }

    if config.enable_collector {
        let collector_config = config.collector_config();
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = collector::run(collector_config, token).await {
                log::error!("Collector terminated: {e}");
            }
        }));
    }

    if config.enable_decisions {
        let decision_config = config.decision_config();
        let llm_config = config.llm_config();
        let tracker = Arc::new(TrackerStore::new());
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = decisions::run(decision_config, llm_config, tracker, token).await {
                log::error!("Decision listener terminated: {e}");
            }
        }));
    }

    if config.enable_transcriber_service {
        let service_config = config.transcriber_service_config();
        let transcriber = build_transcriber(&config.gateway_config())
            .context("Failed to build transcriber backend")?;
        let token = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = colloquy_core::asr::service::run(service_config, transcriber, token).await
            {
                log::error!("Transcriber service terminated: {e}");
            }
        }));
    }

    log::info!("All subsystems started");

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, draining...");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

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
