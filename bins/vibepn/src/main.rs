//! VibePN daemon
//!
//! Loads the configuration, starts the engine, and runs until a signal
//! or an admin `goodbye` asks it to stop.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use vibepn_core::{Config, EngineBuilder, TracingSink};

/// Peer-to-peer overlay VPN daemon
#[derive(Parser)]
#[command(name = "vibepn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "/etc/vibepn/config.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    let engine = EngineBuilder::new(config, cli.config.clone())
        .counters(std::sync::Arc::new(TracingSink))
        .start()
        .await
        .context("failed to start engine")?;

    info!("vibepn started");

    tokio::select! {
        _ = shutdown_signal() => {
            info!("signal received, shutting down");
            engine.shutdown().await;
        }
        _ = engine.wait_for_shutdown() => {
            // Admin goodbye already disconnected everyone.
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
