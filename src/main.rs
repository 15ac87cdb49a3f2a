//! elproxyd - EchoLink proxy daemon
//!
//! This is the main entry point for the elproxy daemon.

use anyhow::{Context, Result};
use clap::Parser;
use elproxy::config::load_config;
use elproxy::proxy::Proxy;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// elproxyd - EchoLink proxy daemon
#[derive(Parser, Debug)]
#[command(name = "elproxyd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    info!("elproxy v{}", elproxy::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    let mut proxy = Proxy::new(config).context("Failed to create proxy")?;
    proxy.open().await.context("Failed to open proxy")?;
    proxy.start().await.context("Failed to start proxy")?;

    // Setup shutdown signal
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl+C and termination signals
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down...");
        }

        let _ = shutdown_tx.send(true);
    });

    // Drive the acceptor until a signal or an acceptor error stops it
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                proxy.shutdown();
                break;
            }
            res = proxy.process() => match res {
                Ok(()) => {}
                Err(e) if e.is_transport_lost() => break,
                Err(e) => {
                    warn!("Acceptor stopped: {}", e);
                    break;
                }
            }
        }
    }

    proxy.close().await;

    info!("Proxy is down.");

    Ok(())
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
