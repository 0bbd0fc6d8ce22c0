//! tcp-balancer
//!
//! L4 load balancer: accepts TCP connections on one address and relays each
//! one to the first healthy backend in the configured list.
//!
//! This binary:
//! - Loads the TOML config (or `--backends` from the command line)
//! - Probes every backend on a fixed interval
//! - Proxies client connections to the first healthy backend
//! - On Ctrl-C / SIGTERM stops accepting and drains open sessions

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcp_balancer::{Config, Overrides, Proxy};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Parser)]
#[command(name = "tcp-balancer")]
#[command(version, about = "L4 TCP load balancer with active health checking", long_about = None)]
struct Cli {
    /// Config file path (default: ./config.toml)
    #[arg(short, long, env = "TCPLB_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file (e.g. :25565)
    #[arg(long, env = "TCPLB_LISTEN")]
    listen: Option<String>,

    /// Comma-separated backends, overrides the config file (e.g. 127.0.0.1:9001,127.0.0.1:9002)
    #[arg(long, env = "TCPLB_BACKENDS")]
    backends: Option<String>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(long, env = "TCPLB_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value = "json")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Prefer RUST_LOG, fall back to --log-level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.clone().into());
    match cli.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let overrides = Overrides {
        listen: cli.listen,
        backends: cli.backends.as_deref().map(Overrides::parse_backend_list),
    };
    let config = match Config::load(cli.config.as_deref(), overrides) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e).context("failed to load configuration");
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        backend_count = config.backends.len(),
        backend_dial_timeout_ms = config.backend_dial_timeout.as_millis() as u64,
        healthcheck_dial_timeout_ms = config.healthcheck_dial_timeout.as_millis() as u64,
        healthcheck_interval_ms = config.healthcheck_interval.as_millis() as u64,
        "Configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            // Dropping the sender would read as shutdown; keep it alive.
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let proxy = Proxy::new(config);
    proxy
        .run(shutdown_rx)
        .await
        .with_context(|| format!("listener on {} failed", proxy.config().listen_addr))?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
