//! Pavonis - multi-tenant reverse proxy
//!
//! Process entry point: CLI parsing, logging setup, config loading, the main
//! HTTP listener, the optional diagnostics listener, and graceful shutdown on
//! SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pavonis::config::Config;
use pavonis::metrics::MetricsRegistry;
use pavonis::server::PavonisServer;
use pavonis::{diagnostics, VERSION};

/// Pavonis - multi-tenant reverse proxy
#[derive(Parser, Debug)]
#[command(name = "pavonis")]
struct Args {
    /// Path to the config yaml file
    #[arg(short = 'c', long = "config", default_value = "config.yml")]
    config: PathBuf,

    /// Show version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Accepts the `:8009` shorthand for an all-interfaces bind.
fn normalize_listen_addr(listen: &str) -> String {
    if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version {
        println!("Pavonis v{VERSION}");
        return Ok(());
    }

    // Install the rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let cfg = Config::load(&args.config)?;
    init_logging(cfg.debug);
    if cfg.debug {
        debug!("Debug logging enabled");
    }
    info!("Pavonis initializing ...");

    let cfg = Arc::new(cfg);
    let metrics = Arc::new(MetricsRegistry::new());
    let server =
        Arc::new(PavonisServer::new(cfg.clone(), metrics.clone()).context("server init failed")?);

    if cfg.diagnostics.enabled {
        let diagnostics_cfg = cfg.diagnostics.clone();
        let diagnostics_metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = diagnostics::run(&diagnostics_cfg, diagnostics_metrics).await {
                error!("Diagnostics server error: {e:#}");
            }
        });
    }

    let listen = normalize_listen_addr(&cfg.server.listen);
    let listener = TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!("Starting Pavonis v{} on {}", VERSION, listen);

    let app = server.clone().router();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server failed")?;

    info!("Shutting down ...");
    server.shutdown();
    info!("Pavonis stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(":8009"), "0.0.0.0:8009");
        assert_eq!(normalize_listen_addr("127.0.0.1:8009"), "127.0.0.1:8009");
        assert_eq!(normalize_listen_addr("0.0.0.0:80"), "0.0.0.0:80");
    }
}
