//! Tunnel Reverse Proxy binary.
//!
//! One binary, two roles:
//! - `tunnel-proxy router` runs the public + registration listeners
//! - `tunnel-proxy connector` registers tunnel sockets and forwards to a
//!   local target
//!
//! Both roles stop on Ctrl-C; the connector drains in-flight exchanges
//! for a few seconds before closing its sockets.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunnel_proxy::config::loader::load_config;
use tunnel_proxy::config::{ObservabilityConfig, TunnelConfig};
use tunnel_proxy::{Connector, Shutdown, TunnelRouter};

/// How long `connector stop` waits for in-flight exchanges to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "tunnel-proxy", about = "Reverse proxy over registered tunnel sockets")]
struct Cli {
    /// Path to a TOML config file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the router: public listener plus registration listener.
    Router,
    /// Run a connector: register tunnel sockets and forward to the target.
    Connector,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_proxy=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => TunnelConfig::default(),
    };

    init_metrics(&config.observability);

    match cli.command {
        Command::Router => run_router(config).await,
        Command::Connector => run_connector(config).await,
    }
}

fn init_metrics(observability: &ObservabilityConfig) {
    if !observability.metrics_enabled {
        return;
    }
    match observability.metrics_address.parse() {
        Ok(addr) => tunnel_proxy::observability::metrics::init_metrics(addr),
        Err(_) => tracing::error!(
            metrics_address = %observability.metrics_address,
            "Failed to parse metrics address"
        ),
    }
}

async fn run_router(config: TunnelConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        public_bind = %config.router.public_bind,
        registration_bind = %config.router.registration_bind,
        window_size = config.router.window_size,
        "Configuration loaded"
    );

    let public_listener = TcpListener::bind(&config.router.public_bind).await?;
    let registration_listener = TcpListener::bind(&config.router.registration_bind).await?;

    let shutdown = Shutdown::new();
    let router = TunnelRouter::new(config.router);

    let run = router.run(public_listener, registration_listener, &shutdown);
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
            shutdown.trigger();
            run.await?;
        }
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn run_connector(config: TunnelConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        routers = ?config.connector.routers,
        route = %config.connector.route,
        target = %config.connector.target,
        pool_size = config.connector.pool_size,
        "Configuration loaded"
    );

    let connector = Connector::start(config.connector);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    let drained = connector.stop(DRAIN_TIMEOUT).await;
    if !drained {
        tracing::warn!("Drain timeout hit; some exchanges were cut off");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
