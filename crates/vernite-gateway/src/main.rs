//! vernite-gateway: real-time WebSocket gateway for Vernite clients.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use vernite_gateway::handlers::{self, HandlerDeps};
use vernite_gateway::{GatewayConfig, GatewayServer, MemorySessionStore};

/// vernite-gateway: Vernite real-time gateway
///
/// The standalone binary authenticates connections, relays text frames and
/// sends heartbeats. It ships no chat integration, so typed packets such as
/// `SendMessage` are logged and dropped. Applications that own a
/// `Communicator` embed the library instead and pass it to
/// `handlers::catalog` through `HandlerDeps`.
#[derive(Parser, Debug)]
#[command(name = "vernite-gateway", version, about = "Vernite real-time gateway")]
struct Cli {
    /// Listen port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address (overrides the config file)
    #[arg(long)]
    host: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.vernite/gateway.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting vernite-gateway");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(Some(&config_path), cli.host, cli.port) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let seeds = config.sessions.clone();
    if !seeds.is_empty() {
        info!(count = seeds.len(), "seeding in-memory session store");
    }
    let store = Arc::new(MemorySessionStore::from_records(
        seeds.into_iter().map(|seed| seed.into_record()),
    ));

    let registry = match handlers::catalog(HandlerDeps::default()) {
        Ok(registry) => registry,
        Err(e) => {
            error!(error = %e, "failed to build handler registry");
            std::process::exit(1);
        }
    };
    if registry.is_empty() {
        info!("no integrations configured, typed packets will be dropped");
    } else {
        info!(types = ?registry.type_names(), "handler registry built");
    }

    let server = GatewayServer::new(config, store, registry);
    let shutdown = server.shutdown_handle();

    let (addr, accept_loop) = match server.start().await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };
    info!(addr = %addr, "listening");

    shutdown_signal().await;
    info!("received shutdown signal");
    let _ = shutdown.send(());

    if let Err(e) = accept_loop.await {
        error!(error = %e, "accept loop panicked");
    }
    info!("vernite-gateway stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
