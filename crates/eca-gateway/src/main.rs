//! eca-gateway: real-time gateway for edge-cache agents.
//!
//! Accepts Socket.IO-over-WebSocket connections from ECAs, resolves the node
//! identity each one claims against the node registry, and dispatches the
//! gateway's named events for the lifetime of the connection.

mod auth;
mod config;
mod lifecycle;
mod registry;
mod router;
mod server;
mod session;
mod store;
mod transport;

use auth::AdmissionPolicy;
use clap::Parser;
use config::GatewayConfig;
use server::EcaGateway;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::MongoIdentityStore;
use tracing::{error, info};

/// eca-gateway: edge-cache agent gateway
#[derive(Parser, Debug)]
#[command(name = "eca-gateway", version, about = "Edge-cache agent gateway")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.packetframe/gateway.toml")]
    config: String,

    /// MongoDB connection string for the node registry
    #[arg(long)]
    mongo_uri: Option<String>,

    /// Admission policy (advisory, require-resolved, require-authorized)
    #[arg(long)]
    admission: Option<AdmissionPolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting eca-gateway");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        cli.bind,
        cli.port,
        cli.mongo_uri.as_deref(),
        cli.admission,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    // No listener is started against an unreachable node registry.
    let store = match MongoIdentityStore::connect(&config.store).await {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, uri = %config.store.uri, "failed to connect to database");
            std::process::exit(1);
        }
    };

    let gateway = EcaGateway::new(config, Arc::new(store));
    if let Err(e) = gateway.run(shutdown_signal()).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    info!("eca-gateway stopped");
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
