//! fabric-agent: the agent half of the reverse-tunnel proxy fabric.
//! Dials out to an edge server, registers a domain, and forwards every
//! ticket it receives to a local backend.

mod backend;
mod config;
mod dialer;
mod tls;
mod ticket_task;

use clap::Parser;
use config::AgentConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// fabric-agent — reverse-tunnel proxy fabric agent
#[derive(Parser, Debug)]
#[command(name = "fabric-agent", version, about = "Reverse-tunnel proxy fabric agent")]
struct Cli {
    /// Edge notification-channel address (host:port)
    #[arg(long)]
    edge: Option<String>,

    /// Domain this agent registers as
    #[arg(long)]
    domain: Option<String>,

    /// API secret sent in the registration handshake
    #[arg(long)]
    api_secret: Option<String>,

    /// Local backend target, e.g. `tcp://127.0.0.1:8080`
    #[arg(long)]
    backend: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.fabric-agent/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting fabric-agent");

    let config_path = PathBuf::from(&cli.config);
    let agent_config = match AgentConfig::load(
        Some(&config_path),
        cli.edge.as_deref(),
        cli.domain.as_deref(),
        cli.api_secret.as_deref(),
        cli.backend.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let backend_target = match backend::parse(&agent_config.backend_target) {
        Ok(target) => target,
        Err(e) => {
            error!(error = %e, "invalid backend target");
            std::process::exit(1);
        }
    };

    let http_client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("building the backend http client");

    let config = Arc::new(agent_config);
    let backend_target = Arc::new(backend_target);

    info!(
        edge = %config.notification_addr,
        domain = %config.domain,
        backend = %config.backend_target,
        "agent configured"
    );

    tokio::select! {
        _ = dialer::run(config, backend_target, http_client) => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("fabric-agent stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
