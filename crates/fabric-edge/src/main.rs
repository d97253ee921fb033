//! fabric-edge: the public-facing half of the reverse-tunnel proxy
//! fabric. Accepts public/notification/callback traffic across three
//! listeners and stitches matched connections together through one
//! `Manager` of per-domain hubs.

mod admin;
mod config;
mod copier;
mod hub;
mod listener;
mod manager;
mod resolver;
mod tls;

use clap::Parser;
use config::EdgeConfig;
use fabric_core::{DomainRecord, LoggingTrafficSink, StaticDomainStore, TtlCachedStore};
use hub::HubSettings;
use manager::Manager;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

/// fabric-edge — reverse-tunnel proxy fabric edge server
#[derive(Parser, Debug)]
#[command(name = "fabric-edge", version, about = "Reverse-tunnel proxy fabric edge server")]
struct Cli {
    /// Public-traffic listen address
    #[arg(long)]
    public_addr: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.fabric-edge/config.toml")]
    config: String,

    /// Generate a self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting fabric-edge");

    let (cert_path, key_path) = if cli.generate_cert {
        match tls::generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c), Some(k))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (
            cli.cert.as_ref().map(PathBuf::from),
            cli.key.as_ref().map(PathBuf::from),
        )
    };

    let config_path = PathBuf::from(&cli.config);
    let edge_config = match EdgeConfig::load(
        Some(&config_path),
        cli.public_addr.as_deref(),
        cert_path.as_ref().and_then(|p| p.to_str()),
        key_path.as_ref().and_then(|p| p.to_str()),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_acceptor = match (&edge_config.cert_path, &edge_config.key_path) {
        (Some(cert), Some(key)) => match tls::load_tls_config(cert, key) {
            Ok(cfg) => Some(TlsAcceptor::from(Arc::new(cfg))),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        _ => {
            info!("no TLS cert/key configured; serving plaintext only");
            None
        }
    };

    let mut domain_store = StaticDomainStore::new();
    for entry in &edge_config.domains {
        domain_store.insert(DomainRecord {
            id: 0,
            name: entry.name.clone(),
            api_key: entry.api_key.clone(),
            allow_multiple_connections: entry.allow_multiple_connections,
        });
    }
    let domains = Arc::new(TtlCachedStore::with_default_ttl(domain_store));

    let hub_settings = HubSettings {
        flush_threshold_bytes: edge_config.flush_threshold_bytes,
        pending_timeout: Duration::from_secs(edge_config.pending_timeout_secs),
        teardown_grace: Duration::from_secs(edge_config.teardown_grace_secs),
    };

    let manager = Arc::new(Manager::new(domains, Arc::new(LoggingTrafficSink), hub_settings));

    let public = tokio::spawn(listener::run(
        edge_config.public_addr.clone(),
        tls_acceptor.clone(),
        manager.clone(),
    ));
    let notification = tokio::spawn(listener::run(
        edge_config.notification_addr.clone(),
        tls_acceptor.clone(),
        manager.clone(),
    ));
    let admin = tokio::spawn(admin::run(edge_config.admin_addr.clone(), manager.clone()));

    tokio::select! {
        result = public => log_listener_exit("public", result),
        result = notification => log_listener_exit("notification", result),
        result = admin => log_listener_exit("admin", result),
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("fabric-edge stopped");
}

fn log_listener_exit(which: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(listener = which, error = %e, "listener exited with an error"),
        Err(e) => error!(listener = which, error = %e, "listener task panicked"),
    }
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
