//! Notification-channel dialer (C8 steps 1, 2, 4): establishes and
//! maintains the agent's outbound connection to the edge, and dispatches
//! each ticket it reads off that connection to [`crate::ticket_task`].
//!
//! Grounded on the original `startClient`/`checkConnection`/
//! `handleTickets` in `client/main.go`: a reconnect loop with a fixed
//! retry delay, a periodic keepalive write, and a read loop that treats
//! each inbound message as one ticket. The original frames tickets as
//! websocket text messages; here the wire is the same plain
//! newline-delimited stream the edge's hub writes (`spec.md` §6), so the
//! read loop splits on `\n` instead of reading websocket frames. A
//! `close` line is a sentinel, not a ticket (`spec.md` §6): it ends the
//! session and falls through to the reconnect loop in `run`.

use crate::backend::BackendTarget;
use crate::config::AgentConfig;
use fabric_core::BoxedDuplex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(3);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnect forever, running one registered session at a time. Returns
/// only if told to by an external shutdown signal (never in practice
/// today; kept as a future-expansion seam the same way the original's
/// `for {}` loop was never meant to exit).
pub async fn run(config: Arc<AgentConfig>, backend: Arc<BackendTarget>, http_client: reqwest::Client) {
    loop {
        match connect(&config).await {
            Ok(conn) => {
                info!(edge = %config.notification_addr, "connected to edge");
                handle_session(conn, config.clone(), backend.clone(), http_client.clone()).await;
            }
            Err(e) => {
                warn!(edge = %config.notification_addr, error = %e, "failed to connect to edge");
            }
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }
}

async fn connect(config: &AgentConfig) -> std::io::Result<BoxedDuplex> {
    let tcp = TcpStream::connect(&config.notification_addr).await?;
    let mut conn: BoxedDuplex = if config.use_tls {
        let host = config
            .notification_addr
            .rsplit_once(':')
            .map(|(h, _)| h)
            .unwrap_or(&config.notification_addr);
        let tls_config = if config.verify_server_cert {
            crate::tls::native_roots_config()
        } else {
            crate::tls::no_verify_config()
        };
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        Box::new(connector.connect(server_name, tcp).await?)
    } else {
        Box::new(tcp)
    };

    let host = config
        .notification_addr
        .rsplit_once(':')
        .map(|(h, _)| h)
        .unwrap_or(&config.notification_addr);
    let request = format!(
        "GET / HTTP/1.1\r\nHost: {host}\r\nAuthorization: {}\r\n\r\n",
        config.api_secret
    );
    conn.write_all(request.as_bytes()).await?;

    let mut buf = Vec::new();
    fabric_core::read_until_headers_end(&mut conn, &mut buf, 8 * 1024).await?;
    if !buf.starts_with(b"HTTP/1.1 200") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "edge rejected registration handshake",
        ));
    }

    Ok(conn)
}

async fn handle_session(
    conn: BoxedDuplex,
    config: Arc<AgentConfig>,
    backend: Arc<BackendTarget>,
    http_client: reqwest::Client,
) {
    let (read_half, mut write_half) = tokio::io::split(conn);
    let mut lines = BufReader::new(read_half).lines();

    let keepalive = tokio::spawn(async move {
        loop {
            tokio::time::sleep(KEEPALIVE_INTERVAL).await;
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let ticket = line.trim();
                if ticket.is_empty() {
                    continue;
                }
                if ticket == "close" {
                    info!("edge sent close sentinel, disconnecting");
                    break;
                }
                debug!(ticket, "received ticket");
                let config = config.clone();
                let backend = backend.clone();
                let http_client = http_client.clone();
                tokio::spawn(async move {
                    if let Err(e) =
                        crate::ticket_task::handle(ticket.to_string(), config, backend, http_client)
                            .await
                    {
                        warn!(ticket, error = %e, "ticket handling failed");
                    }
                });
            }
            Ok(None) => {
                info!("edge closed the notification channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "notification channel read error");
                break;
            }
        }
    }

    keepalive.abort();
}
