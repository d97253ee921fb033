//! Per-ticket dial-back (C8 steps 3a/3b): open a second connection to
//! the edge naming the ticket, then hand the raw stream to
//! [`crate::backend::forward`].
//!
//! Grounded on `establishConnection` in the original `client/main.go`:
//! dial the same server address again at `/<ticket>`, and on failure to
//! connect write the canonical bad-gateway response back before giving
//! up (there the convention is reused even for a dial failure on the
//! agent side, since the pending public connection is still waiting on
//! the other end).

use crate::backend::BackendTarget;
use crate::config::AgentConfig;
use fabric_core::{BoxedDuplex, FabricResult};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub async fn handle(
    ticket: String,
    config: Arc<AgentConfig>,
    backend: Arc<BackendTarget>,
    http_client: reqwest::Client,
) -> FabricResult<()> {
    let conn = dial_callback(&config, &ticket).await?;
    debug!(ticket, backend = %backend.authority(), "forwarding ticket to backend");
    crate::backend::forward(&backend, conn, &http_client).await
}

async fn dial_callback(config: &AgentConfig, ticket: &str) -> std::io::Result<BoxedDuplex> {
    let tcp = TcpStream::connect(&config.notification_addr).await?;
    let mut conn: BoxedDuplex = if config.use_tls {
        let host = host_of(&config.notification_addr);
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

    let host = host_of(&config.notification_addr);
    let request = format!("GET /{ticket} HTTP/1.1\r\nHost: {host}\r\n\r\n");
    conn.write_all(request.as_bytes()).await?;
    Ok(conn)
}

fn host_of(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr)
}
