//! Front listener / classifier (C2).
//!
//! Grounded on `CustomListener.handle`/`acceptConnections` in the
//! original `server/manager/listener.go`: peek the first bytes, decide
//! what kind of connection this is, and dispatch — generalized here to
//! run identically against any of the three bound addresses (`spec.md`
//! §6 notes the three endpoints MAY share one port or be split across
//! several; splitting the ports doesn't change what each connection
//! turns out to be, so one `handle_connection` serves all three).

use fabric_core::{
    classify, header_value, read_until_headers_end, BoxedDuplex, Classification, FabricError,
    FabricResult, PrefixedStream,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::manager::Manager;
use crate::resolver::resolve_domain_name;

const INITIAL_PEEK_SIZE: usize = 1024;
const MAX_HEADER_BLOCK: usize = 16 * 1024;

const NOTIFICATION_OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n";

/// Run the accept loop for one bound address, handing every accepted
/// connection off to its own task.
pub async fn run(
    addr: String,
    tls_acceptor: Option<TlsAcceptor>,
    manager: Arc<Manager>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listener bound");

    loop {
        let (stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        let tls_acceptor = tls_acceptor.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, tls_acceptor, manager).await {
                debug!(peer = %peer, error = %e, "connection handling ended");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    manager: Arc<Manager>,
) -> FabricResult<()> {
    let (mut conn, sni): (BoxedDuplex, Option<String>) = match tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(|e| FabricError::Other(format!("tls handshake with {peer}: {e}")))?;
            let sni = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(|s| s.to_string());
            (Box::new(tls_stream), sni)
        }
        None => (Box::new(stream), None),
    };

    let mut buf = vec![0u8; INITIAL_PEEK_SIZE];
    let n = conn.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    match classify(&buf) {
        Classification::NotificationUpgrade => {
            read_until_headers_end(&mut conn, &mut buf, MAX_HEADER_BLOCK).await?;
            let host = header_value(&buf, "host");
            let domain = resolve_domain_name(sni.as_deref(), host).ok_or_else(|| {
                FabricError::Classification("notification upgrade with no Host/SNI".to_string())
            })?;
            let api_key = header_value(&buf, "authorization").unwrap_or("").to_string();

            conn.write_all(NOTIFICATION_OK_RESPONSE).await?;
            if let Err(e) = manager.on_notification_upgrade(&domain, &api_key, conn).await {
                warn!(domain, peer = %peer, error = %e, "agent registration rejected");
            }
        }
        Classification::DataCallback(ticket) => {
            read_until_headers_end(&mut conn, &mut buf, MAX_HEADER_BLOCK).await?;
            let host = header_value(&buf, "host");
            let domain = resolve_domain_name(sni.as_deref(), host).ok_or_else(|| {
                FabricError::Classification("data callback with no Host/SNI".to_string())
            })?;
            manager.on_data_callback(&domain, ticket.into(), conn).await;
        }
        classification @ (Classification::PublicHttp | Classification::PublicRaw) => {
            let is_http = classification == Classification::PublicHttp;
            let host = if is_http { header_value(&buf, "host") } else { None };
            let domain = resolve_domain_name(sni.as_deref(), host);
            let mut prefixed: BoxedDuplex = Box::new(PrefixedStream::new(conn, buf));

            match domain {
                Some(domain) => manager.on_public_conn(&domain, is_http, prefixed).await,
                None => {
                    debug!(peer = %peer, "public connection with no SNI/Host to route on");
                    if is_http {
                        let _ = prefixed.write_all(fabric_core::bad_gateway_response()).await;
                    }
                    let _ = prefixed.shutdown().await;
                }
            }
        }
    }

    Ok(())
}
