//! Backend dispatch (C8 steps 3c/3d): once a ticket connection lands in
//! the agent, forward its bytes to the locally configured backend per
//! `spec.md` §6's `tcp://`/`tls://`/`http://`/`https://` target schemes.
//!
//! Grounded on the original `client/handlers/tcp.go` (raw dial + copy,
//! `InsecureSkipVerify: true` for a `tls://` target) and
//! `client/handlers/http.go` (a pooled `http.Client` for ordinary
//! requests, falling back to a raw dial + copy for `Upgrade: websocket`
//! requests). `reqwest`'s own connection pool stands in for the Go
//! client's tuned `http.Transport`.

use fabric_core::{header_value, read_until_headers_end, BoxedDuplex, FabricError, FabricResult};
use std::time::Duration;
use tokio::io::{split, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const MAX_HEADER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendScheme {
    Tcp,
    Tls,
    Http,
    Https,
}

#[derive(Debug, Clone)]
pub struct BackendTarget {
    pub scheme: BackendScheme,
    pub host: String,
    pub port: u16,
}

impl BackendTarget {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn url_scheme(&self) -> &'static str {
        match self.scheme {
            BackendScheme::Http | BackendScheme::Tcp => "http",
            BackendScheme::Https | BackendScheme::Tls => "https",
        }
    }
}

/// Parse a `scheme://host:port` backend target (`spec.md` §6).
pub fn parse(raw: &str) -> FabricResult<BackendTarget> {
    let (scheme_str, rest) = raw
        .split_once("://")
        .ok_or_else(|| FabricError::Other(format!("backend target missing scheme: {raw}")))?;
    let scheme = match scheme_str {
        "tcp" => BackendScheme::Tcp,
        "tls" => BackendScheme::Tls,
        "http" => BackendScheme::Http,
        "https" => BackendScheme::Https,
        other => {
            return Err(FabricError::Other(format!(
                "unknown backend scheme: {other}"
            )))
        }
    };
    let (host, port_str) = rest
        .rsplit_once(':')
        .ok_or_else(|| FabricError::Other(format!("backend target missing port: {raw}")))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| FabricError::Other(format!("invalid backend port: {raw}")))?;
    Ok(BackendTarget {
        scheme,
        host: host.to_string(),
        port,
    })
}

/// Dial `target` raw (no HTTP involved), wrapping in TLS without
/// certificate verification when the scheme calls for it. This mirrors
/// `tls.Dial(..., &tls.Config{InsecureSkipVerify: true})` in the
/// original: a `tls://`/`https://` backend is almost always a local
/// self-signed service, so the agent never second-guesses its cert.
pub async fn dial_raw(target: &BackendTarget) -> std::io::Result<BoxedDuplex> {
    let tcp = TcpStream::connect(target.authority()).await?;
    match target.scheme {
        BackendScheme::Tcp | BackendScheme::Http => Ok(Box::new(tcp)),
        BackendScheme::Tls | BackendScheme::Https => {
            let connector = TlsConnector::from(std::sync::Arc::new(crate::tls::no_verify_config()));
            let server_name = rustls::pki_types::ServerName::try_from(target.host.clone())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
            let stream = connector.connect(server_name, tcp).await?;
            Ok(Box::new(stream))
        }
    }
}

/// Forward one ticket connection to `target`, consuming `conn` entirely.
///
/// For `tcp://`/`tls://` targets this is always a raw byte relay. For
/// `http://`/`https://` targets, ordinary requests are forwarded through
/// a pooled `reqwest::Client`; `Upgrade: websocket` requests fall back
/// to a raw relay (the upgraded connection stops being request/response
/// shaped the moment the 101 response goes out).
pub async fn forward(
    target: &BackendTarget,
    conn: BoxedDuplex,
    http_client: &reqwest::Client,
) -> FabricResult<()> {
    match target.scheme {
        BackendScheme::Tcp | BackendScheme::Tls => relay_raw(target, conn).await,
        BackendScheme::Http | BackendScheme::Https => forward_http(target, conn, http_client).await,
    }
}

async fn relay_raw(target: &BackendTarget, conn: BoxedDuplex) -> FabricResult<()> {
    let backend = dial_raw(target).await?;
    copy_both_ways(conn, backend).await;
    Ok(())
}

async fn forward_http(
    target: &BackendTarget,
    mut conn: BoxedDuplex,
    http_client: &reqwest::Client,
) -> FabricResult<()> {
    let mut head = Vec::new();
    read_until_headers_end(&mut conn, &mut head, MAX_HEADER_BYTES).await?;

    if is_websocket_upgrade(&head) {
        debug!(backend = %target.authority(), "relaying websocket upgrade raw");
        let mut backend = dial_raw(target).await?;
        backend.write_all(&head).await?;
        copy_both_ways(conn, backend).await;
        return Ok(());
    }

    forward_via_reqwest(target, &head, conn, http_client).await
}

async fn copy_both_ways(a: BoxedDuplex, b: BoxedDuplex) {
    let (mut ra, mut wa) = split(a);
    let (mut rb, mut wb) = split(b);
    let to_b = tokio::io::copy(&mut ra, &mut wb);
    let to_a = tokio::io::copy(&mut rb, &mut wa);
    let _ = tokio::try_join!(to_b, to_a);
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    let connection = header_value(head, "connection").unwrap_or_default().to_ascii_lowercase();
    let upgrade = header_value(head, "upgrade").unwrap_or_default().to_ascii_lowercase();
    connection.contains("upgrade") && upgrade == "websocket"
}

async fn forward_via_reqwest(
    target: &BackendTarget,
    head: &[u8],
    mut conn: BoxedDuplex,
    http_client: &reqwest::Client,
) -> FabricResult<()> {
    let mut headers_buf = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers_buf);
    let body_offset = match req.parse(head) {
        Ok(httparse::Status::Complete(n)) => n,
        _ => {
            return Err(FabricError::Other(
                "could not parse buffered request head".to_string(),
            ))
        }
    };
    let method = req.method.unwrap_or("GET").to_string();
    let path = req.path.unwrap_or("/").to_string();
    let content_length: usize = header_value(head, "content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = head[body_offset..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 4096];
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let url = format!("{}://{}{}", target.url_scheme(), target.authority(), path);
    let mut builder = http_client
        .request(
            reqwest::Method::from_bytes(method.as_bytes())
                .map_err(|e| FabricError::Other(e.to_string()))?,
            &url,
        )
        .timeout(Duration::from_secs(30));

    for h in req.headers.iter() {
        if h.name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(h.name, h.value);
    }
    builder = builder.header("host", &target.host);
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| {
        warn!(backend = %target.authority(), error = %e, "backend request failed");
        FabricError::Other(e.to_string())
    })?;

    write_response(&mut conn, response).await
}

async fn write_response(conn: &mut BoxedDuplex, response: reqwest::Response) -> FabricResult<()> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in response.headers().iter() {
        if let Ok(value_str) = value.to_str() {
            head.push_str(name.as_str());
            head.push_str(": ");
            head.push_str(value_str);
            head.push_str("\r\n");
        }
    }
    head.push_str("\r\n");

    let body = response
        .bytes()
        .await
        .map_err(|e| FabricError::Other(e.to_string()))?;
    conn.write_all(head.as_bytes()).await?;
    conn.write_all(&body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_target() {
        let t = parse("tcp://127.0.0.1:9000").unwrap();
        assert_eq!(t.scheme, BackendScheme::Tcp);
        assert_eq!(t.authority(), "127.0.0.1:9000");
    }

    #[test]
    fn parses_https_target() {
        let t = parse("https://backend.local:8443").unwrap();
        assert_eq!(t.scheme, BackendScheme::Https);
        assert_eq!(t.host, "backend.local");
        assert_eq!(t.port, 8443);
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(parse("127.0.0.1:9000").is_err());
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(parse("ftp://127.0.0.1:21").is_err());
    }

    #[test]
    fn detects_websocket_upgrade() {
        let head = b"GET /ws HTTP/1.1\r\nHost: a\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        assert!(is_websocket_upgrade(head));
    }

    #[test]
    fn plain_request_is_not_upgrade() {
        let head = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        assert!(!is_websocket_upgrade(head));
    }
}
