//! Admin status surface (A7) — `/health` and `/traffic` only.
//!
//! Grounded on the `urlsToIgnore` reserved-path list in the original
//! `server/manager/listener.go` (`/`, `/health`, `/traffic` are always
//! treated as public, never as tunnel traffic); this module is what
//! answers those two diagnostic paths in-process. The full admin CRUD
//! surface (`add/update/delete` domains) named in `spec.md` §6 is an
//! external collaborator, out of scope here.

use crate::manager::Manager;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

pub async fn run(addr: String, manager: Arc<Manager>) -> std::io::Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "admin listener bound");

    loop {
        let (mut stream, peer) = listener.accept().await?;
        let manager = manager.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_one(&mut stream, &manager).await {
                debug!(peer = %peer, error = %e, "admin request failed");
            }
        });
    }
}

async fn serve_one(
    stream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
    manager: &Manager,
) -> std::io::Result<()> {
    let mut buf = vec![0u8; 512];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }
    buf.truncate(n);

    let path = request_path(&buf);

    let body = match path {
        "/health" => "ok\n".to_string(),
        "/traffic" => format!(
            "{{\"active_hubs\":{},\"bytes_total\":{}}}\n",
            manager.active_hub_count(),
            manager.total_bytes_copied()
        ),
        _ => {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await?;
            return stream.shutdown().await;
        }
    };

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

fn request_path(buf: &[u8]) -> &str {
    let line_end = buf.iter().position(|&b| b == b'\n').unwrap_or(buf.len());
    let line = std::str::from_utf8(&buf[..line_end]).unwrap_or("");
    line.split(' ').nth(1).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_path_from_request_line() {
        assert_eq!(request_path(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n"), "/health");
        assert_eq!(request_path(b"GET /traffic HTTP/1.1\r\n"), "/traffic");
    }
}
