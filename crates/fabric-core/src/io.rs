//! Buffered-prefix connection wrapper (C1).
//!
//! Classification needs to peek bytes before it can decide what a
//! connection is; downstream parsers still need to see those bytes. A
//! [`PrefixedStream`] replays a prefix buffer before falling through to
//! the underlying stream, transparently to any `AsyncRead`/`AsyncWrite`
//! consumer.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Any full-duplex, `Send`, `Unpin` byte stream — a `TcpStream`, a
/// `tokio_rustls` `TlsStream`, or a test `DuplexStream` all qualify. The
/// edge and agent both juggle a mix of plain and TLS connections behind
/// one type so hubs, copiers, and dialers don't need to be generic over
/// the concrete transport.
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Duplex for T {}

/// A boxed [`Duplex`] — the currency type passed between the listener,
/// hub, and copier.
pub type BoxedDuplex = Box<dyn Duplex>;

/// Wraps `S` so that `prefix` is drained before further reads reach `S`.
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    prefix_pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            prefix_pos: 0,
        }
    }

    /// Wrap a stream with no replayed prefix — equivalent to `inner` itself.
    pub fn passthrough(inner: S) -> Self {
        Self::new(inner, Vec::new())
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn remaining_prefix(&self) -> &[u8] {
        &self.prefix[self.prefix_pos..]
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.prefix_pos < self.prefix.len() {
            let remaining = self.remaining_prefix();
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Keep reading from `stream` into `buf` until it contains a full
/// `\r\n\r\n` header terminator or `cap` bytes have been buffered.
/// Classification only needs the first line; resolving the `Host`
/// header needs the whole block, so the listener calls this once it
/// knows it is looking at an HTTP request.
pub async fn read_until_headers_end<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<()> {
    let mut scan_from = 0;
    loop {
        if let Some(pos) = find_subslice(&buf[scan_from..], b"\r\n\r\n") {
            let _ = pos;
            return Ok(());
        }
        scan_from = buf.len().saturating_sub(3);

        if buf.len() >= cap {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "header block exceeded cap before terminator was found",
            ));
        }

        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers were complete",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefix_replayed_before_inner() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"more").await.unwrap();
        });

        let mut wrapped = PrefixedStream::new(client, b"prefix-".to_vec());
        let mut out = [0u8; 11];
        wrapped.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"prefix-more");
    }

    #[tokio::test]
    async fn empty_prefix_is_passthrough() {
        let (client, mut server) = tokio::io::duplex(64);
        tokio::spawn(async move {
            server.write_all(b"hello").await.unwrap();
        });

        let mut wrapped = PrefixedStream::passthrough(client);
        let mut out = [0u8; 5];
        wrapped.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }

    #[tokio::test]
    async fn reads_until_header_terminator_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            client.write_all(b"Host: a.example\r\n\r\n").await.unwrap();
            client.write_all(b"trailing-body").await.unwrap();
        });

        let mut buf = b"GET ".to_vec();
        read_until_headers_end(&mut server, &mut buf, 4096)
            .await
            .unwrap();
        assert!(buf.ends_with(b"\r\n\r\n"));
        assert!(buf.starts_with(b"GET / HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn errors_when_cap_exceeded_without_terminator() {
        let (mut client, mut server) = tokio::io::duplex(256);
        tokio::spawn(async move {
            client.write_all(&[b'a'; 64]).await.unwrap();
            // Never send the terminator; let the duplex idle so the
            // reader hits the cap rather than EOF.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            drop(client);
        });

        let mut buf = Vec::new();
        let err = read_until_headers_end(&mut server, &mut buf, 32)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
