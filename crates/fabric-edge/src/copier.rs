//! Bidirectional byte copier (C7) — pairs a pending public connection
//! with the agent's data-callback connection once a ticket matches.
//!
//! Grounded on `wsh-server`'s `GatewayForwarder::tcp_relay` for the
//! cancel-on-first-exit shape (a `watch` channel stands in for that
//! function's `mpsc` cancel signal, since here either side closing must
//! cancel the other rather than a single external caller), and on the
//! original `NetworkHub.syncConnections`/`addDataUsage` for the
//! per-domain accounting accumulator: one `Accounting` per hub, shared
//! across every pair that hub ever stitches together, flushed to the
//! `TrafficSink` once the accumulator crosses `flush_threshold_bytes`.

use fabric_core::{BoxedDuplex, TrafficSink};
use std::sync::{Arc, Mutex};
use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::watch;
use tracing::debug;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Per-hub running byte counters, shared by every active pair.
#[derive(Default)]
pub struct Accounting {
    bytes_since_flush: u64,
    bytes_total: u64,
}

impl Accounting {
    pub fn shared() -> Arc<Mutex<Accounting>> {
        Arc::new(Mutex::new(Accounting::default()))
    }

    /// Total bytes ever copied through this hub's pairings, flushed or
    /// not — `spec.md` §3's `Hub.bytesTotal`, read by the `/traffic`
    /// admin surface.
    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }
}

/// Spawn the pair of copy tasks that relay `a` <-> `b`, reporting bytes
/// moved to `accounting`/`sink`. Returns once both directions have
/// stopped and both sockets are closed.
pub fn spawn(
    a: BoxedDuplex,
    b: BoxedDuplex,
    domain: String,
    accounting: Arc<Mutex<Accounting>>,
    sink: Arc<dyn TrafficSink>,
    flush_threshold: u64,
) {
    tokio::spawn(run(a, b, domain, accounting, sink, flush_threshold));
}

async fn run(
    a: BoxedDuplex,
    b: BoxedDuplex,
    domain: String,
    accounting: Arc<Mutex<Accounting>>,
    sink: Arc<dyn TrafficSink>,
    flush_threshold: u64,
) {
    let (ra, wa) = split(a);
    let (rb, wb) = split(b);
    let (close_tx, close_rx) = watch::channel(false);

    let t1 = tokio::spawn(copy_direction(
        ra,
        wb,
        close_rx.clone(),
        close_tx.clone(),
        domain.clone(),
        accounting.clone(),
        sink.clone(),
        flush_threshold,
    ));
    let t2 = tokio::spawn(copy_direction(
        rb,
        wa,
        close_rx,
        close_tx,
        domain,
        accounting,
        sink,
        flush_threshold,
    ));

    let _ = tokio::join!(t1, t2);
}

#[allow(clippy::too_many_arguments)]
async fn copy_direction(
    mut read: ReadHalf<BoxedDuplex>,
    mut write: WriteHalf<BoxedDuplex>,
    mut close_rx: watch::Receiver<bool>,
    close_tx: watch::Sender<bool>,
    domain: String,
    accounting: Arc<Mutex<Accounting>>,
    sink: Arc<dyn TrafficSink>,
    flush_threshold: u64,
) {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        tokio::select! {
            changed = close_rx.changed() => {
                if changed.is_err() || *close_rx.borrow() {
                    break;
                }
            }
            result = read.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        report(&accounting, sink.as_ref(), &domain, n as u64, flush_threshold);
                    }
                    Err(e) => {
                        debug!(domain, error = %e, "copy direction read error");
                        break;
                    }
                }
            }
        }
    }
    let _ = close_tx.send(true);
    let _ = write.shutdown().await;
}

fn report(
    accounting: &Mutex<Accounting>,
    sink: &dyn TrafficSink,
    domain: &str,
    bytes: u64,
    flush_threshold: u64,
) {
    let mut acc = accounting.lock().expect("accounting mutex poisoned");
    acc.bytes_since_flush += bytes;
    acc.bytes_total += bytes;
    if acc.bytes_since_flush >= flush_threshold {
        sink.record(domain, acc.bytes_since_flush);
        acc.bytes_since_flush = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::NullTrafficSink;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[tokio::test]
    async fn relays_bytes_both_directions_and_closes_on_eof() {
        let (client_a, mut test_a) = tokio::io::duplex(1024);
        let (client_b, mut test_b) = tokio::io::duplex(1024);

        spawn(
            Box::new(client_a),
            Box::new(client_b),
            "a.example".to_string(),
            Accounting::shared(),
            Arc::new(NullTrafficSink),
            64 * 1024,
        );

        test_a.write_all(b"hello-from-a").await.unwrap();
        let mut buf = [0u8; 12];
        test_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-from-a");

        test_b.write_all(b"hello-from-b").await.unwrap();
        let mut buf2 = [0u8; 12];
        test_a.read_exact(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"hello-from-b");

        drop(test_a);
        // Dropping one side should eventually close the other too; give
        // the copier a moment to propagate it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut rest = Vec::new();
        let res = test_b.read_to_end(&mut rest).await;
        assert!(res.is_ok());
    }
}
