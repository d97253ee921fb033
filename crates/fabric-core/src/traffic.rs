//! Traffic sink trait (C7's collaborator) — `spec.md` §6, the
//! eventually-consistent per-domain byte aggregator that is out of
//! scope to persist here. A hub's accounting accumulator forwards to
//! whatever `TrafficSink` the edge was constructed with.

use tracing::info;

pub trait TrafficSink: Send + Sync {
    fn record(&self, domain: &str, bytes: u64);
}

/// Default traffic sink: logs each flush. Good enough for a
/// single-process deployment without an external aggregator; a real
/// deployment swaps this for one that pushes to the traffic-accounting
/// service named in `spec.md` §6.
#[derive(Debug, Default)]
pub struct LoggingTrafficSink;

impl TrafficSink for LoggingTrafficSink {
    fn record(&self, domain: &str, bytes: u64) {
        info!(domain, bytes, "traffic flush");
    }
}

/// Discards everything — used by tests that don't care about traffic
/// accounting.
#[derive(Debug, Default)]
pub struct NullTrafficSink;

impl TrafficSink for NullTrafficSink {
    fn record(&self, _domain: &str, _bytes: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct CountingSink(Arc<AtomicU64>);
    impl TrafficSink for CountingSink {
        fn record(&self, _domain: &str, bytes: u64) {
            self.0.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    #[test]
    fn sink_accumulates_bytes() {
        let counter = Arc::new(AtomicU64::new(0));
        let sink = CountingSink(counter.clone());
        sink.record("a.example", 10);
        sink.record("a.example", 5);
        assert_eq!(counter.load(Ordering::SeqCst), 15);
    }
}
