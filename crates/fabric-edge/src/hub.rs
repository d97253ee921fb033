//! Per-domain network hub (C5) — the actor that owns one domain's set of
//! registered agents and in-flight ticket rendezvous.
//!
//! Grounded almost directly on the original `NetworkHub` in
//! `server/manager/hub.go`: a single task owns all mutable state and
//! reacts to events over channels (`select!` in place of Go's `select`),
//! which sidesteps the locking that `webSocketConnections`/
//! `clientConnections` would otherwise need. Two behaviors were added
//! that the original lacks: a pending-ticket timeout sweep and a
//! teardown-after-idle-grace sweep (`spec.md` §9 Open Questions).

use fabric_core::{bad_gateway_response, BoxedDuplex, Ticket, TicketGenerator, TrafficSink};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{split, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::copier::{self, Accounting};

/// Constructor knobs for a hub, passed down from `EdgeConfig`.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub flush_threshold_bytes: u64,
    pub pending_timeout: Duration,
    pub teardown_grace: Duration,
}

enum HubEvent {
    Register {
        conn: BoxedDuplex,
        allow_multiple_connections: bool,
    },
    Unregister {
        id: u64,
    },
    Public {
        conn: BoxedDuplex,
        is_http: bool,
    },
    Callback {
        ticket: Ticket,
        conn: BoxedDuplex,
    },
}

/// A lightweight handle a manager hands to listeners; cloning is cheap
/// and all clones share the same hub task.
#[derive(Clone)]
pub struct HubHandle {
    name: Arc<str>,
    tx: mpsc::Sender<HubEvent>,
    accounting: Arc<Mutex<Accounting>>,
}

impl HubHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the hub task has exited (idle teardown or shutdown).
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Total bytes copied through this hub's pairings so far
    /// (`spec.md` §3's `Hub.bytesTotal`), read by the `/traffic` admin
    /// surface.
    pub fn bytes_total(&self) -> u64 {
        self.accounting.lock().expect("accounting mutex poisoned").bytes_total()
    }

    pub async fn register_agent(&self, conn: BoxedDuplex, allow_multiple_connections: bool) {
        let _ = self
            .tx
            .send(HubEvent::Register {
                conn,
                allow_multiple_connections,
            })
            .await;
    }

    pub async fn handle_public(&self, conn: BoxedDuplex, is_http: bool) {
        let _ = self.tx.send(HubEvent::Public { conn, is_http }).await;
    }

    pub async fn handle_callback(&self, ticket: Ticket, conn: BoxedDuplex) {
        let _ = self.tx.send(HubEvent::Callback { ticket, conn }).await;
    }
}

/// Spawn a hub task for `domain` and return a handle to it.
pub fn spawn(
    domain: String,
    traffic_sink: Arc<dyn TrafficSink>,
    settings: HubSettings,
) -> HubHandle {
    let (tx, rx) = mpsc::channel(256);
    let name: Arc<str> = Arc::from(domain.as_str());
    let accounting = Accounting::shared();
    let hub = Hub {
        name: name.clone(),
        inbox: rx,
        self_tx: tx.clone(),
        notifications: HashMap::new(),
        pending: HashMap::new(),
        next_conn_id: 0,
        ticket_gen: TicketGenerator::new(),
        rng: StdRng::seed_from_u64(seed()),
        accounting: accounting.clone(),
        traffic_sink,
        settings,
    };
    tokio::spawn(hub.run());
    HubHandle { name, tx, accounting }
}

fn seed() -> u64 {
    // A hub-local seed is all the original's global XORShift needed;
    // nanosecond-granularity wall clock is unique enough per hub spawn.
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed)
}

struct NotificationSlot {
    write_half: WriteHalf<BoxedDuplex>,
    allow_multiple: bool,
}

struct PendingEntry {
    conn: BoxedDuplex,
    is_http: bool,
    notified_on: u64,
    inserted_at: Instant,
}

struct Hub {
    name: Arc<str>,
    inbox: mpsc::Receiver<HubEvent>,
    self_tx: mpsc::Sender<HubEvent>,
    notifications: HashMap<u64, NotificationSlot>,
    pending: HashMap<Ticket, PendingEntry>,
    next_conn_id: u64,
    ticket_gen: TicketGenerator,
    rng: StdRng,
    accounting: Arc<Mutex<Accounting>>,
    traffic_sink: Arc<dyn TrafficSink>,
    settings: HubSettings,
}

impl Hub {
    async fn run(mut self) {
        info!(hub = %self.name, "hub started");
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut idle_since: Option<Instant> = None;

        loop {
            tokio::select! {
                event = self.inbox.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_expired_pending().await;
                    if self.notifications.is_empty() && self.pending.is_empty() {
                        let idle_at = *idle_since.get_or_insert_with(Instant::now);
                        if idle_at.elapsed() >= self.settings.teardown_grace {
                            info!(hub = %self.name, "tearing down idle hub");
                            break;
                        }
                    } else {
                        idle_since = None;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_event(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register {
                conn,
                allow_multiple_connections,
            } => self.handle_register(conn, allow_multiple_connections).await,
            HubEvent::Unregister { id } => self.handle_unregister(id).await,
            HubEvent::Public { conn, is_http } => self.handle_public(conn, is_http).await,
            HubEvent::Callback { ticket, conn } => self.handle_callback(ticket, conn).await,
        }
    }

    async fn handle_register(&mut self, conn: BoxedDuplex, allow_multiple: bool) {
        if !allow_multiple && !self.notifications.is_empty() {
            warn!(hub = %self.name, "rejecting agent: a connection is already registered and multiples are disallowed");
            return;
        }

        let id = self.next_conn_id;
        self.next_conn_id += 1;
        let (read_half, write_half) = split(conn);
        self.notifications.insert(
            id,
            NotificationSlot {
                write_half,
                allow_multiple,
            },
        );
        info!(hub = %self.name, id, "agent registered");

        let tx = self.self_tx.clone();
        tokio::spawn(watch_liveness(id, read_half, tx));
    }

    async fn handle_unregister(&mut self, id: u64) {
        if self.notifications.remove(&id).is_some() {
            info!(hub = %self.name, id, "agent unregistered");
        }

        let orphaned: Vec<Ticket> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.notified_on == id)
            .map(|(ticket, _)| ticket.clone())
            .collect();
        for ticket in orphaned {
            if let Some(mut entry) = self.pending.remove(&ticket) {
                warn!(hub = %self.name, %ticket, "agent gone before callback arrived");
                close_pending(&mut entry).await;
            }
        }
    }

    async fn handle_public(&mut self, conn: BoxedDuplex, is_http: bool) {
        let mut entry = PendingEntry {
            conn,
            is_http,
            notified_on: 0,
            inserted_at: Instant::now(),
        };

        if self.notifications.is_empty() {
            close_pending(&mut entry).await;
            return;
        }

        let id = self.pick_agent();
        let ticket = self.ticket_gen.next();
        let slot = self
            .notifications
            .get_mut(&id)
            .expect("picked id is always a live key");

        let line = format!("{ticket}\n");
        let write_result =
            tokio::time::timeout(Duration::from_secs(5), slot.write_half.write_all(line.as_bytes()))
                .await;

        match write_result {
            Ok(Ok(())) => {
                entry.notified_on = id;
                self.pending.insert(ticket, entry);
            }
            _ => {
                warn!(hub = %self.name, id, "ticket notification write failed");
                close_pending(&mut entry).await;
            }
        }
    }

    async fn handle_callback(&mut self, ticket: Ticket, conn: BoxedDuplex) {
        match self.pending.remove(&ticket) {
            Some(entry) => {
                debug!(hub = %self.name, %ticket, "pairing callback with pending connection");
                copier::spawn(
                    entry.conn,
                    conn,
                    self.name.to_string(),
                    self.accounting.clone(),
                    self.traffic_sink.clone(),
                    self.settings.flush_threshold_bytes,
                );
            }
            None => {
                warn!(hub = %self.name, %ticket, "callback for unknown or expired ticket");
                let mut conn = conn;
                let _ = conn.write_all(fabric_core::bad_gateway_response()).await;
                let _ = conn.shutdown().await;
            }
        }
    }

    fn pick_agent(&mut self) -> u64 {
        let ids: Vec<u64> = self.notifications.keys().copied().collect();
        if ids.len() == 1 {
            return ids[0];
        }
        let idx = self.rng.gen_range(0..ids.len());
        ids[idx]
    }

    async fn sweep_expired_pending(&mut self) {
        let now = Instant::now();
        let timeout = self.settings.pending_timeout;
        let expired: Vec<Ticket> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.inserted_at) >= timeout)
            .map(|(ticket, _)| ticket.clone())
            .collect();
        for ticket in expired {
            if let Some(mut entry) = self.pending.remove(&ticket) {
                warn!(hub = %self.name, %ticket, "pending ticket timed out");
                close_pending(&mut entry).await;
            }
        }
    }

    async fn shutdown(mut self) {
        for (_, mut entry) in self.pending.drain() {
            close_pending(&mut entry).await;
        }
        self.notifications.clear();
        info!(hub = %self.name, "hub shut down");
    }
}

async fn close_pending(entry: &mut PendingEntry) {
    if entry.is_http {
        let _ = entry.conn.write_all(bad_gateway_response()).await;
    }
    let _ = entry.conn.shutdown().await;
}

/// Owns the read half of a registered agent connection; its sole job is
/// detecting closure (`server/manager/hub.go`'s `checkConnection`).
async fn watch_liveness(
    id: u64,
    mut read_half: ReadHalf<BoxedDuplex>,
    hub_tx: mpsc::Sender<HubEvent>,
) {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 256];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
    let _ = hub_tx.send(HubEvent::Unregister { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::NullTrafficSink;
    use tokio::io::{AsyncBufReadExt, BufReader};

    fn test_settings() -> HubSettings {
        HubSettings {
            flush_threshold_bytes: 64 * 1024,
            pending_timeout: Duration::from_secs(60),
            teardown_grace: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn single_agent_receives_every_ticket() {
        let handle = spawn("a.example".to_string(), Arc::new(NullTrafficSink), test_settings());
        let (agent_side, edge_side) = tokio::io::duplex(4096);
        handle.register_agent(Box::new(edge_side), false).await;

        for _ in 0..5 {
            let (_client, conn) = tokio::io::duplex(64);
            handle.handle_public(Box::new(conn), false).await;
        }

        let mut lines = BufReader::new(agent_side).lines();
        for _ in 0..5 {
            let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
                .await
                .expect("ticket arrived in time")
                .unwrap()
                .unwrap();
            assert!(!line.trim().is_empty());
        }
    }

    /// S6 (adapted): three agents registered with `allowMultipleConnections`,
    /// a fixed small N of public connections should spread across all
    /// three rather than piling onto one.
    #[tokio::test]
    async fn public_connections_spread_across_multiple_agents() {
        let handle = spawn("d.example".to_string(), Arc::new(NullTrafficSink), test_settings());

        let mut agent_readers = Vec::new();
        for _ in 0..3 {
            let (agent_side, edge_side) = tokio::io::duplex(4096);
            handle.register_agent(Box::new(edge_side), true).await;
            agent_readers.push(BufReader::new(agent_side).lines());
        }

        const N: usize = 240;
        for _ in 0..N {
            let (_client, conn) = tokio::io::duplex(64);
            handle.handle_public(Box::new(conn), false).await;
        }

        let mut counts = vec![0usize; agent_readers.len()];
        let mut remaining = N;
        while remaining > 0 {
            for (i, reader) in agent_readers.iter_mut().enumerate() {
                match tokio::time::timeout(Duration::from_millis(50), reader.next_line()).await {
                    Ok(Ok(Some(_))) => {
                        counts[i] += 1;
                        remaining -= 1;
                    }
                    _ => continue,
                }
                if remaining == 0 {
                    break;
                }
            }
        }

        for count in &counts {
            assert!(*count > 0, "every agent should receive at least one ticket: {counts:?}");
        }
        let total: usize = counts.iter().sum();
        assert_eq!(total, N);
    }

    #[tokio::test]
    async fn public_connection_gets_bad_gateway_with_no_agents() {
        let handle = spawn("b.example".to_string(), Arc::new(NullTrafficSink), test_settings());
        let (mut client, conn) = tokio::io::duplex(4096);
        handle.handle_public(Box::new(conn), true).await;

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 502"));
    }

    #[tokio::test]
    async fn agent_disappearance_closes_pending_with_bad_gateway() {
        let handle = spawn("e.example".to_string(), Arc::new(NullTrafficSink), test_settings());
        let (agent_side, edge_side) = tokio::io::duplex(4096);
        handle.register_agent(Box::new(edge_side), false).await;

        let (mut client, conn) = tokio::io::duplex(4096);
        handle.handle_public(Box::new(conn), true).await;

        // Drop the agent's end of the notification channel before any
        // callback arrives — `watch_liveness` observes EOF and the hub
        // should fall back to 502 for the still-pending public connection.
        drop(agent_side);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 502"));
    }
}
