//! Domain-to-hub manager (C6) — owns the `domain -> HubHandle` map and
//! lazily creates hubs on first registration.
//!
//! Grounded on the original `Manager.manage` in `server/manager/manager.go`,
//! generalized from a single `select!` loop over three channels to a
//! `DashMap` guarded lazy-create, since unlike the Go original a Rust hub
//! can simply be looked up and created under a short-held entry lock
//! without routing every event through one more central task.

use dashmap::DashMap;
use fabric_core::{DomainStore, Ticket, TrafficSink};
use fabric_core::{BoxedDuplex, FabricError, FabricResult};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::hub::{self, HubHandle, HubSettings};

/// Dispatches classified connections to the right per-domain hub,
/// resolving domains through the configured `DomainStore` and creating
/// hubs on demand.
pub struct Manager {
    hubs: DashMap<String, HubHandle>,
    domains: Arc<dyn DomainStore>,
    traffic_sink: Arc<dyn TrafficSink>,
    hub_settings: HubSettings,
}

impl Manager {
    pub fn new(
        domains: Arc<dyn DomainStore>,
        traffic_sink: Arc<dyn TrafficSink>,
        hub_settings: HubSettings,
    ) -> Self {
        Self {
            hubs: DashMap::new(),
            domains,
            traffic_sink,
            hub_settings,
        }
    }

    pub fn active_hub_count(&self) -> usize {
        self.hubs.len()
    }

    /// Sum of `Hub.bytesTotal` (`spec.md` §3) across every live hub —
    /// read by the `/traffic` admin surface.
    pub fn total_bytes_copied(&self) -> u64 {
        self.hubs.iter().map(|entry| entry.bytes_total()).sum()
    }

    /// A notification-channel connection just presented credentials for
    /// `domain_name`. Validate against the domain store and, if valid,
    /// register it with that domain's hub (creating the hub if needed).
    pub async fn on_notification_upgrade(
        &self,
        domain_name: &str,
        api_key: &str,
        conn: BoxedDuplex,
    ) -> FabricResult<()> {
        let record = self
            .domains
            .resolve(domain_name)
            .await
            .ok_or_else(|| FabricError::UnknownDomain(domain_name.to_string()))?;

        if record.api_key != api_key {
            warn!(domain = domain_name, "agent registration rejected: bad api key");
            return Err(FabricError::Other("invalid api key".to_string()));
        }

        let handle = self.hub_for(domain_name);
        handle
            .register_agent(conn, record.allow_multiple_connections)
            .await;
        Ok(())
    }

    /// A public client connection resolved to `domain_name`; hand it to
    /// that domain's hub if one is already running (agents registered,
    /// so a pairing is at least possible), or respond with a fallback
    /// close otherwise. A public connection must never spawn a hub —
    /// only agent registration does (`spec.md` §3, §4.6).
    pub async fn on_public_conn(&self, domain_name: &str, is_http: bool, mut conn: BoxedDuplex) {
        let existing = self
            .hubs
            .get(domain_name)
            .map(|entry| entry.clone())
            .filter(|handle| !handle.is_closed());

        match existing {
            Some(handle) => handle.handle_public(conn, is_http).await,
            None => {
                if self.domains.resolve(domain_name).await.is_none() {
                    warn!(domain = domain_name, "public connection for unknown domain");
                } else {
                    warn!(domain = domain_name, "public connection with no agents registered");
                }
                if is_http {
                    let _ = conn.write_all(fabric_core::bad_gateway_response()).await;
                }
                let _ = conn.shutdown().await;
            }
        }
    }

    /// An agent dialed back with `ticket`; hand the data connection to
    /// the owning domain's hub. The domain is whatever the callback's
    /// own Host/SNI resolved to — if no hub exists for it yet there is
    /// nothing this ticket could ever have paired with.
    pub async fn on_data_callback(&self, domain_name: &str, ticket: Ticket, mut conn: BoxedDuplex) {
        let handle = self.hubs.get(domain_name).map(|entry| entry.clone());
        match handle {
            Some(handle) => handle.handle_callback(ticket, conn).await,
            None => {
                warn!(domain = domain_name, %ticket, "data callback for domain with no hub");
                let _ = conn.write_all(fabric_core::bad_gateway_response()).await;
                let _ = conn.shutdown().await;
            }
        }
    }

    fn hub_for(&self, domain_name: &str) -> HubHandle {
        if let Some(existing) = self.hubs.get(domain_name) {
            if !existing.is_closed() {
                return existing.clone();
            }
        }

        let handle = hub::spawn(
            domain_name.to_string(),
            self.traffic_sink.clone(),
            self.hub_settings.clone(),
        );
        info!(domain = domain_name, "hub created");
        self.hubs.insert(domain_name.to_string(), handle.clone());
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_core::{DomainRecord, NullTrafficSink, StaticDomainStore};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn manager_with(records: Vec<DomainRecord>) -> Manager {
        let mut store = StaticDomainStore::new();
        for record in records {
            store.insert(record);
        }
        Manager::new(
            Arc::new(store),
            Arc::new(NullTrafficSink),
            HubSettings {
                flush_threshold_bytes: 64 * 1024,
                pending_timeout: Duration::from_secs(60),
                teardown_grace: Duration::from_secs(60),
            },
        )
    }

    fn agent_record(name: &str) -> DomainRecord {
        DomainRecord {
            id: 1,
            name: name.to_string(),
            api_key: "secret".to_string(),
            allow_multiple_connections: false,
        }
    }

    /// S1 — single-agent HTTP: a registered agent receives a ticket for a
    /// public request, dials back with it, and the verbatim request bytes
    /// make it through the pairing both ways.
    #[tokio::test]
    async fn single_agent_http_round_trip() {
        let manager = manager_with(vec![agent_record("a.example")]);

        let (mut agent_notifications, edge_side) = tokio::io::duplex(4096);
        manager
            .on_notification_upgrade("a.example", "secret", Box::new(edge_side))
            .await
            .unwrap();

        let request: &[u8] = b"GET /hello HTTP/1.1\r\nHost: a.example\r\n\r\n";
        let (mut public_client, public_edge_side) = tokio::io::duplex(4096);
        public_client.write_all(request).await.unwrap();

        manager
            .on_public_conn("a.example", true, Box::new(public_edge_side))
            .await;

        let mut ticket_line = String::new();
        let mut reader = BufReader::new(&mut agent_notifications);
        tokio::time::timeout(Duration::from_secs(1), reader.read_line(&mut ticket_line))
            .await
            .unwrap()
            .unwrap();
        let ticket = ticket_line.trim().to_string();
        assert!(!ticket.is_empty());

        let (mut backend_side, callback_edge_side) = tokio::io::duplex(4096);
        manager
            .on_data_callback("a.example", ticket.into(), Box::new(callback_edge_side))
            .await;

        let mut request_seen = vec![0u8; request.len()];
        tokio::time::timeout(Duration::from_secs(1), backend_side.read_exact(&mut request_seen))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request_seen, request);

        let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        backend_side.write_all(response).await.unwrap();
        drop(backend_side);

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), public_client.read_to_end(&mut seen))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, response);
    }

    /// S2 — a domain with no registered agents falls back to 502.
    #[tokio::test]
    async fn domain_with_no_agents_gets_bad_gateway() {
        let manager = manager_with(vec![agent_record("b.example")]);
        let (mut client, conn) = tokio::io::duplex(4096);
        manager.on_public_conn("b.example", true, Box::new(conn)).await;

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 502"));
        assert_eq!(manager.active_hub_count(), 0);
    }

    /// S3 — an unknown domain also falls back to 502, and no hub is
    /// created for it.
    #[tokio::test]
    async fn unknown_domain_gets_bad_gateway_and_no_hub() {
        let manager = manager_with(vec![]);
        let (mut client, conn) = tokio::io::duplex(4096);
        manager
            .on_public_conn("ghost.example", true, Box::new(conn))
            .await;

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 502"));
        assert_eq!(manager.active_hub_count(), 0);
    }

    #[tokio::test]
    async fn notification_upgrade_rejects_wrong_api_key() {
        let manager = manager_with(vec![agent_record("a.example")]);
        let (_agent, edge_side) = tokio::io::duplex(4096);
        let err = manager
            .on_notification_upgrade("a.example", "wrong-key", Box::new(edge_side))
            .await
            .unwrap_err();
        assert!(matches!(err, FabricError::Other(_)));
    }

    #[tokio::test]
    async fn data_callback_for_unknown_ticket_gets_bad_gateway() {
        let manager = manager_with(vec![agent_record("a.example")]);
        manager
            .on_notification_upgrade(
                "a.example",
                "secret",
                Box::new(tokio::io::duplex(4096).1),
            )
            .await
            .unwrap();

        let (mut client, conn) = tokio::io::duplex(4096);
        manager
            .on_data_callback("a.example", "999".into(), Box::new(conn))
            .await;

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(1), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.starts_with(b"HTTP/1.1 502"));
    }
}
