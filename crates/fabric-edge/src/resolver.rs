//! Domain resolution (C3) — turn a connection's SNI or `Host:` header
//! into the domain name the manager dispatches on.
//!
//! Grounded on the shape of `wsh-server/src/gateway/resolver.rs` (a
//! small, stateless helper module) and on the original's Host-header
//! handling in `server/manager/listener.go`/`handleTunnel`, which always
//! prefers the already-terminated TLS SNI over the header when both are
//! present (the SNI was authenticated by the TLS handshake; the header
//! is attacker-controlled plaintext on a plain connection).

use fabric_core::host_without_port;

/// Resolve the domain name a connection is addressed to. `sni` (if the
/// connection came in over TLS and carried a `server_name`) always wins
/// over a `Host` header parsed from the buffered request.
pub fn resolve_domain_name(sni: Option<&str>, host_header: Option<&str>) -> Option<String> {
    if let Some(sni) = sni {
        return Some(sni.to_string());
    }
    host_header.map(host_without_port).map(|h| h.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_sni_over_host_header() {
        assert_eq!(
            resolve_domain_name(Some("a.example"), Some("b.example")),
            Some("a.example".to_string())
        );
    }

    #[test]
    fn falls_back_to_host_header_without_sni() {
        assert_eq!(
            resolve_domain_name(None, Some("b.example:8443")),
            Some("b.example".to_string())
        );
    }

    #[test]
    fn none_when_neither_present() {
        assert_eq!(resolve_domain_name(None, None), None);
    }
}
