//! Edge configuration: TOML file + CLI overrides (A1).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub hub: HubSection,
    /// Static domain/API-key records. A real deployment swaps the
    /// `DomainStore` built from this list for one backed by the
    /// relational auth store named in `spec.md` §6; this list exists so
    /// the edge is runnable standalone.
    #[serde(default)]
    pub domains: Vec<DomainEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DomainEntry {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub allow_multiple_connections: bool,
}

/// `[listen]` — the three logical endpoints from `spec.md` §6.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_public_addr")]
    pub public_addr: String,
    #[serde(default = "default_notification_addr")]
    pub notification_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            public_addr: default_public_addr(),
            notification_addr: default_notification_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

/// `[tls]` — certificate/key paths. Both empty means plaintext only.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TlsSection {
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// `[hub]` — per-hub tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold_bytes: u64,
    #[serde(default = "default_pending_timeout")]
    pub pending_timeout_secs: u64,
    #[serde(default = "default_teardown_grace")]
    pub teardown_grace_secs: u64,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            flush_threshold_bytes: default_flush_threshold(),
            pending_timeout_secs: default_pending_timeout(),
            teardown_grace_secs: default_teardown_grace(),
        }
    }
}

fn default_public_addr() -> String {
    "0.0.0.0:5050".to_string()
}
fn default_notification_addr() -> String {
    "0.0.0.0:5051".to_string()
}
fn default_admin_addr() -> String {
    "0.0.0.0:5052".to_string()
}
fn default_flush_threshold() -> u64 {
    64 * 1024
}
fn default_pending_timeout() -> u64 {
    20
}
fn default_teardown_grace() -> u64 {
    30
}

/// Resolved edge configuration (CLI overrides applied).
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub public_addr: String,
    pub notification_addr: String,
    pub admin_addr: String,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub flush_threshold_bytes: u64,
    pub pending_timeout_secs: u64,
    pub teardown_grace_secs: u64,
    pub domains: Vec<DomainEntry>,
}

impl EdgeConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    /// A missing config file silently falls back to defaults, matching
    /// the teacher's `ServerConfig::load`.
    pub fn load(
        config_path: Option<&Path>,
        cli_public_addr: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
    ) -> std::io::Result<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content).map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
                })?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile {
                    listen: ListenSection::default(),
                    tls: TlsSection::default(),
                    hub: HubSection::default(),
                    domains: Vec::new(),
                }
            }
        } else {
            ConfigFile {
                listen: ListenSection::default(),
                tls: TlsSection::default(),
                hub: HubSection::default(),
                domains: Vec::new(),
            }
        };

        let public_addr = cli_public_addr
            .map(|s| s.to_string())
            .unwrap_or(file_config.listen.public_addr);
        let cert = cli_cert.map(|s| s.to_string()).or(file_config.tls.cert);
        let key = cli_key.map(|s| s.to_string()).or(file_config.tls.key);

        Ok(Self {
            public_addr,
            notification_addr: file_config.listen.notification_addr,
            admin_addr: file_config.listen.admin_addr,
            cert_path: cert.map(|s| expand_tilde_str(&s)),
            key_path: key.map(|s| expand_tilde_str(&s)),
            flush_threshold_bytes: file_config.hub.flush_threshold_bytes,
            pending_timeout_secs: file_config.hub.pending_timeout_secs,
            teardown_grace_secs: file_config.hub.teardown_grace_secs,
            domains: file_config.domains,
        })
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_file() {
        let cfg = EdgeConfig::load(None, None, None, None).unwrap();
        assert_eq!(cfg.public_addr, "0.0.0.0:5050");
        assert_eq!(cfg.notification_addr, "0.0.0.0:5051");
        assert_eq!(cfg.flush_threshold_bytes, 64 * 1024);
    }

    #[test]
    fn cli_override_wins() {
        let cfg = EdgeConfig::load(None, Some("127.0.0.1:9000"), None, None).unwrap();
        assert_eq!(cfg.public_addr, "127.0.0.1:9000");
    }
}
