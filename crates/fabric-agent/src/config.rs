//! Agent configuration: TOML file + CLI overrides (A1).
//!
//! Grounded on the original `client/config/config.go` (a flat YAML
//! `serverUrl`/`proxyPass` struct loaded once) and, for idiom, on
//! `fabric-edge`'s own `config.rs`/the teacher's `ServerConfig::load`
//! shape: CLI flags win, file values are the fallback, a missing file
//! silently falls back to defaults rather than erroring.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub edge: EdgeSection,
    #[serde(default)]
    pub backend: BackendSection,
}

/// `[edge]` — where the agent dials out to.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeSection {
    #[serde(default = "default_notification_addr")]
    pub notification_addr: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default = "default_true")]
    pub verify_server_cert: bool,
    pub domain: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for EdgeSection {
    fn default() -> Self {
        Self {
            notification_addr: default_notification_addr(),
            use_tls: false,
            verify_server_cert: true,
            domain: None,
            api_secret: None,
        }
    }
}

/// `[backend]` — where matched connections are forwarded locally.
/// `target` follows `spec.md` §6's scheme prefixes: `tcp://`, `tls://`,
/// `http://`, `https://`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendSection {
    pub target: Option<String>,
}

fn default_notification_addr() -> String {
    "127.0.0.1:5051".to_string()
}
fn default_true() -> bool {
    true
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub notification_addr: String,
    pub use_tls: bool,
    pub verify_server_cert: bool,
    pub domain: String,
    pub api_secret: String,
    pub backend_target: String,
}

impl AgentConfig {
    pub fn load(
        config_path: Option<&Path>,
        cli_notification_addr: Option<&str>,
        cli_domain: Option<&str>,
        cli_api_secret: Option<&str>,
        cli_backend_target: Option<&str>,
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
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let notification_addr = cli_notification_addr
            .map(|s| s.to_string())
            .unwrap_or(file_config.edge.notification_addr);
        let domain = cli_domain
            .map(|s| s.to_string())
            .or(file_config.edge.domain)
            .ok_or_else(|| invalid("missing required domain (--domain or [edge].domain)"))?;
        let api_secret = cli_api_secret
            .map(|s| s.to_string())
            .or(file_config.edge.api_secret)
            .ok_or_else(|| invalid("missing required api secret (--api-secret or [edge].api_secret)"))?;
        let backend_target = cli_backend_target
            .map(|s| s.to_string())
            .or(file_config.backend.target)
            .ok_or_else(|| invalid("missing required backend target (--backend or [backend].target)"))?;

        Ok(Self {
            notification_addr,
            use_tls: file_config.edge.use_tls,
            verify_server_cert: file_config.edge.verify_server_cert,
            domain,
            api_secret,
            backend_target,
        })
    }
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_domain_secret_and_backend_when_absent() {
        let err = AgentConfig::load(None, Some("127.0.0.1:5051"), None, None, None).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn cli_values_satisfy_required_fields() {
        let cfg = AgentConfig::load(
            None,
            Some("127.0.0.1:5051"),
            Some("a.example"),
            Some("secret"),
            Some("tcp://127.0.0.1:8080"),
        )
        .unwrap();
        assert_eq!(cfg.domain, "a.example");
        assert_eq!(cfg.backend_target, "tcp://127.0.0.1:8080");
        assert!(cfg.verify_server_cert);
    }
}
