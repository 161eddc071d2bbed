//! Connection Configuration
//!
//! Loaded once from TOML (or JSON) and treated as immutable afterwards.
//! Every field has a default so a config file only needs `target_ip`.

use anchor_network::{DEFAULT_PROBE_SERVICES, UPSTREAM_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Coordinator, VPN and forwarder settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Public IP the exchange must see
    pub target_ip: IpAddr,
    /// VPN client executable (absolute, relative, or a bare name on PATH)
    pub vpn_client_path: PathBuf,
    /// VPN client profile
    pub vpn_config_path: PathBuf,
    /// VPN credentials file
    pub vpn_credentials_path: PathBuf,
    /// Forwarder listen address
    pub proxy_listen_addr: IpAddr,
    /// Forwarder listen port (0 picks an ephemeral port)
    pub proxy_listen_port: u16,
    /// Monitoring period
    pub check_interval_ms: u64,
    /// Deadline for the VPN client to report ready
    pub failover_timeout_ms: u64,
    /// Retries after an early client exit
    pub max_retries: u32,
    /// Pause between VPN attempts
    pub retry_delay_ms: u64,
    /// Whole-probe timeout
    pub probe_timeout_ms: u64,
    /// Grace period between Terminate and Kill
    pub kill_grace_ms: u64,
    /// Retained failover events
    pub history_capacity: usize,
    /// Client output line that means the tunnel is up
    pub ready_marker: String,
    /// Egress IP lookup services, tried in order
    pub probe_services: Vec<String>,
    /// REST control surface address
    pub api_listen_addr: SocketAddr,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            target_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            vpn_client_path: PathBuf::from("openvpn"),
            vpn_config_path: PathBuf::from("config/vpn/client.ovpn"),
            vpn_credentials_path: PathBuf::from("config/vpn/credentials.txt"),
            proxy_listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            proxy_listen_port: 8080,
            check_interval_ms: 30_000,
            failover_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            probe_timeout_ms: 5_000,
            kill_grace_ms: 5_000,
            history_capacity: 100,
            ready_marker: "Initialization Sequence Completed".to_string(),
            probe_services: DEFAULT_PROBE_SERVICES.iter().map(|s| s.to_string()).collect(),
            api_listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000),
        }
    }
}

impl ConnectionConfig {
    /// Defaults with the given target IP
    pub fn new(target_ip: IpAddr) -> Self {
        Self {
            target_ip,
            ..Self::default()
        }
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as TOML
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_toml(&content),
        }
    }

    /// Parse TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse JSON
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Check values that would make the coordinator misbehave
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_ip.is_unspecified() {
            return Err(ConfigError::Invalid("target_ip must be set".into()));
        }
        if self.check_interval_ms == 0 {
            return Err(ConfigError::Invalid("check_interval_ms must be positive".into()));
        }
        if self.failover_timeout_ms == 0 {
            return Err(ConfigError::Invalid("failover_timeout_ms must be positive".into()));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConfigError::Invalid("probe_timeout_ms must be positive".into()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be positive".into()));
        }
        if self.ready_marker.trim().is_empty() {
            return Err(ConfigError::Invalid("ready_marker must not be empty".into()));
        }
        if self.probe_services.is_empty() {
            return Err(ConfigError::Invalid("probe_services must not be empty".into()));
        }
        for service in &self.probe_services {
            let url = url::Url::parse(service)
                .map_err(|e| ConfigError::Invalid(format!("probe service '{}': {}", service, e)))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(ConfigError::Invalid(format!(
                    "probe service '{}' must be http or https",
                    service
                )));
            }
        }
        Ok(())
    }

    /// Forwarder socket address
    pub fn proxy_addr(&self) -> SocketAddr {
        SocketAddr::new(self.proxy_listen_addr, self.proxy_listen_port)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    /// Upstream timeout used by the forwarder
    pub fn upstream_timeout(&self) -> Duration {
        UPSTREAM_TIMEOUT
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
