use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{MULTICAST_GROUP, MULTICAST_PORT};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_history_retention")]
    pub history_retention_days: u32,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_group")]
    pub group: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local interface address used to join the group
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,
    #[serde(default = "default_request_interval")]
    pub request_interval_ms: u64,
    /// Servers silent for longer than this drop out of the active set
    #[serde(default = "default_ttl")]
    pub ttl_ms: u64,
    /// Start the engine as soon as the daemon is up
    #[serde(default = "default_autostart")]
    pub autostart: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/scoutd/servers.db")
}

fn default_history_retention() -> u32 {
    30
}

fn default_maintenance_interval() -> u64 {
    3600
}

fn default_group() -> Ipv4Addr {
    MULTICAST_GROUP
}

fn default_port() -> u16 {
    MULTICAST_PORT
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_request_interval() -> u64 {
    5000
}

fn default_ttl() -> u64 {
    15000
}

fn default_autostart() -> bool {
    true
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_retention_days: default_history_retention(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            interface: default_interface(),
            request_interval_ms: default_request_interval(),
            ttl_ms: default_ttl(),
            autostart: default_autostart(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl DiscoveryConfig {
    pub fn request_interval(&self) -> Duration {
        Duration::from_millis(self.request_interval_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        if config.discovery.request_interval_ms == 0 {
            anyhow::bail!("discovery.request_interval_ms must be positive");
        }
        if config.registry.maintenance_interval_secs == 0 {
            anyhow::bail!("registry.maintenance_interval_secs must be positive");
        }
        if !config.discovery.group.is_multicast() {
            anyhow::bail!("discovery.group {} is not a multicast address", config.discovery.group);
        }

        Ok(config)
    }
}
