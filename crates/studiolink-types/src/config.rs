//! Configuration loading from `~/.studiolink/config.toml` with defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default discovery server port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 8082;

/// Maximum single message size accepted by the discovery server (16 MB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioLinkConfig {
    pub rpc: RpcConfig,
    pub discovery: DiscoveryConfig,
    pub server: ServerConfig,
}

/// Call correlation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Timeout applied to calls that don't specify their own (0 = disabled).
    pub default_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 0,
        }
    }
}

impl RpcConfig {
    /// The default timeout as a `Duration`; zero means no timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Client-side discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Websocket URL of the discovery server.
    pub server_url: String,
    /// First reconnect delay after losing the server.
    pub reconnect_initial_ms: u64,
    /// Upper bound for the exponential reconnect delay.
    pub reconnect_max_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            server_url: format!("ws://127.0.0.1:{DEFAULT_DISCOVERY_PORT}"),
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 60_000,
        }
    }
}

impl DiscoveryConfig {
    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

/// Discovery server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the discovery server binds to.
    pub listen_addr: SocketAddr,
    /// Largest websocket message the server accepts.
    pub max_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_DISCOVERY_PORT)),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Default config location: `~/.studiolink/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".studiolink")
        .join("config.toml")
}

/// Load configuration from a TOML file, with defaults.
///
/// A missing file is not an error. An unreadable or malformed file is logged
/// and replaced by the defaults.
pub fn load_config(path: Option<&Path>) -> StudioLinkConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return StudioLinkConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return StudioLinkConfig::default();
        }
    };

    match toml::from_str::<StudioLinkConfig>(&contents) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            StudioLinkConfig::default()
        }
    }
}
