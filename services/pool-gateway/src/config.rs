//! Gateway configuration
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Member credentials never live in this file; they come from the pool's
//! credential document or the single-member environment variables.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub pool: PoolSection,
    pub upstream: UpstreamConfig,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin routes are served here, never on the query listener.
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Where the credential document lives and whether this process owns it.
#[derive(Debug, Deserialize)]
pub struct PoolSection {
    #[serde(default)]
    pub config_path: Option<PathBuf>,
    #[serde(default = "default_writable")]
    pub config_writable: bool,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            config_path: None,
            config_writable: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default = "default_search_path")]
    pub search_path: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_max_connections() -> usize {
    256
}

fn default_writable() -> bool {
    true
}

fn default_search_path() -> String {
    "/rest/search".to_string()
}

fn default_timeout() -> u64 {
    120
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if !config.upstream.base_url.starts_with("http://")
            && !config.upstream.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                config.upstream.base_url
            )));
        }

        if !config.upstream.search_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "search_path must start with '/', got: {}",
                config.upstream.search_path
            )));
        }

        if config.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.server.listen_addr == config.server.admin_addr {
            return Err(common::Error::Config(format!(
                "admin_addr must differ from listen_addr ({})",
                config.server.listen_addr
            )));
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("pool-gateway.toml")
    }
}
