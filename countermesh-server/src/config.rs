// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Node configuration: defaults -> TOML file -> environment -> CLI flags
/// (CLI layering happens in `main.rs`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    pub server: HttpServerConfig,
    pub fanout: FanoutConfig,
    pub registry: RegistryConfig,
    pub poller: PollerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_enable_cors")]
    pub enable_cors: bool,

    /// Responses smaller than this are sent uncompressed (spec §6.3):
    /// gzip/br framing overhead outweighs the savings below this size.
    #[serde(default = "default_compression_min_bytes")]
    pub compression_min_bytes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FanoutConfig {
    #[serde(default = "default_max_fanout")]
    pub max_fanout: u32,
    #[serde(default = "default_fanout_timeout_ms")]
    pub fanout_timeout_ms: u64,
    /// Fraction of the remaining local timeout handed down to a block's
    /// leader, per spec §4.5.
    #[serde(default = "default_timeout_scale_factor")]
    pub timeout_scale_factor: f64,
    /// Whether this node acts as a query-aggregator (spec §4.6 step 1):
    /// only an aggregator auto-populates fanout sources from the
    /// Registry when a query arrives with none supplied. A non-aggregator
    /// only fans out when the caller explicitly lists sources.
    #[serde(default = "default_query_aggregator")]
    pub query_aggregator: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    #[serde(default = "default_expiration_secs")]
    pub expiration_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// `host:port` of peers to push registrations to on startup. Peers
    /// discovered later via `/register` never need to be listed here;
    /// this only seeds the initial gossip.
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_registration_interval_secs")]
    pub registration_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_poller_max_fanout")]
    pub max_fanout: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bearer_token: Option<String>,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7100".to_string()
}
fn default_max_connections() -> usize {
    1000
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_enable_cors() -> bool {
    true
}
fn default_compression_min_bytes() -> u64 {
    1024
}
fn default_max_fanout() -> u32 {
    16
}
fn default_fanout_timeout_ms() -> u64 {
    10_000
}
fn default_timeout_scale_factor() -> f64 {
    0.9
}
fn default_query_aggregator() -> bool {
    true
}
fn default_expiration_secs() -> u64 {
    600
}
fn default_sweep_interval_secs() -> u64 {
    60
}
fn default_registration_interval_secs() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_poller_max_fanout() -> u32 {
    20
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server: HttpServerConfig {
                listen_addr: default_listen_addr(),
                max_connections: default_max_connections(),
                request_timeout_secs: default_request_timeout_secs(),
                enable_cors: default_enable_cors(),
                compression_min_bytes: default_compression_min_bytes(),
            },
            fanout: FanoutConfig {
                max_fanout: default_max_fanout(),
                fanout_timeout_ms: default_fanout_timeout_ms(),
                timeout_scale_factor: default_timeout_scale_factor(),
                query_aggregator: default_query_aggregator(),
            },
            registry: RegistryConfig {
                expiration_secs: default_expiration_secs(),
                sweep_interval_secs: default_sweep_interval_secs(),
                seeds: Vec::new(),
                registration_interval_secs: default_registration_interval_secs(),
            },
            poller: PollerConfig {
                poll_interval_secs: default_poll_interval_secs(),
                max_fanout: default_poller_max_fanout(),
            },
            auth: AuthConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Apply `COUNTERMESH_*` environment variable overrides on top of
    /// whatever was loaded from defaults/file.
    pub fn apply_env(mut self) -> Self {
        if let Ok(addr) = std::env::var("COUNTERMESH_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(v) = std::env::var("COUNTERMESH_MAX_CONNECTIONS") {
            if let Ok(v) = v.parse() {
                self.server.max_connections = v;
            }
        }
        if let Ok(v) = std::env::var("COUNTERMESH_MAX_FANOUT") {
            if let Ok(v) = v.parse() {
                self.fanout.max_fanout = v;
            }
        }
        if let Ok(v) = std::env::var("COUNTERMESH_FANOUT_TIMEOUT_MS") {
            if let Ok(v) = v.parse() {
                self.fanout.fanout_timeout_ms = v;
            }
        }
        if let Ok(v) = std::env::var("COUNTERMESH_QUERY_AGGREGATOR") {
            if let Ok(v) = v.parse() {
                self.fanout.query_aggregator = v;
            }
        }
        if let Ok(v) = std::env::var("COUNTERMESH_AUTH_ENABLED") {
            self.auth.enabled = v.parse().unwrap_or(false);
        }
        if let Ok(v) = std::env::var("COUNTERMESH_BEARER_TOKEN") {
            self.auth.bearer_token = Some(v);
        }
        if let Ok(v) = std::env::var("COUNTERMESH_SEEDS") {
            self.registry.seeds = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        self
    }

    /// defaults -> file (if present) -> environment.
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = match config_file {
            Some(path) if path.exists() => {
                tracing::info!("loading configuration from {:?}", path);
                Self::from_file(&path)?
            }
            Some(path) => {
                tracing::warn!("config file {:?} not found, using defaults", path);
                Self::default()
            }
            None => Self::default(),
        };
        Ok(config.apply_env())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;
        if self.auth.enabled && self.auth.bearer_token.is_none() {
            anyhow::bail!("auth.enabled is true but no bearer_token configured");
        }
        if !(0.0..=1.0).contains(&self.fanout.timeout_scale_factor) {
            anyhow::bail!("fanout.timeout_scale_factor must be in [0, 1]");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn env_overrides_listen_addr() {
        std::env::set_var("COUNTERMESH_LISTEN_ADDR", "0.0.0.0:9999");
        let config = NodeConfig::default().apply_env();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9999");
        std::env::remove_var("COUNTERMESH_LISTEN_ADDR");
    }

    #[test]
    fn env_overrides_seeds_as_comma_separated_list() {
        std::env::set_var("COUNTERMESH_SEEDS", "a:7100, b:7100,");
        let config = NodeConfig::default().apply_env();
        assert_eq!(config.registry.seeds, vec!["a:7100".to_string(), "b:7100".to_string()]);
        std::env::remove_var("COUNTERMESH_SEEDS");
    }

    #[test]
    fn env_overrides_query_aggregator_flag() {
        std::env::set_var("COUNTERMESH_QUERY_AGGREGATOR", "false");
        let config = NodeConfig::default().apply_env();
        assert!(!config.fanout.query_aggregator);
        std::env::remove_var("COUNTERMESH_QUERY_AGGREGATOR");
    }

    #[test]
    fn auth_enabled_without_token_fails_validation() {
        let mut config = NodeConfig::default();
        config.auth.enabled = true;
        assert!(config.validate().is_err());
    }
}
