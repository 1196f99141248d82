use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::Path;

use crate::networks::Network;

/// Main configuration for the relayer
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub relayer: RelayerConfig,
    /// Networks actively watched in this deployment. The gateway registry
    /// still covers every network so the reporter can settle anywhere.
    pub networks_to_watch: Vec<Network>,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Chain gateway configuration
#[derive(Clone, Deserialize)]
pub struct GatewayConfig {
    /// API key for the transaction-search service
    pub search_api_key: String,
    /// Credential for the node-side signing wallet holding the reporter and
    /// CPU-payer keys
    pub reporter_keys: String,
    /// Per-network node endpoint overrides
    #[serde(default)]
    pub node_endpoints: HashMap<Network, String>,
    /// Per-network search endpoint overrides
    #[serde(default)]
    pub search_endpoints: HashMap<Network, String>,
}

/// Custom Debug that redacts key material to prevent accidental log leakage.
impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("search_api_key", &"<redacted>")
            .field("reporter_keys", &"<redacted>")
            .field("node_endpoints", &self.node_endpoints)
            .field("search_endpoints", &self.search_endpoints)
            .finish()
    }
}

/// Relayer loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

/// Default functions
fn default_poll_interval() -> u64 {
    10_000
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let networks_to_watch = env::var("NETWORKS_TO_WATCH")
            .map_err(|_| eyre!("NETWORKS_TO_WATCH environment variable is required"))?
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<Network>())
            .collect::<Result<Vec<_>>>()
            .map_err(|e| {
                e.wrap_err("NETWORKS_TO_WATCH must be a comma-separated list of network names")
            })?;

        let mut node_endpoints = HashMap::new();
        let mut search_endpoints = HashMap::new();
        for network in Network::ALL {
            let prefix = network.as_str().to_uppercase();
            if let Ok(url) = env::var(format!("{}_NODE_ENDPOINT", prefix)) {
                node_endpoints.insert(network, url);
            }
            if let Ok(url) = env::var(format!("{}_SEARCH_ENDPOINT", prefix)) {
                search_endpoints.insert(network, url);
            }
        }

        let gateway = GatewayConfig {
            search_api_key: env::var("SEARCH_API_KEY")
                .map_err(|_| eyre!("SEARCH_API_KEY environment variable is required"))?,
            reporter_keys: env::var("REPORTER_KEYS")
                .map_err(|_| eyre!("REPORTER_KEYS environment variable is required"))?,
            node_endpoints,
            search_endpoints,
        };

        let relayer = RelayerConfig {
            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_poll_interval()),
            api_port: env::var("API_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_api_port()),
        };

        let config = Config {
            database,
            gateway,
            relayer,
            networks_to_watch,
        };

        config.validate()?;
        Ok(config)
    }

    /// Node endpoint for a network: configured override or the built-in default.
    pub fn node_endpoint(&self, network: Network) -> String {
        self.gateway
            .node_endpoints
            .get(&network)
            .cloned()
            .unwrap_or_else(|| network.default_node_endpoint().to_string())
    }

    /// Search endpoint for a network: configured override or the built-in default.
    pub fn search_endpoint(&self, network: Network) -> String {
        self.gateway
            .search_endpoints
            .get(&network)
            .cloned()
            .unwrap_or_else(|| network.default_search_endpoint().to_string())
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.networks_to_watch.is_empty() {
            return Err(eyre!("NETWORKS_TO_WATCH cannot be empty"));
        }

        // Two watchers for the same network would race on the watermark row
        // and duplicate search traffic.
        for (i, network) in self.networks_to_watch.iter().enumerate() {
            if self.networks_to_watch[..i].contains(network) {
                return Err(eyre!(
                    "network {} appears twice in NETWORKS_TO_WATCH",
                    network
                ));
            }
        }

        if self.gateway.search_api_key.is_empty() {
            return Err(eyre!("SEARCH_API_KEY cannot be empty"));
        }

        if self.gateway.reporter_keys.is_empty() {
            return Err(eyre!("REPORTER_KEYS cannot be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
            },
            gateway: GatewayConfig {
                search_api_key: "server_abcdef".to_string(),
                reporter_keys: "PW5abc...".to_string(),
                node_endpoints: HashMap::new(),
                search_endpoints: HashMap::new(),
            },
            relayer: RelayerConfig {
                poll_interval_ms: 10_000,
                api_port: 8080,
            },
            networks_to_watch: vec![Network::Mainnet, Network::Wax],
        }
    }

    #[test]
    fn test_default_poll_interval() {
        assert_eq!(default_poll_interval(), 10_000);
    }

    #[test]
    fn test_default_api_port() {
        assert_eq!(default_api_port(), 8080);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_empty_networks_rejected() {
        let mut config = test_config();
        config.networks_to_watch.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_network_rejected() {
        let mut config = test_config();
        config.networks_to_watch = vec![Network::Wax, Network::Mainnet, Network::Wax];
        let err = config.validate().unwrap_err();
        assert!(
            err.to_string().contains("wax"),
            "Error should mention the duplicate network: {}",
            err
        );
    }

    #[test]
    fn test_missing_keys_rejected() {
        let mut config = test_config();
        config.gateway.search_api_key = String::new();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.gateway.reporter_keys = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_endpoint_override_wins() {
        let mut config = test_config();
        config
            .gateway
            .node_endpoints
            .insert(Network::Wax, "http://localhost:8888".to_string());

        assert_eq!(config.node_endpoint(Network::Wax), "http://localhost:8888");
        assert_eq!(
            config.node_endpoint(Network::Mainnet),
            Network::Mainnet.default_node_endpoint()
        );
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = test_config();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("server_abcdef"));
        assert!(!debug.contains("PW5abc"));
        assert!(debug.contains("<redacted>"));
    }
}
