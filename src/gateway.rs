//! Chain gateway: head height, transaction search, and submission
//!
//! One [`HttpGateway`] per network wraps the node's REST API (chain info and
//! transaction submission through the node-side signing wallet) and the
//! search API (cursor-paginated historical transaction search). All chain
//! traffic from the watcher and the reporter goes through the
//! [`ChainGateway`] trait so tests can substitute a scripted gateway.

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Client;
use serde::{de, Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::Config;
use crate::networks::Network;

/// Failures surfaced by a chain gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request timed out")]
    Timeout,
    /// The requested range runs past the chain's last irreversible block.
    /// The node's view of the LIB occasionally lags ours, so this is an
    /// expected condition, not a fault.
    #[error("search range goes beyond the last irreversible block")]
    BeyondLib,
    /// The remote contract rejected the transaction with a readable message.
    #[error("{message}")]
    Remote { message: String },
    #[error("unexpected response status {code}: {body}")]
    Status { code: u16, body: String },
}

impl GatewayError {
    /// Known-benign conditions are logged at debug instead of error.
    pub fn is_benign(&self) -> bool {
        matches!(self, GatewayError::BeyondLib)
    }
}

/// One action of a transaction to submit.
#[derive(Debug, Clone, Serialize)]
pub struct ChainAction {
    pub account: String,
    pub name: String,
    pub authorization: Vec<Authorization>,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Authorization {
    pub actor: String,
    pub permission: String,
}

/// One page of transaction search results. An empty `cursor` means the
/// search is exhausted.
#[derive(Debug, Deserialize)]
pub struct SearchPage {
    #[serde(default)]
    pub cursor: String,
    #[serde(default)]
    pub transactions: Vec<TransactionRow>,
}

#[derive(Debug, Deserialize)]
pub struct TransactionRow {
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Deserialize)]
pub struct Lifecycle {
    pub execution_trace: Option<ExecutionTrace>,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionTrace {
    pub block_num: i64,
    #[serde(default)]
    pub action_traces: Vec<ActionTrace>,
}

/// Execution trace of a single action, possibly with nested inline actions.
#[derive(Debug, Clone, Deserialize)]
pub struct ActionTrace {
    pub receipt: ActionReceipt,
    pub act: ActionData,
    pub block_num: i64,
    pub block_time: String,
    pub trx_id: String,
    #[serde(default)]
    pub console: String,
    #[serde(default)]
    pub inline_traces: Vec<ActionTrace>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionReceipt {
    pub receiver: String,
    /// Unique per non-failed action across the chain; the ledger's
    /// idempotency key. Nodes serve it as a string or a number.
    #[serde(deserialize_with = "deserialize_string_to_u64")]
    pub global_sequence: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionData {
    pub account: String,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Narrow interface the watcher and reporter consume.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Last irreversible block height of the network.
    async fn head_block_number(&self) -> Result<u64, GatewayError>;

    /// One page of transactions matching `query` within
    /// `[start_block, start_block + block_count)`. Pass the previous page's
    /// cursor to continue, an empty string to start over.
    async fn search_transactions(
        &self,
        query: &str,
        start_block: i64,
        block_count: i64,
        cursor: &str,
    ) -> Result<SearchPage, GatewayError>;

    /// Sign and broadcast an action list on this network.
    async fn submit(&self, actions: Vec<ChainAction>) -> Result<(), GatewayError>;
}

#[derive(Debug, Deserialize)]
struct ChainInfo {
    last_irreversible_block_num: u64,
}

/// Gateway over a node's REST API plus a search endpoint.
pub struct HttpGateway {
    network: Network,
    node_url: String,
    search_url: String,
    search_api_key: String,
    client: Client,
}

impl HttpGateway {
    pub fn new(
        network: Network,
        node_url: String,
        search_url: String,
        search_api_key: String,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .wrap_err("Failed to create HTTP client")?;

        Ok(Self {
            network,
            node_url,
            search_url,
            search_api_key,
            client,
        })
    }

    /// Pull the most useful error message out of a node error body. Nodes
    /// nest the assertion text under error.details; fall back to the
    /// top-level message, then to the raw body.
    fn extract_remote_message(body: &str) -> String {
        let parsed: serde_json::Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(_) => return body.to_string(),
        };

        parsed
            .get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.as_array())
            .and_then(|d| d.first())
            .and_then(|d| d.get("message"))
            .or_else(|| parsed.get("message"))
            .and_then(|m| m.as_str())
            .map(|m| m.to_string())
            .unwrap_or_else(|| body.to_string())
    }

    fn classify_error_body(code: u16, body: String) -> GatewayError {
        let message = Self::extract_remote_message(&body);
        if message.to_lowercase().contains("goes beyond lib") {
            return GatewayError::BeyondLib;
        }
        if (400..500).contains(&code) {
            return GatewayError::Remote { message };
        }
        GatewayError::Status { code, body: message }
    }
}

#[async_trait]
impl ChainGateway for HttpGateway {
    async fn head_block_number(&self) -> Result<u64, GatewayError> {
        let url = format!("{}/v1/chain/get_info", self.node_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Status { code, body });
        }

        let info: ChainInfo = response.json().await?;
        Ok(info.last_irreversible_block_num)
    }

    async fn search_transactions(
        &self,
        query: &str,
        start_block: i64,
        block_count: i64,
        cursor: &str,
    ) -> Result<SearchPage, GatewayError> {
        let url = format!("{}/v0/search/transactions", self.search_url);
        let start_block = start_block.to_string();
        let block_count = block_count.to_string();
        let mut params = vec![
            ("q", query),
            ("start_block", start_block.as_str()),
            ("block_count", block_count.as_str()),
            ("limit", "100"),
            ("sort", "asc"),
        ];
        if !cursor.is_empty() {
            params.push(("cursor", cursor));
        }

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.search_api_key)
            .query(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error_body(code, body));
        }

        let page: SearchPage = response.json().await?;
        debug!(
            network = %self.network,
            transactions = page.transactions.len(),
            more = !page.cursor.is_empty(),
            "Search page fetched"
        );
        Ok(page)
    }

    async fn submit(&self, mut actions: Vec<ChainAction>) -> Result<(), GatewayError> {
        // Prepend the CPU-payer action where the network requires one; the
        // payer covers the transaction's CPU so the reporter account never
        // needs staked resources.
        let contracts = self.network.contracts();
        if let Some(cpu_payer) = contracts.cpu_payer {
            actions.insert(
                0,
                ChainAction {
                    account: cpu_payer.to_string(),
                    name: "payforcpu".to_string(),
                    authorization: vec![Authorization {
                        actor: cpu_payer.to_string(),
                        permission: "payforcpu".to_string(),
                    }],
                    data: serde_json::json!({}),
                },
            );
        }

        let url = format!("{}/v1/chain/send_transaction", self.node_url);
        let request = serde_json::json!({
            "chain_id": self.network.chain_id(),
            "actions": actions,
            "blocks_behind": 3,
            "expire_seconds": 300,
        });

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_error_body(code, body));
        }

        info!(network = %self.network, "Transaction broadcast successful");
        Ok(())
    }
}

/// All gateways for the fixed network set, constructed once at startup and
/// shared by reference with every watcher and the reporter.
pub struct GatewayRegistry {
    gateways: HashMap<Network, Box<dyn ChainGateway>>,
}

impl GatewayRegistry {
    /// Build a gateway for every known network. The reporter settles on
    /// whichever network an event payload targets, so the registry always
    /// covers the full set, not just the watched networks.
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let mut gateways: HashMap<Network, Box<dyn ChainGateway>> = HashMap::new();
        for network in Network::ALL {
            let gateway = HttpGateway::new(
                network,
                config.node_endpoint(network),
                config.search_endpoint(network),
                config.gateway.search_api_key.clone(),
            )?;
            gateways.insert(network, Box::new(gateway));
        }
        Ok(Arc::new(Self { gateways }))
    }

    #[cfg(test)]
    pub fn with_gateways(gateways: HashMap<Network, Box<dyn ChainGateway>>) -> Arc<Self> {
        Arc::new(Self { gateways })
    }

    pub fn get(&self, network: Network) -> Result<&dyn ChainGateway> {
        self.gateways
            .get(&network)
            .map(|g| g.as_ref())
            .ok_or_else(|| eyre::eyre!("no gateway registered for network {}", network))
    }
}

/// Nodes are inconsistent about serving large counters as strings or
/// numbers; accept both.
fn deserialize_string_to_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrU64Visitor;

    impl de::Visitor<'_> for StringOrU64Visitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or unsigned integer")
        }

        fn visit_u64<E>(self, value: u64) -> std::result::Result<u64, E>
        where
            E: de::Error,
        {
            Ok(value)
        }

        fn visit_i64<E>(self, value: i64) -> std::result::Result<u64, E>
        where
            E: de::Error,
        {
            u64::try_from(value)
                .map_err(|_| E::custom(format!("i64 {} out of range for u64", value)))
        }

        fn visit_str<E>(self, value: &str) -> std::result::Result<u64, E>
        where
            E: de::Error,
        {
            value.parse().map_err(E::custom)
        }
    }

    deserializer.deserialize_any(StringOrU64Visitor)
}
