//! Static registry of the networks the bridge spans
//!
//! Every network the relayer can talk to is a variant of [`Network`], so
//! dispatch on a network is always an exhaustive match checked at compile
//! time. Contract accounts, endpoints and historical start blocks are fixed
//! per network; only endpoints can be overridden through configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A blockchain network the bridge operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Wax,
    Kylin,
    Jungle,
}

/// Blocks produced in roughly three days at two blocks per second.
const THREE_DAYS_AS_BLOCKS: i64 = 2 * 60 * 60 * 24 * 2;

/// Contract accounts the bridge uses on one network.
#[derive(Debug, Clone, Copy)]
pub struct NetworkContracts {
    /// Token contract whose `transfer` actions carry bridge deposits
    pub token: &'static str,
    /// Converter (bridge) contract account; also the account the watcher follows
    pub bridge: &'static str,
    /// Account authorized to report and resolve transfers
    pub reporter: &'static str,
    /// Account that pays CPU for submitted transactions, when the network needs one
    pub cpu_payer: Option<&'static str>,
}

impl Network {
    pub const ALL: [Network; 4] = [
        Network::Mainnet,
        Network::Wax,
        Network::Kylin,
        Network::Jungle,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Wax => "wax",
            Network::Kylin => "kylin",
            Network::Jungle => "jungle",
        }
    }

    /// Parse a network name from user-controlled event payload data.
    ///
    /// Payloads written by on-chain users say `eos` for the EOS mainnet, so
    /// that alias is accepted here but not in [`FromStr`], which only takes
    /// canonical names from our own configuration.
    pub fn from_payload_name(name: &str) -> Option<Network> {
        match name {
            "eos" => Some(Network::Mainnet),
            other => other.parse().ok(),
        }
    }

    pub fn contracts(&self) -> NetworkContracts {
        match self {
            Network::Mainnet => NetworkContracts {
                token: "zosdiscounts",
                bridge: "zoseosconvrt",
                reporter: "zoscpustaker",
                cpu_payer: Some("mb.bank"),
            },
            Network::Wax => NetworkContracts {
                token: "zoswaxtokens",
                bridge: "zoswaxconvrt",
                reporter: "zoswaxreport",
                cpu_payer: None,
            },
            Network::Kylin => NetworkContracts {
                token: "zosdiscount1",
                bridge: "zoswaxconvr2",
                reporter: "zosreporter1",
                cpu_payer: None,
            },
            Network::Jungle => NetworkContracts {
                token: "zosdiscount1",
                bridge: "zoseosconvr3",
                reporter: "zosreporter1",
                cpu_payer: Some("cmicheljungl"),
            },
        }
    }

    /// Chain id the node reports for this network.
    pub fn chain_id(&self) -> &'static str {
        match self {
            Network::Mainnet => {
                "aca376f206b8fc25a6ed44dbdc66547c36c6c33e3a119ffbeaef943642f0e906"
            }
            Network::Wax => "1064487b3cd1a897ce03ae5b6a865651747e2e152090f99c1d19d44e01aea5a4",
            Network::Kylin => {
                "5fff1dae8dc8e2fc4d5b23b2c7665c97f9e9d8edf2b6485a86ba311c25639191"
            }
            Network::Jungle => {
                "e70aaab8997e1dfce58fbfac80cbbb8fecec7b99cf982a9444273cbc64c41473"
            }
        }
    }

    /// Default RPC node endpoint, overridable per network via configuration.
    pub fn default_node_endpoint(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://eos.greymass.com:443",
            Network::Wax => "https://chain.wax.io:443",
            Network::Kylin => "https://api-kylin.eoslaomao.com:443",
            Network::Jungle => "https://jungle2.cryptolions.io:443",
        }
    }

    /// Default transaction-search endpoint, overridable per network via configuration.
    pub fn default_search_endpoint(&self) -> &'static str {
        match self {
            Network::Mainnet => "https://mainnet.eos.dfuse.io",
            Network::Wax => "https://mainnet.wax.dfuse.io",
            Network::Kylin => "https://kylin.eos.dfuse.io",
            Network::Jungle => "https://jungle.eos.dfuse.io",
        }
    }

    /// Block the watcher starts scanning from when no watermark exists yet.
    ///
    /// Test networks rewind a few days so fresh deployments replay recent
    /// traffic; production networks pin the block the bridge launched at.
    pub fn start_block(&self) -> i64 {
        match self {
            Network::Mainnet => 98_817_667,
            Network::Wax => 33_756_246,
            Network::Kylin => 104_224_728 - THREE_DAYS_AS_BLOCKS,
            Network::Jungle => 91_045_607 - THREE_DAYS_AS_BLOCKS,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Network {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "wax" => Ok(Network::Wax),
            "kylin" => Ok(Network::Kylin),
            "jungle" => Ok(Network::Jungle),
            other => Err(eyre::eyre!("unknown network \"{}\"", other)),
        }
    }
}
