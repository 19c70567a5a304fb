//! Engine configuration.
//!
//! The outer configuration loader validates and deserializes this; the
//! engine compiles it into [`Source`] subscriptions and per-chain sync
//! settings. RPC URLs and the database connection string may come from the
//! environment (`EVENTIDE_RPC_URL_{chainId}`, `DATABASE_URL`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::source::{
    AddressSpec, BlockSource, ContractSource, EventAbi, FactorySpec, FunctionAbi, Source,
    SourceKind, TopicFilter,
};

fn default_polling_interval_ms() -> u64 {
    1_000
}
fn default_max_requests_per_second() -> u32 {
    50
}
fn default_max_concurrent_requests() -> u32 {
    20
}
fn default_finality_depth() -> u64 {
    65
}
fn default_max_chunk_size() -> u64 {
    100_000
}
fn default_schema() -> String {
    "public".into()
}
fn default_idle_timeout_secs() -> u64 {
    30
}
fn default_buffer_size() -> usize {
    10_000
}

/// How to reach a chain's JSON-RPC endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// A single http(s) endpoint.
    Http(String),
    /// Endpoints tried in order when the previous one fails.
    Fallback(Vec<String>),
    /// Resolve from `EVENTIDE_RPC_URL_{chainId}`.
    Env,
}

/// Per-network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub transport: Transport,
    /// Realtime poll period in milliseconds.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Token-bucket refill rate.
    #[serde(default = "default_max_requests_per_second")]
    pub max_requests_per_second: u32,
    /// In-flight request cap, independent of the token bucket.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: u32,
    /// Blocks behind the head below which reorgs are assumed impossible.
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    /// Ceiling for the adaptive `eth_getLogs` chunk size.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u64,
    /// Bypass the sync cache for this chain.
    #[serde(default)]
    pub disable_cache: bool,
}

impl NetworkConfig {
    /// Resolve the primary RPC URL, consulting the environment when the
    /// transport asks for it.
    pub fn rpc_urls(&self) -> Result<Vec<String>, ConfigError> {
        match &self.transport {
            Transport::Http(url) => Ok(vec![url.clone()]),
            Transport::Fallback(urls) if !urls.is_empty() => Ok(urls.clone()),
            Transport::Fallback(_) => Err(ConfigError::MissingRpcUrl {
                chain_id: self.chain_id,
            }),
            Transport::Env => {
                let var = format!("EVENTIDE_RPC_URL_{}", self.chain_id);
                std::env::var(&var)
                    .map(|url| vec![url])
                    .map_err(|_| ConfigError::MissingRpcUrl {
                        chain_id: self.chain_id,
                    })
            }
        }
    }
}

/// Per-contract configuration. `address` and `factory` are mutually
/// exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub network: String,
    /// Event signatures, compiled to topic hashes by the loader.
    #[serde(default)]
    pub events: Vec<EventAbi>,
    /// Function signatures, compiled to selectors by the loader.
    #[serde(default)]
    pub functions: Vec<FunctionAbi>,
    #[serde(default)]
    pub address: Option<Vec<String>>,
    #[serde(default)]
    pub factory: Option<FactorySpec>,
    /// Server-side log filter.
    #[serde(default)]
    pub filter: TopicFilter,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub include_transaction_receipts: bool,
    #[serde(default)]
    pub include_call_traces: bool,
}

/// A block-interval source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockSourceConfig {
    pub network: String,
    /// Emit one event every `interval` blocks, anchored at `start_block`.
    pub interval: u64,
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseKind {
    Postgres,
    /// Embedded engine speaking the Postgres wire protocol.
    Pglite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    /// Falls back to `DATABASE_URL` for `postgres`; required for `pglite`.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// User schema name.
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl DatabaseConfig {
    pub fn resolve_connection_string(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.connection_string {
            return Ok(url.clone());
        }
        match self.kind {
            DatabaseKind::Postgres => {
                std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingConnectionString)
            }
            // An embedded database has no ambient location to fall back to.
            DatabaseKind::Pglite => Err(ConfigError::MissingConnectionString),
        }
    }
}

/// The complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub networks: HashMap<String, NetworkConfig>,
    #[serde(default)]
    pub contracts: HashMap<String, ContractConfig>,
    #[serde(default)]
    pub blocks: HashMap<String, BlockSourceConfig>,
    pub database: DatabaseConfig,
    /// Dev mode: immediate cutover, no crash-resume adoption, dead dev
    /// instances are always garbage collected.
    #[serde(default)]
    pub dev_mode: bool,
    /// Idle-chain watermark advance for the event merger, seconds.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Merger buffer bound (events), backpressure above it.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Configuration rejected before the engine starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no RPC URL for chain {chain_id}: set the transport or EVENTIDE_RPC_URL_{chain_id}")]
    MissingRpcUrl { chain_id: u64 },

    #[error("no database connection string: set database.connection_string or DATABASE_URL")]
    MissingConnectionString,

    #[error("source '{source_name}' references unknown network '{network}'")]
    UnknownNetwork { source_name: String, network: String },

    #[error("contract '{contract}' must set exactly one of address and factory")]
    AmbiguousAddress { contract: String },

    #[error("block source '{source_name}' has interval 0")]
    ZeroInterval { source_name: String },
}

impl EngineConfig {
    /// Compile the configured contracts and block sources into [`Source`]
    /// subscriptions, validating network references on the way.
    pub fn sources(&self) -> Result<Vec<Source>, ConfigError> {
        let mut sources = Vec::new();

        for (name, contract) in &self.contracts {
            let network = self.networks.get(&contract.network).ok_or_else(|| {
                ConfigError::UnknownNetwork {
                    source_name: name.clone(),
                    network: contract.network.clone(),
                }
            })?;
            let address = match (&contract.address, &contract.factory) {
                (Some(addrs), None) => AddressSpec::Static(
                    addrs.iter().map(|a| a.to_ascii_lowercase()).collect(),
                ),
                (None, Some(factory)) => AddressSpec::Factory(factory.clone()),
                _ => {
                    return Err(ConfigError::AmbiguousAddress {
                        contract: name.clone(),
                    })
                }
            };
            sources.push(Source {
                name: name.clone(),
                network: contract.network.clone(),
                chain_id: network.chain_id,
                start_block: contract.start_block,
                end_block: contract.end_block,
                kind: SourceKind::Contract(ContractSource {
                    address,
                    events: contract.events.clone(),
                    functions: contract.functions.clone(),
                    topics: contract.filter.clone(),
                    include_transaction_receipts: contract.include_transaction_receipts,
                    include_call_traces: contract.include_call_traces,
                }),
            });
        }

        for (name, blocks) in &self.blocks {
            let network = self.networks.get(&blocks.network).ok_or_else(|| {
                ConfigError::UnknownNetwork {
                    source_name: name.clone(),
                    network: blocks.network.clone(),
                }
            })?;
            if blocks.interval == 0 {
                return Err(ConfigError::ZeroInterval {
                    source_name: name.clone(),
                });
            }
            sources.push(Source {
                name: name.clone(),
                network: blocks.network.clone(),
                chain_id: network.chain_id,
                start_block: blocks.start_block,
                end_block: blocks.end_block,
                kind: SourceKind::Blocks(BlockSource {
                    interval: blocks.interval,
                }),
            });
        }

        // Deterministic order regardless of map iteration.
        sources.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(sources)
    }

    /// Sources subscribed on one chain.
    pub fn sources_for_chain(&self, chain_id: u64) -> Result<Vec<Source>, ConfigError> {
        Ok(self
            .sources()?
            .into_iter()
            .filter(|s| s.chain_id == chain_id)
            .collect())
    }
}
