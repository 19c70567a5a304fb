//! Source subscriptions: which contracts, events, and blocks a chain sync
//! watches, plus the deterministic filter fingerprint used for cache
//! interval bookkeeping.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::event::Log;

/// One event of a contract ABI, with its precomputed `topics[0]` hash.
///
/// The configuration loader compiles human-readable signatures down to
/// topic hashes before handing sources to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAbi {
    pub name: String,
    /// keccak-256 of the event signature (`0x…`, 32 bytes).
    pub topic0: String,
}

/// One function of a contract ABI, with its precomputed 4-byte selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionAbi {
    pub name: String,
    /// First 4 bytes of keccak-256 of the function signature (`0x…`).
    pub selector: String,
}

/// Where a factory log carries the child address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildLocation {
    /// An indexed parameter: `topics[n]` (1-based topic slot).
    Topic(usize),
    /// A data word: 32-byte word `n` of the data payload.
    DataWord(usize),
}

/// Dynamic address resolution: watch one event on a parent contract and
/// collect child addresses from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorySpec {
    /// Parent (factory) contract address.
    pub address: String,
    /// `topics[0]` of the creation event.
    pub event_topic0: String,
    pub child_location: ChildLocation,
}

impl FactorySpec {
    /// Extract the child address from a creation log, if this log is one.
    pub fn extract_child(&self, log: &Log) -> Option<String> {
        if !addr_eq(&log.address, &self.address) || log.topic0() != Some(&self.event_topic0) {
            return None;
        }
        let word = match self.child_location {
            ChildLocation::Topic(n) => log.topics.get(n).cloned()?,
            ChildLocation::DataWord(n) => {
                let data = log.data.strip_prefix("0x")?;
                let start = n * 64;
                data.get(start..start + 64).map(|w| format!("0x{w}"))?
            }
        };
        // An address is the low 20 bytes of the 32-byte word.
        let hex = word.strip_prefix("0x")?;
        if hex.len() < 40 {
            return None;
        }
        Some(format!("0x{}", &hex[hex.len() - 40..].to_ascii_lowercase()))
    }
}

/// Static or factory-resolved addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressSpec {
    Static(Vec<String>),
    Factory(FactorySpec),
}

/// Positional topic filter. `topics[i]` is a set of accepted values for
/// topic slot `i`; an empty set matches anything. Slot 0 is normally the
/// union of the source's event topic hashes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    pub topics: Vec<Vec<String>>,
}

impl TopicFilter {
    pub fn matches(&self, log: &Log) -> bool {
        self.topics.iter().enumerate().all(|(i, accepted)| {
            accepted.is_empty()
                || log
                    .topics
                    .get(i)
                    .is_some_and(|t| accepted.iter().any(|a| a.eq_ignore_ascii_case(t)))
        })
    }
}

/// A contract subscription on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSource {
    pub address: AddressSpec,
    pub events: Vec<EventAbi>,
    pub functions: Vec<FunctionAbi>,
    /// Server-side log filter compiled from `contracts[name].filter`.
    pub topics: TopicFilter,
    pub include_transaction_receipts: bool,
    pub include_call_traces: bool,
}

/// A block-interval subscription: one event for every block number with
/// `(number - start_block) % interval == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSource {
    pub interval: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Contract(ContractSource),
    Blocks(BlockSource),
}

/// A declarative subscription to events on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    /// Network name from the configuration.
    pub network: String,
    pub chain_id: u64,
    pub start_block: u64,
    pub end_block: Option<u64>,
    pub kind: SourceKind,
}

impl Source {
    pub fn as_contract(&self) -> Option<&ContractSource> {
        match &self.kind {
            SourceKind::Contract(c) => Some(c),
            SourceKind::Blocks(_) => None,
        }
    }

    pub fn as_blocks(&self) -> Option<&BlockSource> {
        match &self.kind {
            SourceKind::Blocks(b) => Some(b),
            SourceKind::Contract(_) => None,
        }
    }

    /// Resolve the ABI event name for a log's `topics[0]`.
    pub fn event_name_for(&self, topic0: &str) -> Option<&str> {
        self.as_contract()?
            .events
            .iter()
            .find(|e| e.topic0.eq_ignore_ascii_case(topic0))
            .map(|e| e.name.as_str())
    }

    /// Resolve the ABI function name for a trace's 4-byte selector.
    pub fn function_name_for(&self, selector: &str) -> Option<&str> {
        self.as_contract()?
            .functions
            .iter()
            .find(|f| f.selector.eq_ignore_ascii_case(selector))
            .map(|f| f.name.as_str())
    }

    /// The topic filter sent to `eth_getLogs`: the explicit filter when one
    /// is configured, otherwise `topics[0]` constrained to the source's ABI
    /// event hashes.
    pub fn effective_topics(&self) -> TopicFilter {
        let Some(contract) = self.as_contract() else {
            return TopicFilter::default();
        };
        if !contract.topics.topics.is_empty() {
            return contract.topics.clone();
        }
        if contract.events.is_empty() {
            return TopicFilter::default();
        }
        TopicFilter {
            topics: vec![contract.events.iter().map(|e| e.topic0.clone()).collect()],
        }
    }

    /// Deterministic hash of the effective filter, independent of block
    /// range. Two sources with the same addresses, topics, and fetch flags
    /// share cache intervals.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.chain_id.to_be_bytes());
        match &self.kind {
            SourceKind::Contract(c) => {
                match &c.address {
                    AddressSpec::Static(addrs) => {
                        let mut sorted: Vec<String> =
                            addrs.iter().map(|a| a.to_ascii_lowercase()).collect();
                        sorted.sort();
                        hasher.update(b"static:");
                        for a in sorted {
                            hasher.update(a.as_bytes());
                            hasher.update(b",");
                        }
                    }
                    AddressSpec::Factory(f) => {
                        hasher.update(b"factory:");
                        hasher.update(f.address.to_ascii_lowercase().as_bytes());
                        hasher.update(f.event_topic0.to_ascii_lowercase().as_bytes());
                        hasher.update(format!("{:?}", f.child_location).as_bytes());
                    }
                }
                for slot in &c.topics.topics {
                    let mut sorted: Vec<String> =
                        slot.iter().map(|t| t.to_ascii_lowercase()).collect();
                    sorted.sort();
                    hasher.update(b"|");
                    for t in sorted {
                        hasher.update(t.as_bytes());
                        hasher.update(b",");
                    }
                }
                hasher.update([
                    c.include_transaction_receipts as u8,
                    c.include_call_traces as u8,
                ]);
            }
            SourceKind::Blocks(b) => {
                hasher.update(b"blocks:");
                hasher.update(b.interval.to_be_bytes());
                // Interval phase is anchored at the start block.
                hasher.update((self.start_block % b.interval.max(1)).to_be_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Case-insensitive address comparison.
pub fn addr_eq(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(address: &str, topics: &[&str], data: &str) -> Log {
        Log {
            address: address.into(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: data.into(),
            block_number: 200,
            block_hash: "0xb".into(),
            transaction_hash: "0xt".into(),
            transaction_index: 0,
            log_index: 0,
        }
    }

    fn contract_source(addresses: Vec<String>) -> Source {
        Source {
            name: "Token".into(),
            network: "mainnet".into(),
            chain_id: 1,
            start_block: 100,
            end_block: None,
            kind: SourceKind::Contract(ContractSource {
                address: AddressSpec::Static(addresses),
                events: vec![EventAbi {
                    name: "Transfer".into(),
                    topic0: "0xddf2".into(),
                }],
                functions: vec![],
                topics: TopicFilter::default(),
                include_transaction_receipts: false,
                include_call_traces: false,
            }),
        }
    }

    #[test]
    fn topic_filter_empty_matches_all() {
        let filter = TopicFilter::default();
        assert!(filter.matches(&log("0x1", &["0xabc"], "0x")));
    }

    #[test]
    fn topic_filter_positional() {
        let filter = TopicFilter {
            topics: vec![vec!["0xAAA".into()], vec![], vec!["0x111".into()]],
        };
        assert!(filter.matches(&log("0x1", &["0xaaa", "0xanything", "0x111"], "0x")));
        assert!(!filter.matches(&log("0x1", &["0xaaa", "0xanything", "0x222"], "0x")));
        // Missing topic slot fails a non-empty filter.
        assert!(!filter.matches(&log("0x1", &["0xaaa"], "0x")));
    }

    #[test]
    fn factory_extracts_child_from_topic() {
        let factory = FactorySpec {
            address: "0xFACFACFACFACFACFACFACFACFACFACFACFACFAC0".into(),
            event_topic0: "0xc1ea".into(),
            child_location: ChildLocation::Topic(1),
        };
        let child_word = format!("0x{}{}", "0".repeat(24), "a".repeat(40));
        let l = log(
            "0xfacfacfacfacfacfacfacfacfacfacfacfacfac0",
            &["0xc1ea", &child_word],
            "0x",
        );
        assert_eq!(
            factory.extract_child(&l),
            Some(format!("0x{}", "a".repeat(40)))
        );

        // Wrong topic0 — not a creation log.
        let other = log(
            "0xfacfacfacfacfacfacfacfacfacfacfacfacfac0",
            &["0xdead", &child_word],
            "0x",
        );
        assert_eq!(factory.extract_child(&other), None);
    }

    #[test]
    fn factory_extracts_child_from_data() {
        let factory = FactorySpec {
            address: "0xfac".into(),
            event_topic0: "0xc1ea".into(),
            child_location: ChildLocation::DataWord(1),
        };
        let data = format!("0x{}{}{}", "1".repeat(64), "0".repeat(24), "b".repeat(40));
        let l = log("0xfac", &["0xc1ea"], &data);
        assert_eq!(
            factory.extract_child(&l),
            Some(format!("0x{}", "b".repeat(40)))
        );
    }

    #[test]
    fn fingerprint_ignores_block_range() {
        let a = contract_source(vec!["0xAAA".into()]);
        let mut b = a.clone();
        b.start_block = 5_000;
        b.end_block = Some(9_000);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_is_address_order_and_case_insensitive() {
        let a = contract_source(vec!["0xAAA".into(), "0xbbb".into()]);
        let b = contract_source(vec!["0xBBB".into(), "0xaaa".into()]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_filter() {
        let a = contract_source(vec!["0xaaa".into()]);
        let b = contract_source(vec!["0xccc".into()]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn event_name_lookup() {
        let source = contract_source(vec!["0xaaa".into()]);
        assert_eq!(source.event_name_for("0xDDF2"), Some("Transfer"));
        assert_eq!(source.event_name_for("0x0000"), None);
    }
}
