//! Per-block event assembly, shared by historical replay and realtime.
//!
//! Both phases must assign identical checkpoints to identical chain data
//! (crash resume compares checkpoints across runs), so all event numbering
//! lives here: within a block, events are emitted per transaction in
//! ascending order — logs by `log_index`, then call traces by
//! `trace_index` — followed by block-interval events, with `event_index`
//! counting up from 1. Setup events use index 0 at the first processed
//! block at or after the source's start block and therefore sort first.

use std::collections::{BTreeMap, HashMap, HashSet};

use eventide_core::checkpoint::Checkpoint;
use eventide_core::event::{
    Block, BlockEvent, CallTrace, Event, Log, LogEvent, SetupEvent, TraceEvent, Transaction,
    TransactionReceipt,
};
use eventide_core::source::{addr_eq, AddressSpec, Source};

/// Transaction index assigned to block-interval events so they sort after
/// every transaction of their block.
const BLOCK_EVENT_TX_INDEX: u32 = u32::MAX;

/// The sources subscribed on one chain, plus the dynamic state that
/// accumulates while blocks are processed: factory children and
/// not-yet-emitted setup events.
pub struct SourceSet {
    chain_id: u64,
    sources: Vec<Source>,
    /// source index → child address (lowercase) → first active block.
    children: HashMap<usize, BTreeMap<String, u64>>,
    /// Contract source indexes whose setup event has not been emitted yet.
    pending_setups: Vec<usize>,
}

impl SourceSet {
    pub fn new(chain_id: u64, sources: Vec<Source>) -> Self {
        let sources: Vec<Source> = sources.into_iter().filter(|s| s.chain_id == chain_id).collect();
        let pending_setups = sources
            .iter()
            .enumerate()
            .filter(|(_, s)| s.as_contract().is_some())
            .map(|(i, _)| i)
            .collect();
        let children = sources
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(
                    s.as_contract().map(|c| &c.address),
                    Some(AddressSpec::Factory(_))
                )
            })
            .map(|(i, _)| (i, BTreeMap::new()))
            .collect();
        Self {
            chain_id,
            sources,
            children,
            pending_setups,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Lowest start block over all sources.
    pub fn min_start_block(&self) -> Option<u64> {
        self.sources.iter().map(|s| s.start_block).min()
    }

    /// Scan logs for factory creation events and register children. A
    /// child discovered at block `n` matches from block `n + 1`.
    pub fn register_children(&mut self, logs: &[Log]) -> usize {
        let mut found = 0;
        for (idx, source) in self.sources.iter().enumerate() {
            let Some(AddressSpec::Factory(factory)) =
                source.as_contract().map(|c| &c.address)
            else {
                continue;
            };
            for log in logs {
                if let Some(child) = factory.extract_child(log) {
                    let active_from = log.block_number + 1;
                    let known = self.children.entry(idx).or_default();
                    if !known.contains_key(&child) {
                        known.insert(child.clone(), active_from);
                        found += 1;
                        tracing::debug!(
                            source = source.name,
                            child,
                            active_from,
                            "factory child registered"
                        );
                    }
                }
            }
        }
        found
    }

    /// Every child known for a factory source, regardless of activation
    /// block (activation is re-checked per block during matching).
    pub fn known_children(&self, source_index: usize) -> Vec<String> {
        self.children
            .get(&source_index)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The union of addresses worth fetching logs for; `None` means some
    /// source matches any address, so fetch unfiltered.
    pub fn fetch_addresses(&self) -> Option<Vec<String>> {
        let mut addresses = HashSet::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let Some(contract) = source.as_contract() else {
                continue;
            };
            match &contract.address {
                AddressSpec::Static(addrs) if addrs.is_empty() => return None,
                AddressSpec::Static(addrs) => {
                    addresses.extend(addrs.iter().map(|a| a.to_ascii_lowercase()));
                }
                AddressSpec::Factory(factory) => {
                    addresses.insert(factory.address.to_ascii_lowercase());
                    addresses.extend(self.known_children(idx));
                }
            }
        }
        let mut out: Vec<String> = addresses.into_iter().collect();
        out.sort();
        Some(out)
    }

    /// Returns `true` when any source wants transaction receipts.
    pub fn wants_receipts(&self) -> bool {
        self.sources
            .iter()
            .filter_map(|s| s.as_contract())
            .any(|c| c.include_transaction_receipts)
    }

    /// Returns `true` when any source wants call traces.
    pub fn wants_traces(&self) -> bool {
        self.sources
            .iter()
            .filter_map(|s| s.as_contract())
            .any(|c| c.include_call_traces)
    }

    fn in_range(source: &Source, block: u64) -> bool {
        block >= source.start_block && source.end_block.map_or(true, |end| block <= end)
    }

    fn address_matches(&self, idx: usize, source: &Source, log: &Log) -> bool {
        let Some(contract) = source.as_contract() else {
            return false;
        };
        match &contract.address {
            AddressSpec::Static(addrs) => {
                addrs.is_empty() || addrs.iter().any(|a| addr_eq(a, &log.address))
            }
            AddressSpec::Factory(_) => self
                .children
                .get(&idx)
                .and_then(|m| m.get(&log.address.to_ascii_lowercase()))
                .is_some_and(|active_from| log.block_number >= *active_from),
        }
    }

    /// Sources (with resolved event names) this log belongs to.
    fn match_log(&self, log: &Log) -> Vec<(usize, String)> {
        let mut matches = Vec::new();
        for (idx, source) in self.sources.iter().enumerate() {
            let Some(contract) = source.as_contract() else {
                continue;
            };
            if !Self::in_range(source, log.block_number)
                || !self.address_matches(idx, source, log)
                || !contract.topics.matches(log)
            {
                continue;
            }
            let Some(topic0) = log.topic0() else { continue };
            if let Some(name) = source.event_name_for(topic0) {
                matches.push((idx, name.to_string()));
            }
        }
        matches
    }

    /// Sources (with resolved function names) this call trace belongs to.
    fn match_trace(&self, trace: &CallTrace) -> Vec<(usize, String)> {
        let mut matches = Vec::new();
        let Some(selector) = trace.selector() else {
            return matches;
        };
        for (idx, source) in self.sources.iter().enumerate() {
            let Some(contract) = source.as_contract() else {
                continue;
            };
            if !contract.include_call_traces || !Self::in_range(source, trace.block_number) {
                continue;
            }
            let to_matches = match &contract.address {
                AddressSpec::Static(addrs) => {
                    addrs.is_empty() || addrs.iter().any(|a| addr_eq(a, &trace.to))
                }
                AddressSpec::Factory(_) => self
                    .children
                    .get(&idx)
                    .and_then(|m| m.get(&trace.to.to_ascii_lowercase()))
                    .is_some_and(|active_from| trace.block_number >= *active_from),
            };
            if !to_matches {
                continue;
            }
            if let Some(name) = source.function_name_for(selector) {
                matches.push((idx, name.to_string()));
            }
        }
        matches
    }

    /// Setup events due at or before this block, in start-block order.
    pub(crate) fn take_due_setups(&mut self, block: &Block) -> Vec<Event> {
        let mut due: Vec<usize> = Vec::new();
        self.pending_setups.retain(|idx| {
            if self.sources[*idx].start_block <= block.number {
                due.push(*idx);
                false
            } else {
                true
            }
        });
        due.sort_by_key(|idx| (self.sources[*idx].start_block, *idx));
        due.into_iter()
            .map(|idx| {
                let source = &self.sources[idx];
                // Index 0 puts the setup ahead of every real event of this
                // block; anchoring at the current block (not the nominal
                // start block) keeps the stream monotone when the start
                // block itself carried no data.
                Event::Setup(SetupEvent {
                    checkpoint: Checkpoint::new(
                        block.timestamp,
                        self.chain_id,
                        block.number,
                        0,
                        0,
                    ),
                    source: source.name.clone(),
                    chain_id: self.chain_id,
                    start_block: source.start_block,
                })
            })
            .collect()
    }

    /// Assemble every event of one block, in checkpoint order.
    ///
    /// Factory children found in this block's logs are registered first
    /// (they activate from the next block, so same-block logs of a new
    /// child do not match).
    pub fn assemble_block(
        &mut self,
        block: &Block,
        transactions: &HashMap<String, Transaction>,
        receipts: &HashMap<String, TransactionReceipt>,
        logs: &[Log],
        traces: &[CallTrace],
    ) -> Vec<Event> {
        self.register_children(logs);

        let mut events = self.take_due_setups(block);
        let mut event_index: u32 = 1;

        // Group per transaction so the emitted order equals checkpoint
        // order: (transaction_index, then logs before traces).
        let mut by_tx: BTreeMap<u32, (Vec<&Log>, Vec<&CallTrace>)> = BTreeMap::new();
        for log in logs {
            if log.block_number == block.number {
                by_tx.entry(log.transaction_index).or_default().0.push(log);
            }
        }
        for trace in traces {
            if trace.block_number == block.number {
                by_tx
                    .entry(trace.transaction_index)
                    .or_default()
                    .1
                    .push(trace);
            }
        }

        for (tx_index, (mut tx_logs, mut tx_traces)) in by_tx {
            tx_logs.sort_by_key(|l| l.log_index);
            tx_traces.sort_by_key(|t| t.trace_index);

            for log in tx_logs {
                for (idx, event_name) in self.match_log(log) {
                    let source = &self.sources[idx];
                    let contract = source.as_contract().expect("matched source is a contract");
                    events.push(Event::Log(LogEvent {
                        checkpoint: Checkpoint::new(
                            block.timestamp,
                            self.chain_id,
                            block.number,
                            tx_index,
                            event_index,
                        ),
                        source: source.name.clone(),
                        chain_id: self.chain_id,
                        name: event_name,
                        log: log.clone(),
                        args: serde_json::json!({
                            "topics": log.topics,
                            "data": log.data,
                        }),
                        block: block.clone(),
                        transaction: transactions.get(&log.transaction_hash).cloned(),
                        receipt: if contract.include_transaction_receipts {
                            receipts.get(&log.transaction_hash).cloned()
                        } else {
                            None
                        },
                    }));
                    event_index += 1;
                }
            }

            for trace in tx_traces {
                for (idx, function_name) in self.match_trace(trace) {
                    let source = &self.sources[idx];
                    events.push(Event::Trace(TraceEvent {
                        checkpoint: Checkpoint::new(
                            block.timestamp,
                            self.chain_id,
                            block.number,
                            tx_index,
                            event_index,
                        ),
                        source: source.name.clone(),
                        chain_id: self.chain_id,
                        name: function_name,
                        trace: trace.clone(),
                        block: block.clone(),
                        transaction: transactions.get(&trace.transaction_hash).cloned(),
                    }));
                    event_index += 1;
                }
            }
        }

        for source in &self.sources {
            let Some(blocks) = source.as_blocks() else {
                continue;
            };
            if !Self::in_range(source, block.number) {
                continue;
            }
            if (block.number - source.start_block) % blocks.interval != 0 {
                continue;
            }
            events.push(Event::Block(BlockEvent {
                checkpoint: Checkpoint::new(
                    block.timestamp,
                    self.chain_id,
                    block.number,
                    BLOCK_EVENT_TX_INDEX,
                    event_index,
                ),
                source: source.name.clone(),
                chain_id: self.chain_id,
                block: block.clone(),
            }));
            event_index += 1;
        }

        events
    }
}

/// End-of-block checkpoint: sorts after every event inside `number`.
pub fn block_end_checkpoint(chain_id: u64, timestamp: u64, number: u64) -> Checkpoint {
    Checkpoint::new(timestamp, chain_id, number, u32::MAX, u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventide_core::source::{
        BlockSource, ChildLocation, ContractSource, EventAbi, FactorySpec, SourceKind,
        TopicFilter,
    };

    const TRANSFER_TOPIC: &str = "0xddf252ad";
    const CREATED_TOPIC: &str = "0xc1ea0000";

    fn block(number: u64) -> Block {
        Block {
            chain_id: 1,
            number,
            hash: format!("0xb{number}"),
            parent_hash: format!("0xb{}", number - 1),
            timestamp: number * 12,
        }
    }

    fn log(address: &str, block_number: u64, tx_index: u32, log_index: u32) -> Log {
        Log {
            address: address.into(),
            topics: vec![TRANSFER_TOPIC.into()],
            data: "0x".into(),
            block_number,
            block_hash: format!("0xb{block_number}"),
            transaction_hash: format!("0xt{block_number}-{tx_index}"),
            transaction_index: tx_index,
            log_index,
        }
    }

    fn token_source(addresses: Vec<String>) -> Source {
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
                    topic0: TRANSFER_TOPIC.into(),
                }],
                functions: vec![],
                topics: TopicFilter::default(),
                include_transaction_receipts: false,
                include_call_traces: false,
            }),
        }
    }

    fn factory_source() -> Source {
        Source {
            name: "Pool".into(),
            network: "mainnet".into(),
            chain_id: 1,
            start_block: 100,
            end_block: None,
            kind: SourceKind::Contract(ContractSource {
                address: AddressSpec::Factory(FactorySpec {
                    address: "0xfac".into(),
                    event_topic0: CREATED_TOPIC.into(),
                    child_location: ChildLocation::Topic(1),
                }),
                events: vec![EventAbi {
                    name: "Transfer".into(),
                    topic0: TRANSFER_TOPIC.into(),
                }],
                functions: vec![],
                topics: TopicFilter::default(),
                include_transaction_receipts: false,
                include_call_traces: false,
            }),
        }
    }

    fn assemble(set: &mut SourceSet, block: &Block, logs: &[Log]) -> Vec<Event> {
        set.assemble_block(block, &HashMap::new(), &HashMap::new(), logs, &[])
    }

    #[test]
    fn setup_precedes_first_event_and_sorts_first() {
        let mut set = SourceSet::new(1, vec![token_source(vec!["0xaaa".into()])]);
        let b = block(100);
        let events = assemble(&mut set, &b, &[log("0xaaa", 100, 0, 0)]);

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Event::Setup(_)));
        assert!(matches!(events[1], Event::Log(_)));
        assert!(events[0].checkpoint() < events[1].checkpoint());

        // Setup is emitted exactly once.
        let events = assemble(&mut set, &block(101), &[log("0xaaa", 101, 0, 0)]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Log(_)));
    }

    #[test]
    fn events_are_in_checkpoint_order_within_block() {
        let mut set = SourceSet::new(1, vec![token_source(vec!["0xaaa".into()])]);
        let b = block(100);
        let logs = vec![
            log("0xaaa", 100, 3, 7),
            log("0xaaa", 100, 0, 1),
            log("0xaaa", 100, 0, 0),
        ];
        let events = assemble(&mut set, &b, &logs);

        let checkpoints: Vec<Checkpoint> = events.iter().map(Event::checkpoint).collect();
        let mut sorted = checkpoints.clone();
        sorted.sort();
        assert_eq!(checkpoints, sorted);

        // Log order follows (transaction_index, log_index).
        let log_indexes: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                Event::Log(l) => Some(l.log.log_index),
                _ => None,
            })
            .collect();
        assert_eq!(log_indexes, vec![0, 1, 7]);
    }

    #[test]
    fn unmatched_logs_are_skipped() {
        let mut set = SourceSet::new(1, vec![token_source(vec!["0xaaa".into()])]);
        let events = assemble(&mut set, &block(100), &[log("0xbbb", 100, 0, 0)]);
        // Setup still fires; the foreign log does not.
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Setup(_)));
    }

    #[test]
    fn logs_before_start_block_are_skipped() {
        let mut set = SourceSet::new(1, vec![token_source(vec!["0xaaa".into()])]);
        let events = assemble(&mut set, &block(99), &[log("0xaaa", 99, 0, 0)]);
        assert!(events.is_empty());
    }

    #[test]
    fn factory_child_activates_next_block() {
        let mut set = SourceSet::new(1, vec![factory_source()]);
        let child_word = format!("0x{}{}", "0".repeat(24), "a".repeat(40));
        let child_addr = format!("0x{}", "a".repeat(40));

        // Block 200: creation log plus a same-block child log — the child
        // is only active from 201, so the child log must not match.
        let creation = Log {
            address: "0xfac".into(),
            topics: vec![CREATED_TOPIC.into(), child_word],
            data: "0x".into(),
            block_number: 200,
            block_hash: "0xb200".into(),
            transaction_hash: "0xt200-0".into(),
            transaction_index: 0,
            log_index: 0,
        };
        let same_block_child_log = log(&child_addr, 200, 1, 0);
        let events = assemble(&mut set, &block(200), &[creation, same_block_child_log]);
        assert!(events.iter().all(|e| !matches!(e, Event::Log(_))));

        // Block 250: the child's log is delivered.
        let events = assemble(&mut set, &block(250), &[log(&child_addr, 250, 0, 0)]);
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::Log(_)))
                .count(),
            1
        );
        assert_eq!(events[0].source_name(), "Pool");
    }

    #[test]
    fn block_interval_source_fires_on_interval() {
        let source = Source {
            name: "tick".into(),
            network: "mainnet".into(),
            chain_id: 1,
            start_block: 100,
            end_block: None,
            kind: SourceKind::Blocks(BlockSource { interval: 10 }),
        };
        let mut set = SourceSet::new(1, vec![source]);

        let events = assemble(&mut set, &block(110), &[]);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Event::Block(_)));

        let events = assemble(&mut set, &block(111), &[]);
        assert!(events.is_empty());
    }

    #[test]
    fn fetch_addresses_unions_sources() {
        let set = SourceSet::new(
            1,
            vec![token_source(vec!["0xAAA".into()]), factory_source()],
        );
        let addrs = set.fetch_addresses().unwrap();
        assert!(addrs.contains(&"0xaaa".to_string()));
        assert!(addrs.contains(&"0xfac".to_string()));

        // A match-anything source forces unfiltered fetching.
        let set = SourceSet::new(1, vec![token_source(vec![])]);
        assert!(set.fetch_addresses().is_none());
    }

    #[test]
    fn other_chain_sources_are_ignored() {
        let mut other = token_source(vec!["0xaaa".into()]);
        other.chain_id = 8453;
        let set = SourceSet::new(1, vec![other]);
        assert!(set.is_empty());
    }
}
