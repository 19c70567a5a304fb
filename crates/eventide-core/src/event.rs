//! Chain data records and the event variants delivered to handlers.

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;

// ─── Chain records ────────────────────────────────────────────────────────────

/// A block header, parsed from the node's JSON representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain_id: u64,
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds).
    pub timestamp: u64,
}

impl Block {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &Block) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

/// A transaction, as far as the engine needs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub transaction_index: u32,
    pub from: String,
    /// `None` for contract creations.
    pub to: Option<String>,
    /// Hex-encoded wei value.
    pub value: String,
    /// Hex-encoded calldata.
    pub input: String,
}

/// A transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    /// 1 success, 0 reverted.
    pub status: u64,
    pub gas_used: u64,
    pub contract_address: Option<String>,
}

/// An emitted log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    /// Hex-encoded data payload.
    pub data: String,
    pub block_number: u64,
    pub block_hash: String,
    pub transaction_hash: String,
    pub transaction_index: u32,
    pub log_index: u32,
}

impl Log {
    pub fn topic0(&self) -> Option<&str> {
        self.topics.first().map(String::as_str)
    }
}

/// A call-level trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    pub from: String,
    pub to: String,
    /// Hex-encoded calldata; the first 4 bytes select the function.
    pub input: String,
    pub output: Option<String>,
    pub value: String,
    pub block_number: u64,
    pub transaction_hash: String,
    pub transaction_index: u32,
    /// Position in the block's depth-first trace order.
    pub trace_index: u32,
}

impl CallTrace {
    /// The 4-byte function selector, when the input carries one.
    pub fn selector(&self) -> Option<&str> {
        let hex = self.input.strip_prefix("0x")?;
        if hex.len() >= 8 {
            Some(&self.input[..10])
        } else {
            None
        }
    }
}

// ─── Events ───────────────────────────────────────────────────────────────────

/// A decoded log event.
///
/// `args` carries the raw topics and data as JSON; argument decoding is the
/// handler's concern (the config layer already resolved the event name from
/// `topics[0]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub checkpoint: Checkpoint,
    pub source: String,
    pub chain_id: u64,
    /// Event name resolved from the source's ABI.
    pub name: String,
    pub log: Log,
    pub args: serde_json::Value,
    pub block: Block,
    pub transaction: Option<Transaction>,
    pub receipt: Option<TransactionReceipt>,
}

/// One event per matching block of a block-interval source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    pub checkpoint: Checkpoint,
    pub source: String,
    pub chain_id: u64,
    pub block: Block,
}

/// A matched call trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub checkpoint: Checkpoint,
    pub source: String,
    pub chain_id: u64,
    /// Function name resolved from the source's ABI.
    pub name: String,
    pub trace: CallTrace,
    pub block: Block,
    pub transaction: Option<Transaction>,
}

/// Synthesized once per `(contract, network)` before the contract's first
/// real event; checkpoint sits at the contract's start block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupEvent {
    pub checkpoint: Checkpoint,
    pub source: String,
    pub chain_id: u64,
    pub start_block: u64,
}

/// An indexable event, totally ordered by its checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Log(LogEvent),
    Block(BlockEvent),
    Trace(TraceEvent),
    Setup(SetupEvent),
}

impl Event {
    pub fn checkpoint(&self) -> Checkpoint {
        match self {
            Self::Log(e) => e.checkpoint,
            Self::Block(e) => e.checkpoint,
            Self::Trace(e) => e.checkpoint,
            Self::Setup(e) => e.checkpoint,
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            Self::Log(e) => e.chain_id,
            Self::Block(e) => e.chain_id,
            Self::Trace(e) => e.chain_id,
            Self::Setup(e) => e.chain_id,
        }
    }

    /// Name of the source that produced this event.
    pub fn source_name(&self) -> &str {
        match self {
            Self::Log(e) => &e.source,
            Self::Block(e) => &e.source,
            Self::Trace(e) => &e.source,
            Self::Setup(e) => &e.source,
        }
    }

    /// Event name used for handler lookup: the ABI event name for logs,
    /// the function name for traces, `"block"` / `"setup"` for the rest.
    pub fn event_name(&self) -> &str {
        match self {
            Self::Log(e) => &e.name,
            Self::Block(_) => crate::handler::BLOCK_EVENT,
            Self::Trace(e) => &e.name,
            Self::Setup(_) => crate::handler::SETUP_EVENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_extends_parent() {
        let parent = Block {
            chain_id: 1,
            number: 100,
            hash: "0xaaa".into(),
            parent_hash: "0x000".into(),
            timestamp: 1000,
        };
        let child = Block {
            chain_id: 1,
            number: 101,
            hash: "0xbbb".into(),
            parent_hash: "0xaaa".into(),
            timestamp: 1012,
        };
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn trace_selector() {
        let mut trace = CallTrace {
            from: "0x1".into(),
            to: "0x2".into(),
            input: "0xa9059cbb000000".into(),
            output: None,
            value: "0x0".into(),
            block_number: 1,
            transaction_hash: "0x3".into(),
            transaction_index: 0,
            trace_index: 0,
        };
        assert_eq!(trace.selector(), Some("0xa9059cbb"));
        trace.input = "0x".into();
        assert_eq!(trace.selector(), None);
    }

    #[test]
    fn event_names() {
        let setup = Event::Setup(SetupEvent {
            checkpoint: Checkpoint::ZERO,
            source: "Token".into(),
            chain_id: 1,
            start_block: 100,
        });
        assert_eq!(setup.event_name(), "setup");
        assert_eq!(setup.source_name(), "Token");
    }
}
