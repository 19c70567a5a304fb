//! Checkpoint — the total-order coordinate of an event across all chains.
//!
//! Events from different chains are interleaved by comparing checkpoints.
//! The order is lexicographic on `(block_timestamp, chain_id, block_number,
//! transaction_index, event_index)`, which the derived `Ord` provides as
//! long as the fields stay declared in exactly that order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// Field widths fit every reachable value (u32 needs 10 digits; block
// numbers and chain ids stay well under 16). `Checkpoint::MAX` is a
// sentinel for comparisons only and must not be encoded.
const TS_WIDTH: usize = 10;
const CHAIN_WIDTH: usize = 16;
const BLOCK_WIDTH: usize = 16;
const TX_WIDTH: usize = 10;
const EVENT_WIDTH: usize = 10;

/// Encoded checkpoint length in characters.
pub const ENCODED_LEN: usize = TS_WIDTH + CHAIN_WIDTH + BLOCK_WIDTH + TX_WIDTH + EVENT_WIDTH;

/// A globally comparable event coordinate.
///
/// Field order is load-bearing: `Ord` is derived and must compare
/// `block_timestamp` first and `event_index` last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unix timestamp of the block (seconds).
    pub block_timestamp: u64,
    /// Chain identifier.
    pub chain_id: u64,
    /// Block number.
    pub block_number: u64,
    /// Transaction index within the block.
    pub transaction_index: u32,
    /// Event index within the block (0 is reserved for setup events).
    pub event_index: u32,
}

/// An encoded checkpoint string failed to parse.
#[derive(Debug, Error)]
#[error("malformed checkpoint string: {0:?}")]
pub struct ParseCheckpointError(pub String);

impl Checkpoint {
    pub const ZERO: Checkpoint = Checkpoint {
        block_timestamp: 0,
        chain_id: 0,
        block_number: 0,
        transaction_index: 0,
        event_index: 0,
    };

    /// The largest representable checkpoint.
    pub const MAX: Checkpoint = Checkpoint {
        block_timestamp: u64::MAX,
        chain_id: u64::MAX,
        block_number: u64::MAX,
        transaction_index: u32::MAX,
        event_index: u32::MAX,
    };

    pub fn new(
        block_timestamp: u64,
        chain_id: u64,
        block_number: u64,
        transaction_index: u32,
        event_index: u32,
    ) -> Self {
        Self {
            block_timestamp,
            chain_id,
            block_number,
            transaction_index,
            event_index,
        }
    }

    /// The checkpoint at which a block begins — sorts before every event
    /// inside that block (real events use `event_index >= 1`).
    pub fn block_start(block_timestamp: u64, chain_id: u64, block_number: u64) -> Self {
        Self::new(block_timestamp, chain_id, block_number, 0, 0)
    }

    /// Render as a fixed-width zero-padded decimal string.
    ///
    /// The encoding collates byte-wise exactly like `Ord`, so the database
    /// can compare stored checkpoints with plain text comparison.
    pub fn encode(&self) -> String {
        format!(
            "{:0ts$}{:0chain$}{:0block$}{:0tx$}{:0ev$}",
            self.block_timestamp,
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.event_index,
            ts = TS_WIDTH,
            chain = CHAIN_WIDTH,
            block = BLOCK_WIDTH,
            tx = TX_WIDTH,
            ev = EVENT_WIDTH,
        )
    }

    /// Parse a string produced by [`Checkpoint::encode`].
    pub fn decode(s: &str) -> Result<Self, ParseCheckpointError> {
        if s.len() != ENCODED_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseCheckpointError(s.to_string()));
        }
        let field = |from: usize, to: usize| -> Result<u64, ParseCheckpointError> {
            s[from..to]
                .parse::<u64>()
                .map_err(|_| ParseCheckpointError(s.to_string()))
        };
        let mut at = 0;
        let mut next = |width: usize| {
            let v = field(at, at + width);
            at += width;
            v
        };
        Ok(Self {
            block_timestamp: next(TS_WIDTH)?,
            chain_id: next(CHAIN_WIDTH)?,
            block_number: next(BLOCK_WIDTH)?,
            transaction_index: next(TX_WIDTH)? as u32,
            event_index: next(EVENT_WIDTH)? as u32,
        })
    }
}

impl std::fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}:{}:{}",
            self.chain_id,
            self.block_timestamp,
            self.block_number,
            self.transaction_index,
            self.event_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(ts: u64, chain: u64, block: u64, tx: u32, ev: u32) -> Checkpoint {
        Checkpoint::new(ts, chain, block, tx, ev)
    }

    #[test]
    fn timestamp_dominates_across_chains() {
        // chain 1 block at t=1000, chain 2 block at t=999, chain 1 block at t=1001
        let a = cp(1000, 1, 50, 0, 1);
        let b = cp(999, 2, 80, 0, 1);
        let c = cp(1001, 1, 51, 0, 1);

        let mut v = vec![a, b, c];
        v.sort();
        assert_eq!(v, vec![b, a, c]);
    }

    #[test]
    fn chain_breaks_timestamp_ties() {
        let a = cp(1000, 1, 50, 0, 1);
        let b = cp(1000, 2, 50, 0, 1);
        assert!(a < b);
    }

    #[test]
    fn within_block_ordering() {
        let setup = Checkpoint::block_start(1000, 1, 100);
        let first_log = cp(1000, 1, 100, 0, 1);
        let later_tx = cp(1000, 1, 100, 3, 1);
        assert!(setup < first_log);
        assert!(first_log < later_tx);
    }

    #[test]
    fn encode_roundtrip() {
        let orig = cp(1_700_000_000, 8453, 19_250_331, 141, 7);
        let encoded = orig.encode();
        assert_eq!(encoded.len(), ENCODED_LEN);
        assert_eq!(Checkpoint::decode(&encoded).unwrap(), orig);

        // End-of-block checkpoints saturate the u32 fields; the encoding
        // must hold them without overflowing its columns.
        let end = cp(1_700_000_000, 1, 100, u32::MAX, u32::MAX);
        let encoded = end.encode();
        assert_eq!(encoded.len(), ENCODED_LEN);
        assert_eq!(Checkpoint::decode(&encoded).unwrap(), end);
    }

    #[test]
    fn encode_collates_like_ord() {
        let samples = [
            Checkpoint::ZERO,
            cp(999, 2, 80, 0, 1),
            cp(1000, 1, 50, 0, 0),
            cp(1000, 1, 50, 0, 1),
            cp(1000, 1, 50, 1, 0),
            cp(1000, 2, 1, 0, 0),
            cp(1001, 1, 51, 0, 1),
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(
                    a.cmp(b),
                    a.encode().cmp(&b.encode()),
                    "collation mismatch for {a} vs {b}"
                );
            }
        }
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Checkpoint::decode("").is_err());
        assert!(Checkpoint::decode("not-a-checkpoint").is_err());
        let mut short = Checkpoint::ZERO.encode();
        short.pop();
        assert!(Checkpoint::decode(&short).is_err());
    }
}
