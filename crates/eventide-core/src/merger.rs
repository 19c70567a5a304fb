//! Merges per-chain ordered event streams into one totally ordered stream.
//!
//! Classic low-watermark join: each chain reports a watermark checkpoint
//! ("everything at or below this has been produced"), and an event is
//! emitted only once the minimum watermark over all chains has reached its
//! checkpoint. An idle chain would stall the join forever, so the engine
//! pump artificially advances idle watermarks to the chain's latest
//! observed block (see `idle_timeout`).

use std::collections::{HashMap, VecDeque};

use crate::checkpoint::Checkpoint;
use crate::event::Event;

struct Lane {
    buffer: VecDeque<Event>,
    watermark: Checkpoint,
    /// Checkpoint of the last pushed event, for order enforcement.
    last_pushed: Checkpoint,
}

/// The merge state: per-chain FIFO buffers plus watermarks.
///
/// `push` requires per-chain checkpoint order (each chain's stream is
/// already ordered); `drain_ready` interleaves lanes by checkpoint.
pub struct WatermarkMerge {
    lanes: HashMap<u64, Lane>,
}

impl WatermarkMerge {
    /// Create a merge over a fixed set of chains. Every registered chain
    /// holds the join back until its watermark moves.
    pub fn new(chain_ids: impl IntoIterator<Item = u64>) -> Self {
        let lanes = chain_ids
            .into_iter()
            .map(|id| {
                (
                    id,
                    Lane {
                        buffer: VecDeque::new(),
                        watermark: Checkpoint::ZERO,
                        last_pushed: Checkpoint::ZERO,
                    },
                )
            })
            .collect();
        Self { lanes }
    }

    /// Buffer an event from its chain's stream.
    pub fn push(&mut self, event: Event) {
        let checkpoint = event.checkpoint();
        let lane = self
            .lanes
            .get_mut(&event.chain_id())
            .expect("event from unregistered chain");
        debug_assert!(
            lane.last_pushed <= checkpoint,
            "per-chain order violated: {} after {}",
            checkpoint,
            lane.last_pushed
        );
        lane.last_pushed = checkpoint;
        lane.buffer.push_back(event);
        // An event is also a watermark for its own chain.
        if checkpoint > lane.watermark {
            lane.watermark = checkpoint;
        }
    }

    /// Move a chain's watermark forward (no-op when behind the current one).
    pub fn advance_watermark(&mut self, chain_id: u64, to: Checkpoint) {
        if let Some(lane) = self.lanes.get_mut(&chain_id) {
            if to > lane.watermark {
                lane.watermark = to;
            }
        }
    }

    /// The slow-forward safe checkpoint: minimum watermark over all chains.
    /// Everything at or below it is complete.
    pub fn safe_checkpoint(&self) -> Checkpoint {
        self.lanes
            .values()
            .map(|l| l.watermark)
            .min()
            .unwrap_or(Checkpoint::MAX)
    }

    /// Emit, in checkpoint order, every buffered event at or below the safe
    /// checkpoint.
    pub fn drain_ready(&mut self) -> Vec<Event> {
        let floor = self.safe_checkpoint();
        let mut out = Vec::new();

        loop {
            // Lane with the smallest ready head.
            let next = self
                .lanes
                .iter()
                .filter_map(|(id, lane)| {
                    lane.buffer
                        .front()
                        .map(|e| e.checkpoint())
                        .filter(|cp| *cp <= floor)
                        .map(|cp| (cp, *id))
                })
                .min();
            match next {
                Some((_, chain_id)) => {
                    let lane = self.lanes.get_mut(&chain_id).expect("lane exists");
                    out.push(lane.buffer.pop_front().expect("head exists"));
                }
                None => break,
            }
        }
        out
    }

    /// Total number of buffered events across all chains.
    pub fn buffered(&self) -> usize {
        self.lanes.values().map(|l| l.buffer.len()).sum()
    }

    /// Buffered events for one chain; drives upstream backpressure.
    pub fn buffered_for(&self, chain_id: u64) -> usize {
        self.lanes.get(&chain_id).map_or(0, |l| l.buffer.len())
    }

    /// Drop every buffered event with checkpoint above `ancestor` on one
    /// chain (reorged-away events that must not be delivered).
    pub fn truncate_chain(&mut self, chain_id: u64, ancestor: Checkpoint) {
        if let Some(lane) = self.lanes.get_mut(&chain_id) {
            lane.buffer.retain(|e| e.checkpoint() <= ancestor);
            if lane.watermark > ancestor {
                lane.watermark = ancestor;
            }
            if lane.last_pushed > ancestor {
                lane.last_pushed = ancestor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SetupEvent;

    fn event(chain: u64, ts: u64, block: u64, index: u32) -> Event {
        Event::Setup(SetupEvent {
            checkpoint: Checkpoint::new(ts, chain, block, 0, index),
            source: format!("src-{chain}"),
            chain_id: chain,
            start_block: block,
        })
    }

    fn cp(ts: u64, chain: u64, block: u64) -> Checkpoint {
        Checkpoint::block_start(ts, chain, block)
    }

    #[test]
    fn holds_events_until_all_chains_report() {
        let mut merge = WatermarkMerge::new([1, 2]);
        merge.push(event(1, 1000, 50, 1));

        // Chain 2 has reported nothing — nothing is safe yet.
        assert!(merge.drain_ready().is_empty());
        assert_eq!(merge.buffered(), 1);

        merge.advance_watermark(2, cp(1200, 2, 90));
        let drained = merge.drain_ready();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].checkpoint().block_number, 50);
    }

    #[test]
    fn interleaves_chains_by_timestamp() {
        // chain 1 @ t=1000, chain 2 @ t=999, chain 1 @ t=1001
        let mut merge = WatermarkMerge::new([1, 2]);
        merge.push(event(1, 1000, 50, 1));
        merge.push(event(1, 1001, 51, 1));
        merge.push(event(2, 999, 80, 1));
        merge.advance_watermark(2, cp(1500, 2, 95));

        let order: Vec<(u64, u64)> = merge
            .drain_ready()
            .iter()
            .map(|e| (e.chain_id(), e.checkpoint().block_timestamp))
            .collect();
        assert_eq!(order, vec![(2, 999), (1, 1000), (1, 1001)]);
    }

    #[test]
    fn partial_drain_up_to_watermark() {
        let mut merge = WatermarkMerge::new([1, 2]);
        merge.push(event(1, 1000, 50, 1));
        merge.push(event(1, 2000, 60, 1));
        merge.advance_watermark(2, cp(1500, 2, 90));

        // Only the t=1000 event is at or below min(watermarks).
        let drained = merge.drain_ready();
        assert_eq!(drained.len(), 1);
        assert_eq!(merge.buffered(), 1);

        merge.advance_watermark(2, cp(2500, 2, 95));
        assert_eq!(merge.drain_ready().len(), 1);
    }

    #[test]
    fn idle_chain_unblocks_via_watermark_advance() {
        // Chain 2 produces nothing; advancing its watermark to its latest
        // observed block lets chain 1 flow (S6).
        let mut merge = WatermarkMerge::new([1, 2]);
        for i in 0..5 {
            merge.push(event(1, 1000 + i, 50 + i, 1));
        }
        assert!(merge.drain_ready().is_empty());

        merge.advance_watermark(2, cp(5000, 2, 400));
        assert_eq!(merge.drain_ready().len(), 5);
    }

    #[test]
    fn safe_checkpoint_is_min_over_chains() {
        let mut merge = WatermarkMerge::new([1, 2]);
        merge.advance_watermark(1, cp(2000, 1, 70));
        merge.advance_watermark(2, cp(1500, 2, 90));
        assert_eq!(merge.safe_checkpoint(), cp(1500, 2, 90));
    }

    #[test]
    fn watermark_never_regresses() {
        let mut merge = WatermarkMerge::new([1]);
        merge.advance_watermark(1, cp(2000, 1, 70));
        merge.advance_watermark(1, cp(1000, 1, 30));
        assert_eq!(merge.safe_checkpoint(), cp(2000, 1, 70));
    }

    #[test]
    fn truncate_drops_reorged_buffer() {
        let mut merge = WatermarkMerge::new([1]);
        merge.push(event(1, 1000, 100, 1));
        merge.push(event(1, 1012, 101, 1));
        merge.push(event(1, 1024, 102, 1));

        // Ancestor at the end of block 100: 101 and 102 are reorged away.
        merge.truncate_chain(1, Checkpoint::new(1000, 1, 100, u32::MAX, u32::MAX));
        assert_eq!(merge.buffered(), 1);
    }
}
