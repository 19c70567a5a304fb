//! Realtime sync for one chain.
//!
//! A polling loop follows the chain tip and maintains the local chain —
//! the sliding window of unfinalized blocks between the finalized tip and
//! the head. On each poll:
//!
//! 1. head extends the window → fetch the block's data, emit `Advance`;
//! 2. parent hash mismatch → walk back via `eth_getBlockByHash` to the
//!    common ancestor, emit `Reorg`, truncate, re-emit the new suffix;
//! 3. no ancestor within the finality window → fatal deep reorg.
//!
//! Blocks aging below `tip - finality_depth` are flushed to the sync cache
//! and dropped from the window.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use eventide_core::checkpoint::Checkpoint;
use eventide_core::config::NetworkConfig;
use eventide_core::event::{Block, Event, Transaction, TransactionReceipt};
use eventide_core::ranges::BlockRange;
use eventide_core::source::TopicFilter;
use eventide_rpc::RpcClient;
use eventide_store::{ChunkData, SyncCache};

use crate::assemble::{block_end_checkpoint, SourceSet};
use crate::error::SyncError;

/// What the realtime sync tells the engine.
#[derive(Debug)]
pub enum ChainMessage {
    /// A new canonical block with its assembled events.
    Advance {
        chain_id: u64,
        block_number: u64,
        block_timestamp: u64,
        events: Vec<Event>,
        /// Everything at or below this checkpoint has been produced.
        watermark: Checkpoint,
    },
    /// The chain reorganized; everything above `ancestor` is invalid and
    /// the canonical replacement blocks follow as `Advance` messages.
    Reorg {
        chain_id: u64,
        ancestor: Checkpoint,
        ancestor_block: u64,
        depth: u64,
    },
    /// The finalized boundary moved.
    Finalized {
        chain_id: u64,
        checkpoint: Checkpoint,
    },
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub network: String,
    pub chain_id: u64,
    pub polling_interval_ms: u64,
    pub finality_depth: u64,
    pub max_concurrent_requests: usize,
    pub disable_cache: bool,
}

impl RealtimeConfig {
    pub fn from_network(name: &str, network: &NetworkConfig) -> Self {
        Self {
            network: name.to_string(),
            chain_id: network.chain_id,
            polling_interval_ms: network.polling_interval_ms,
            finality_depth: network.finality_depth,
            max_concurrent_requests: network.max_concurrent_requests as usize,
            disable_cache: network.disable_cache,
        }
    }
}

// ─── Local chain ─────────────────────────────────────────────────────────────

/// The sliding window of unfinalized blocks, oldest first. The front block
/// is the anchor (most recent finalized block) and is never removed.
pub struct LocalChain {
    window: VecDeque<Block>,
}

impl LocalChain {
    pub fn new(anchor: Block) -> Self {
        let mut window = VecDeque::new();
        window.push_back(anchor);
        Self { window }
    }

    pub fn head(&self) -> &Block {
        self.window.back().expect("window is never empty")
    }

    /// Window length; the anchor keeps it at one or more.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Append a block that extends the current head.
    pub fn push(&mut self, block: Block) -> Result<(), ()> {
        if !block.extends(self.head()) {
            return Err(());
        }
        self.window.push_back(block);
        Ok(())
    }

    /// Block number for a hash in the window, if present.
    pub fn number_of_hash(&self, hash: &str) -> Option<u64> {
        self.window
            .iter()
            .rev()
            .find(|b| b.hash == hash)
            .map(|b| b.number)
    }

    pub fn block_at(&self, number: u64) -> Option<&Block> {
        self.window.iter().find(|b| b.number == number)
    }

    /// Drop every block above `number` (reorg truncation).
    pub fn truncate_to(&mut self, number: u64) {
        while self.head().number > number && self.window.len() > 1 {
            self.window.pop_back();
        }
    }

    /// Remove and return blocks at or below `finalized`, always keeping
    /// the newest block as the next anchor.
    pub fn drain_finalized(&mut self, finalized: u64) -> Vec<Block> {
        let mut drained = Vec::new();
        while self.window.len() > 1 && self.window.front().expect("nonempty").number <= finalized {
            drained.push(self.window.pop_front().expect("nonempty"));
        }
        drained
    }

    /// Hashes currently in the window.
    fn hashes(&self) -> BTreeSet<String> {
        self.window.iter().map(|b| b.hash.clone()).collect()
    }
}

// ─── Realtime sync ───────────────────────────────────────────────────────────

pub struct RealtimeSync {
    config: RealtimeConfig,
    client: Arc<RpcClient>,
    cache: SyncCache,
    sources: SourceSet,
    chain: LocalChain,
    /// Per-block fetched data, held until the block finalizes (or reorgs
    /// away). Keyed by block hash.
    pending: HashMap<String, ChunkData>,
    tx: mpsc::Sender<ChainMessage>,
    shutdown: watch::Receiver<bool>,
}

impl RealtimeSync {
    pub fn new(
        config: RealtimeConfig,
        client: Arc<RpcClient>,
        cache: SyncCache,
        sources: SourceSet,
        anchor: Block,
        tx: mpsc::Sender<ChainMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            client,
            cache,
            sources,
            chain: LocalChain::new(anchor),
            pending: HashMap::new(),
            tx,
            shutdown,
        }
    }

    /// Poll until shutdown. Fatal errors (deep reorg, wrong chain) are
    /// returned; transient poll failures are logged and retried on the
    /// next tick.
    pub async fn run(mut self) -> Result<(), SyncError> {
        let reported = self.client.fetch_chain_id().await?;
        if reported != self.config.chain_id {
            return Err(SyncError::ChainIdMismatch {
                expected: self.config.chain_id,
                actual: reported,
            });
        }

        let poll = Duration::from_millis(self.config.polling_interval_ms.max(1));
        tracing::info!(
            network = self.config.network,
            anchor = self.chain.head().number,
            "realtime sync started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        tracing::info!(network = self.config.network, "realtime sync stopping");
                        return Ok(());
                    }
                    continue;
                }
            }

            match self.poll_once().await {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(SyncError::ChannelClosed) => return Ok(()),
                Err(e) => {
                    tracing::error!(
                        network = self.config.network,
                        error = %e,
                        "realtime poll failed, will retry"
                    );
                }
            }
        }
    }

    async fn poll_once(&mut self) -> Result<(), SyncError> {
        let latest = self.client.latest_block().await?;
        let head = self.chain.head().clone();
        if latest.hash == head.hash || latest.number < head.number {
            return Ok(());
        }

        // Walk from the new head back to a block we know. Every hop below
        // our head that fails to connect is reorg depth.
        let mut suffix: Vec<Block> = Vec::new();
        let mut cursor = latest;
        let ancestor_number = loop {
            if let Some(number) = self.chain.number_of_hash(&cursor.parent_hash) {
                suffix.push(cursor);
                break number;
            }
            if cursor.number <= 1
                || head.number.saturating_sub(cursor.number.saturating_sub(1))
                    >= self.config.finality_depth
            {
                return Err(SyncError::DeepReorg {
                    chain_id: self.config.chain_id,
                    depth: head.number.saturating_sub(cursor.number) + 1,
                });
            }
            let parent = self
                .client
                .get_block_by_hash(&cursor.parent_hash, false)
                .await?
                .map(|b| b.block)
                .ok_or_else(|| {
                    eventide_rpc::RpcError::Malformed(format!(
                        "node has no block for parent hash {}",
                        cursor.parent_hash
                    ))
                })?;
            suffix.push(cursor);
            cursor = parent;
        };
        suffix.reverse();

        if ancestor_number < head.number {
            let depth = head.number - ancestor_number;
            let ancestor = self
                .chain
                .block_at(ancestor_number)
                .expect("ancestor is in the window")
                .clone();
            tracing::warn!(
                network = self.config.network,
                ancestor = ancestor_number,
                depth,
                "reorg detected"
            );
            self.chain.truncate_to(ancestor_number);
            let live = self.chain.hashes();
            self.pending.retain(|hash, _| live.contains(hash));
            self.send(ChainMessage::Reorg {
                chain_id: self.config.chain_id,
                ancestor: block_end_checkpoint(
                    self.config.chain_id,
                    ancestor.timestamp,
                    ancestor.number,
                ),
                ancestor_block: ancestor.number,
                depth,
            })
            .await?;
        }

        let latest_number = suffix.last().expect("suffix is nonempty").number;
        for header in suffix {
            self.process_block(header).await?;
        }

        let finalized = latest_number.saturating_sub(self.config.finality_depth);
        self.flush_finalized(finalized).await?;
        Ok(())
    }

    /// Fetch one new canonical block's data, assemble its events, and
    /// announce it.
    async fn process_block(&mut self, header: Block) -> Result<(), SyncError> {
        let hydrated = self
            .client
            .get_block_by_hash(&header.hash, true)
            .await?
            .ok_or_else(|| {
                eventide_rpc::RpcError::Malformed(format!(
                    "node dropped block {} mid-poll",
                    header.hash
                ))
            })?;
        let block = hydrated.block;
        if self.chain.push(block.clone()).is_err() {
            // The node switched heads between our walk and this fetch; the
            // next poll re-walks from scratch.
            tracing::warn!(
                network = self.config.network,
                number = block.number,
                "block no longer extends the local chain, skipping"
            );
            return Ok(());
        }

        // Eagerly fetch everything live sources need, so handlers get
        // blocks, transactions, and receipts without extra round-trips.
        let addresses = self.sources.fetch_addresses();
        let mut logs = self
            .client
            .get_logs(
                block.number,
                block.number,
                addresses.as_deref().unwrap_or(&[]),
                &TopicFilter::default(),
            )
            .await?;
        // A racing reorg can answer with logs of a sibling block.
        logs.retain(|l| l.block_hash == block.hash);

        let traces = if self.sources.wants_traces() {
            self.client.trace_block(block.number).await?
        } else {
            vec![]
        };

        let mut keep_txs: BTreeSet<String> =
            logs.iter().map(|l| l.transaction_hash.clone()).collect();
        keep_txs.extend(traces.iter().map(|t| t.transaction_hash.clone()));
        let transactions: HashMap<String, Transaction> = hydrated
            .transactions
            .into_iter()
            .filter(|t| keep_txs.contains(&t.hash))
            .map(|t| (t.hash.clone(), t))
            .collect();

        let mut receipts: HashMap<String, TransactionReceipt> = HashMap::new();
        if self.sources.wants_receipts() {
            for hash in &keep_txs {
                if let Some(receipt) = self.client.get_transaction_receipt(hash).await? {
                    receipts.insert(hash.clone(), receipt);
                }
            }
        }

        let events =
            self.sources
                .assemble_block(&block, &transactions, &receipts, &logs, &traces);
        tracing::debug!(
            network = self.config.network,
            number = block.number,
            events = events.len(),
            "live block"
        );

        self.pending.insert(
            block.hash.clone(),
            ChunkData {
                blocks: vec![block.clone()],
                transactions: transactions.into_values().collect(),
                receipts: receipts.into_values().collect(),
                logs,
                traces,
            },
        );

        let watermark =
            block_end_checkpoint(self.config.chain_id, block.timestamp, block.number);
        self.send(ChainMessage::Advance {
            chain_id: self.config.chain_id,
            block_number: block.number,
            block_timestamp: block.timestamp,
            events,
            watermark,
        })
        .await
    }

    /// Persist blocks that fell below the finality boundary and drop them
    /// from the window.
    async fn flush_finalized(&mut self, finalized: u64) -> Result<(), SyncError> {
        let flushed = self.chain.drain_finalized(finalized);
        if flushed.is_empty() {
            return Ok(());
        }
        let range = BlockRange::new(
            flushed.first().expect("nonempty").number,
            flushed.last().expect("nonempty").number,
        );
        let last = flushed.last().expect("nonempty").clone();

        if !self.config.disable_cache {
            let mut data = ChunkData::default();
            for block in &flushed {
                match self.pending.remove(&block.hash) {
                    Some(chunk) => {
                        data.blocks.extend(chunk.blocks);
                        data.transactions.extend(chunk.transactions);
                        data.receipts.extend(chunk.receipts);
                        data.logs.extend(chunk.logs);
                        data.traces.extend(chunk.traces);
                    }
                    None => data.blocks.push(block.clone()),
                }
            }
            self.cache
                .write_chunk(self.config.chain_id, finalized, &data, None)
                .await?;
            // The per-block fetch covers every source's filter, so the
            // flushed range counts as fetched for each of them.
            for source in self.sources.sources() {
                if source.as_contract().is_none() {
                    continue;
                }
                let end = source.end_block.unwrap_or(u64::MAX);
                if range.end < source.start_block || range.start > end {
                    continue;
                }
                let clamped =
                    BlockRange::new(range.start.max(source.start_block), range.end.min(end));
                let fingerprint = source.fingerprint();
                self.cache
                    .insert_interval(self.config.chain_id, &fingerprint, clamped)
                    .await?;
                // One row per flush adds up; fold it into its neighbors.
                self.cache
                    .compact_intervals(self.config.chain_id, &fingerprint)
                    .await?;
            }
        } else {
            for block in &flushed {
                self.pending.remove(&block.hash);
            }
        }

        self.send(ChainMessage::Finalized {
            chain_id: self.config.chain_id,
            checkpoint: block_end_checkpoint(self.config.chain_id, last.timestamp, last.number),
        })
        .await
    }

    async fn send(&self, message: ChainMessage) -> Result<(), SyncError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> Block {
        Block {
            chain_id: 1,
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: number * 12,
        }
    }

    #[test]
    fn push_extends_head() {
        let mut chain = LocalChain::new(block(100, "0xa", "0x9"));
        chain.push(block(101, "0xb", "0xa")).unwrap();
        chain.push(block(102, "0xc", "0xb")).unwrap();
        assert_eq!(chain.head().number, 102);
        assert_eq!(chain.len(), 3);

        // Wrong parent hash is rejected.
        assert!(chain.push(block(103, "0xd", "0xzzz")).is_err());
        // Gaps are rejected.
        assert!(chain.push(block(105, "0xe", "0xc")).is_err());
    }

    #[test]
    fn truncate_to_drops_above() {
        let mut chain = LocalChain::new(block(100, "0xa", "0x9"));
        chain.push(block(101, "0xb", "0xa")).unwrap();
        chain.push(block(102, "0xc", "0xb")).unwrap();

        chain.truncate_to(100);
        assert_eq!(chain.head().number, 100);

        // A replacement suffix attaches cleanly.
        chain.push(block(101, "0xb2", "0xa")).unwrap();
        assert_eq!(chain.head().hash, "0xb2");
    }

    #[test]
    fn number_of_hash_finds_window_blocks() {
        let mut chain = LocalChain::new(block(100, "0xa", "0x9"));
        chain.push(block(101, "0xb", "0xa")).unwrap();
        assert_eq!(chain.number_of_hash("0xa"), Some(100));
        assert_eq!(chain.number_of_hash("0xb"), Some(101));
        assert_eq!(chain.number_of_hash("0xmissing"), None);
    }

    #[test]
    fn drain_finalized_keeps_anchor() {
        let mut chain = LocalChain::new(block(100, "0xa", "0x9"));
        for i in 101..=105 {
            let parent = if i == 101 { "0xa".to_string() } else { format!("0xh{}", i - 1) };
            chain.push(block(i, &format!("0xh{i}"), &parent)).unwrap();
        }

        let drained = chain.drain_finalized(103);
        assert_eq!(
            drained.iter().map(|b| b.number).collect::<Vec<_>>(),
            vec![100, 101, 102, 103]
        );
        assert_eq!(chain.len(), 2); // 104, 105 remain
        assert_eq!(chain.head().number, 105);

        // Draining beyond the head still keeps one block as the anchor.
        let drained = chain.drain_finalized(200);
        assert_eq!(drained.len(), 1);
        assert_eq!(chain.head().number, 105);
    }
}
