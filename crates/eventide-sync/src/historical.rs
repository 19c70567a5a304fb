//! Historical (backfill) sync for one chain.
//!
//! Two passes. First, every source's missing block ranges — the configured
//! span minus what the cache's `intervals` already cover — are fetched in
//! adaptively sized chunks and committed to the sync cache, one chunk per
//! transaction. Second, the whole span is replayed from the cache in
//! ascending block order, assembling events and publishing a watermark so
//! the merger can release them.
//!
//! With `disable_cache` the first pass is skipped and the replay fetches
//! directly from the node.

use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use eventide_core::checkpoint::Checkpoint;
use eventide_core::config::NetworkConfig;
use eventide_core::event::{Block, CallTrace, Event, Log, Transaction, TransactionReceipt};
use eventide_core::ranges::{BlockRange, RangeSet};
use eventide_core::source::{AddressSpec, Source, TopicFilter};
use eventide_rpc::RpcClient;
use eventide_store::{ChunkData, SyncCache};

use crate::assemble::{block_end_checkpoint, SourceSet};
use crate::chunk::ChunkSizer;
use crate::error::SyncError;

/// Blocks per cache read batch during replay.
const REPLAY_BATCH: u64 = 1_000;
/// Chunk ceiling for sources that need per-block `trace_block` calls.
const TRACE_CHUNK_CEILING: u64 = 200;
/// How long a permanent RPC error may block a source's backfill before it
/// becomes fatal.
const PERMANENT_ERROR_GRACE: std::time::Duration = std::time::Duration::from_secs(300);
/// Pause between retries of a chunk that hit a permanent error.
const PERMANENT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct HistoricalConfig {
    pub network: String,
    pub chain_id: u64,
    pub finality_depth: u64,
    pub max_chunk_size: u64,
    pub max_concurrent_requests: usize,
    pub disable_cache: bool,
}

impl HistoricalConfig {
    pub fn from_network(name: &str, network: &NetworkConfig) -> Self {
        Self {
            network: name.to_string(),
            chain_id: network.chain_id,
            finality_depth: network.finality_depth,
            max_chunk_size: network.max_chunk_size,
            max_concurrent_requests: network.max_concurrent_requests as usize,
            disable_cache: network.disable_cache,
        }
    }
}

/// What the realtime phase needs to pick up where backfill stopped.
pub struct HistoricalOutcome {
    pub sources: SourceSet,
    pub finalized_block: u64,
    pub finalized_checkpoint: Checkpoint,
    /// Header of the finalized block, the realtime anchor.
    pub anchor: Block,
    /// Source-blocks already covered by cache intervals, summed over
    /// sources (feeds the cache-hit counter).
    pub cached_blocks: u64,
}

pub struct HistoricalSync {
    config: HistoricalConfig,
    client: Arc<RpcClient>,
    cache: SyncCache,
    sources: SourceSet,
    events_tx: mpsc::Sender<Event>,
    watermark_tx: watch::Sender<Checkpoint>,
}

impl HistoricalSync {
    pub fn new(
        config: HistoricalConfig,
        client: Arc<RpcClient>,
        cache: SyncCache,
        sources: SourceSet,
        events_tx: mpsc::Sender<Event>,
        watermark_tx: watch::Sender<Checkpoint>,
    ) -> Self {
        Self {
            config,
            client,
            cache,
            sources,
            events_tx,
            watermark_tx,
        }
    }

    /// Run the backfill to the chain's finalized tip.
    pub async fn run(mut self) -> Result<HistoricalOutcome, SyncError> {
        let chain_id = self.config.chain_id;
        let latest = self.client.block_number().await?;
        let finalized = latest.saturating_sub(self.config.finality_depth);

        tracing::info!(
            network = self.config.network,
            chain_id,
            latest,
            finalized,
            "starting historical sync"
        );

        let mut cached_blocks = 0u64;
        if !self.config.disable_cache {
            let sources: Vec<Source> = self.sources.sources().to_vec();
            let counts = futures::future::try_join_all(
                sources
                    .iter()
                    .map(|source| self.backfill_source(source, finalized)),
            )
            .await?;
            cached_blocks = counts.iter().sum();
        }

        if let Some(min_start) = self.sources.min_start_block() {
            if min_start <= finalized {
                self.replay(min_start, finalized).await?;
            }
        }

        // Anchor header: emits any still-pending setups and carries the
        // finalized checkpoint.
        let anchor = self
            .client
            .get_block_by_number(Some(finalized), false)
            .await?
            .map(|b| b.block)
            .ok_or_else(|| {
                eventide_rpc::RpcError::Malformed(format!(
                    "node returned null for finalized block {finalized}"
                ))
            })?;
        for event in self.sources.take_due_setups(&anchor) {
            self.send(event).await?;
        }

        let finalized_checkpoint = block_end_checkpoint(chain_id, anchor.timestamp, finalized);
        self.watermark_tx.send_replace(finalized_checkpoint);

        tracing::info!(
            network = self.config.network,
            finalized,
            "historical sync complete"
        );
        Ok(HistoricalOutcome {
            sources: self.sources,
            finalized_block: finalized,
            finalized_checkpoint,
            anchor,
            cached_blocks,
        })
    }

    async fn send(&self, event: Event) -> Result<(), SyncError> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }

    // ─── Pass 1: fill the cache ──────────────────────────────────────────

    /// Returns how many of the source's blocks were already cached.
    async fn backfill_source(&self, source: &Source, finalized: u64) -> Result<u64, SyncError> {
        let chain_id = self.config.chain_id;
        let target_end = source.end_block.unwrap_or(u64::MAX).min(finalized);
        if source.start_block > target_end {
            return Ok(0);
        }
        let target = BlockRange::new(source.start_block, target_end);
        let fingerprint = source.fingerprint();
        let cached = self.cache.get_interval(chain_id, &fingerprint).await?;
        let missing = cached.subtract_from(target);
        let missing_blocks: u64 = missing.iter().map(BlockRange::len).sum();
        let cached_blocks = target.len() - missing_blocks;
        if missing.is_empty() {
            tracing::debug!(source = source.name, "fully cached, nothing to fetch");
            return Ok(cached_blocks);
        }

        // A factory source's already-cached ranges contain the parent's
        // creation logs; seed the child set from them so later chunks
        // fetch child logs too.
        let mut children = self.seed_children(source, &cached, target).await?;

        let wants_traces = source
            .as_contract()
            .is_some_and(|c| c.include_call_traces);
        let ceiling = if wants_traces {
            self.config.max_chunk_size.min(TRACE_CHUNK_CEILING)
        } else {
            self.config.max_chunk_size
        };
        let mut sizer = ChunkSizer::new(ceiling);

        // Transient failures never reach this loop (the client retries
        // them internally); a permanent error gets a bounded grace window
        // before it takes the whole instance down.
        let mut blocked_since: Option<std::time::Instant> = None;
        for range in missing {
            let mut cursor = range.start;
            while cursor <= range.end {
                let end = range.end.min(cursor + sizer.size() - 1);
                let chunk = BlockRange::new(cursor, end);
                match self.fetch_chunk(source, chunk, &mut children).await {
                    Ok(data) => {
                        self.cache
                            .write_chunk(chain_id, finalized, &data, Some((&fingerprint, chunk)))
                            .await?;
                        sizer.record_success();
                        blocked_since = None;
                        tracing::debug!(
                            source = source.name,
                            from = chunk.start,
                            to = chunk.end,
                            logs = data.logs.len(),
                            "chunk cached"
                        );
                        cursor = end + 1;
                    }
                    Err(SyncError::Rpc(e)) if e.is_response_too_large() => {
                        if chunk.len() == 1 {
                            // A single block cannot be bisected further.
                            return Err(SyncError::Rpc(e));
                        }
                        sizer.record_too_large();
                        tracing::warn!(
                            source = source.name,
                            from = chunk.start,
                            to = chunk.end,
                            next_size = sizer.size(),
                            "response too large, bisecting chunk"
                        );
                    }
                    Err(SyncError::Rpc(e)) => {
                        let since = *blocked_since.get_or_insert_with(std::time::Instant::now);
                        if since.elapsed() >= PERMANENT_ERROR_GRACE {
                            tracing::error!(
                                source = source.name,
                                from = chunk.start,
                                error = %e,
                                "permanent rpc error blocked backfill past the grace window"
                            );
                            return Err(SyncError::Rpc(e));
                        }
                        tracing::warn!(
                            source = source.name,
                            from = chunk.start,
                            error = %e,
                            "permanent rpc error, retrying chunk"
                        );
                        tokio::time::sleep(PERMANENT_RETRY_DELAY).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.cache.compact_intervals(chain_id, &fingerprint).await?;
        Ok(cached_blocks)
    }

    /// Load cached parent creation logs so chunk fetches know every child
    /// discovered in previously synced ranges.
    async fn seed_children(
        &self,
        source: &Source,
        cached: &RangeSet,
        target: BlockRange,
    ) -> Result<BTreeMap<String, u64>, SyncError> {
        let mut children = BTreeMap::new();
        let Some(AddressSpec::Factory(factory)) = source.as_contract().map(|c| &c.address)
        else {
            return Ok(children);
        };
        if cached.is_empty() {
            return Ok(children);
        }
        let parent_logs = self
            .cache
            .get_logs(
                self.config.chain_id,
                target,
                std::slice::from_ref(&factory.address),
                &TopicFilter {
                    topics: vec![vec![factory.event_topic0.clone()]],
                },
            )
            .await?;
        for log in &parent_logs {
            if let Some(child) = factory.extract_child(log) {
                children.entry(child).or_insert(log.block_number + 1);
            }
        }
        Ok(children)
    }

    /// Fetch one chunk for one source: logs (two-phase for factories),
    /// enclosing blocks and transactions, receipts and traces on request.
    async fn fetch_chunk(
        &self,
        source: &Source,
        chunk: BlockRange,
        children: &mut BTreeMap<String, u64>,
    ) -> Result<ChunkData, SyncError> {
        let Some(contract) = source.as_contract() else {
            return self.fetch_block_source_chunk(source, chunk).await;
        };

        // Logs.
        let mut logs: Vec<Log> = Vec::new();
        match &contract.address {
            AddressSpec::Static(addrs) => {
                logs.extend(
                    self.client
                        .get_logs(chunk.start, chunk.end, addrs, &source.effective_topics())
                        .await?,
                );
            }
            AddressSpec::Factory(factory) => {
                let parent_logs = self
                    .client
                    .get_logs(
                        chunk.start,
                        chunk.end,
                        std::slice::from_ref(&factory.address),
                        &TopicFilter {
                            topics: vec![vec![factory.event_topic0.clone()]],
                        },
                    )
                    .await?;
                for log in &parent_logs {
                    if let Some(child) = factory.extract_child(log) {
                        children.entry(child).or_insert(log.block_number + 1);
                    }
                }
                // Creation logs are cached too: the replay pass rebuilds
                // the child set from them.
                logs.extend(parent_logs);
                if !children.is_empty() {
                    let child_addrs: Vec<String> = children.keys().cloned().collect();
                    logs.extend(
                        self.client
                            .get_logs(
                                chunk.start,
                                chunk.end,
                                &child_addrs,
                                &source.effective_topics(),
                            )
                            .await?,
                    );
                }
            }
        }

        // Call traces: one trace_block per chunk block, filtered to the
        // source's callee addresses.
        let mut traces: Vec<CallTrace> = Vec::new();
        if contract.include_call_traces {
            let numbers: Vec<u64> = (chunk.start..=chunk.end).collect();
            let fetched: Vec<Vec<CallTrace>> = stream::iter(numbers)
                .map(|n| {
                    let client = Arc::clone(&self.client);
                    async move { client.trace_block(n).await }
                })
                .buffer_unordered(self.config.max_concurrent_requests)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<Result<_, _>>()?;
            for block_traces in fetched {
                for trace in block_traces {
                    let callee_match = match &contract.address {
                        AddressSpec::Static(addrs) => {
                            addrs.is_empty()
                                || addrs
                                    .iter()
                                    .any(|a| a.eq_ignore_ascii_case(&trace.to))
                        }
                        AddressSpec::Factory(_) => {
                            children.contains_key(&trace.to.to_ascii_lowercase())
                        }
                    };
                    if callee_match {
                        traces.push(trace);
                    }
                }
            }
        }

        // Enclosing blocks (with transactions).
        let mut block_numbers: BTreeSet<u64> =
            logs.iter().map(|l| l.block_number).collect();
        block_numbers.extend(traces.iter().map(|t| t.block_number));
        let mut keep_txs: BTreeSet<String> =
            logs.iter().map(|l| l.transaction_hash.clone()).collect();
        keep_txs.extend(traces.iter().map(|t| t.transaction_hash.clone()));

        let fetched_blocks: Vec<Option<_>> = stream::iter(block_numbers)
            .map(|n| {
                let client = Arc::clone(&self.client);
                async move { client.get_block_by_number(Some(n), true).await }
            })
            .buffer_unordered(self.config.max_concurrent_requests)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        let mut blocks = Vec::new();
        let mut transactions: Vec<Transaction> = Vec::new();
        for fetched in fetched_blocks.into_iter().flatten() {
            transactions.extend(
                fetched
                    .transactions
                    .into_iter()
                    .filter(|t| keep_txs.contains(&t.hash)),
            );
            blocks.push(fetched.block);
        }

        // Receipts for the matched transactions.
        let mut receipts: Vec<TransactionReceipt> = Vec::new();
        if contract.include_transaction_receipts {
            let hashes: Vec<String> = keep_txs.iter().cloned().collect();
            let fetched: Vec<Option<TransactionReceipt>> = stream::iter(hashes)
                .map(|hash| {
                    let client = Arc::clone(&self.client);
                    async move { client.get_transaction_receipt(&hash).await }
                })
                .buffer_unordered(self.config.max_concurrent_requests)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<Result<_, _>>()?;
            receipts.extend(fetched.into_iter().flatten());
        }

        Ok(ChunkData {
            blocks,
            transactions,
            receipts,
            logs,
            traces,
        })
    }

    /// A block-interval source only needs headers at its interval points.
    async fn fetch_block_source_chunk(
        &self,
        source: &Source,
        chunk: BlockRange,
    ) -> Result<ChunkData, SyncError> {
        let Some(blocks_source) = source.as_blocks() else {
            return Ok(ChunkData::default());
        };
        let numbers = interval_points(source.start_block, blocks_source.interval, chunk);
        let fetched: Vec<Option<_>> = stream::iter(numbers)
            .map(|n| {
                let client = Arc::clone(&self.client);
                async move { client.get_block_by_number(Some(n), false).await }
            })
            .buffer_unordered(self.config.max_concurrent_requests)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;
        Ok(ChunkData {
            blocks: fetched.into_iter().flatten().map(|b| b.block).collect(),
            ..Default::default()
        })
    }

    // ─── Pass 2: replay from the cache ───────────────────────────────────

    async fn replay(&mut self, from: u64, to: u64) -> Result<(), SyncError> {
        let chain_id = self.config.chain_id;
        let mut last_timestamp = 0u64;
        let mut cursor = from;
        let mut emitted = 0u64;

        while cursor <= to {
            let end = to.min(cursor + REPLAY_BATCH - 1);
            let window = BlockRange::new(cursor, end);

            let (blocks, logs, traces, transactions, receipts) = if self.config.disable_cache {
                self.fetch_window_direct(window).await?
            } else {
                let blocks = self.cache.get_blocks(chain_id, window).await?;
                let logs = self
                    .cache
                    .get_logs(chain_id, window, &[], &TopicFilter::default())
                    .await?;
                let traces = if self.sources.wants_traces() {
                    self.cache.get_traces(chain_id, window, &[]).await?
                } else {
                    vec![]
                };
                let mut hashes: BTreeSet<String> =
                    logs.iter().map(|l| l.transaction_hash.clone()).collect();
                hashes.extend(traces.iter().map(|t| t.transaction_hash.clone()));
                let hashes: Vec<String> = hashes.into_iter().collect();
                let transactions: HashMap<String, Transaction> = self
                    .cache
                    .get_transactions(chain_id, &hashes)
                    .await?
                    .into_iter()
                    .map(|t| (t.hash.clone(), t))
                    .collect();
                let receipts: HashMap<String, TransactionReceipt> =
                    if self.sources.wants_receipts() {
                        self.cache
                            .get_receipts(chain_id, &hashes)
                            .await?
                            .into_iter()
                            .map(|r| (r.transaction_hash.clone(), r))
                            .collect()
                    } else {
                        HashMap::new()
                    };
                (blocks, logs, traces, transactions, receipts)
            };

            let mut logs_by_block: BTreeMap<u64, Vec<Log>> = BTreeMap::new();
            for log in logs {
                logs_by_block.entry(log.block_number).or_default().push(log);
            }
            let mut traces_by_block: BTreeMap<u64, Vec<CallTrace>> = BTreeMap::new();
            for trace in traces {
                traces_by_block
                    .entry(trace.block_number)
                    .or_default()
                    .push(trace);
            }

            for block in blocks {
                let block_logs = logs_by_block.remove(&block.number).unwrap_or_default();
                let block_traces = traces_by_block.remove(&block.number).unwrap_or_default();
                let events = self.sources.assemble_block(
                    &block,
                    &transactions,
                    &receipts,
                    &block_logs,
                    &block_traces,
                );
                emitted += events.len() as u64;
                for event in events {
                    self.send(event).await?;
                }
                last_timestamp = block.timestamp;
            }

            self.watermark_tx
                .send_replace(block_end_checkpoint(chain_id, last_timestamp, end));
            tracing::debug!(
                network = self.config.network,
                from = window.start,
                to = window.end,
                target = to,
                emitted,
                "replay window complete"
            );
            cursor = end + 1;
        }
        Ok(())
    }

    /// Replay source for cache-bypassing chains: fetch the window straight
    /// from the node.
    #[allow(clippy::type_complexity)]
    async fn fetch_window_direct(
        &self,
        window: BlockRange,
    ) -> Result<
        (
            Vec<Block>,
            Vec<Log>,
            Vec<CallTrace>,
            HashMap<String, Transaction>,
            HashMap<String, TransactionReceipt>,
        ),
        SyncError,
    > {
        let addresses = self.sources.fetch_addresses();
        let logs = self
            .client
            .get_logs(
                window.start,
                window.end,
                addresses.as_deref().unwrap_or(&[]),
                &TopicFilter::default(),
            )
            .await?;

        let mut traces: Vec<CallTrace> = Vec::new();
        if self.sources.wants_traces() {
            let numbers: Vec<u64> = (window.start..=window.end).collect();
            let fetched: Vec<Vec<CallTrace>> = stream::iter(numbers)
                .map(|n| {
                    let client = Arc::clone(&self.client);
                    async move { client.trace_block(n).await }
                })
                .buffer_unordered(self.config.max_concurrent_requests)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<Result<_, _>>()?;
            traces.extend(fetched.into_iter().flatten());
        }

        let mut numbers: BTreeSet<u64> = logs.iter().map(|l| l.block_number).collect();
        numbers.extend(traces.iter().map(|t| t.block_number));
        for source in self.sources.sources() {
            if let Some(blocks_source) = source.as_blocks() {
                numbers.extend(interval_points(
                    source.start_block,
                    blocks_source.interval,
                    window,
                ));
            }
        }

        let fetched: Vec<Option<_>> = stream::iter(numbers)
            .map(|n| {
                let client = Arc::clone(&self.client);
                async move { client.get_block_by_number(Some(n), true).await }
            })
            .buffer_unordered(self.config.max_concurrent_requests)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        let mut keep_txs: BTreeSet<String> =
            logs.iter().map(|l| l.transaction_hash.clone()).collect();
        keep_txs.extend(traces.iter().map(|t| t.transaction_hash.clone()));

        let mut blocks = Vec::new();
        let mut transactions = HashMap::new();
        for fetched_block in fetched.into_iter().flatten() {
            for tx in fetched_block.transactions {
                if keep_txs.contains(&tx.hash) {
                    transactions.insert(tx.hash.clone(), tx);
                }
            }
            blocks.push(fetched_block.block);
        }
        // buffer_unordered returns completion order; replay needs ascending.
        blocks.sort_by_key(|b| b.number);

        let mut receipts = HashMap::new();
        if self.sources.wants_receipts() {
            let hashes: Vec<String> = keep_txs.into_iter().collect();
            let fetched: Vec<Option<TransactionReceipt>> = stream::iter(hashes)
                .map(|hash| {
                    let client = Arc::clone(&self.client);
                    async move { client.get_transaction_receipt(&hash).await }
                })
                .buffer_unordered(self.config.max_concurrent_requests)
                .collect::<Vec<_>>()
                .await
                .into_iter()
                .collect::<Result<_, _>>()?;
            for receipt in fetched.into_iter().flatten() {
                receipts.insert(receipt.transaction_hash.clone(), receipt);
            }
        }

        Ok((blocks, logs, traces, transactions, receipts))
    }
}

/// Block numbers inside `range` that sit on the source's interval grid.
fn interval_points(start_block: u64, interval: u64, range: BlockRange) -> Vec<u64> {
    let interval = interval.max(1);
    let first = if range.start <= start_block {
        start_block
    } else {
        let offset = (range.start - start_block) % interval;
        if offset == 0 {
            range.start
        } else {
            range.start + (interval - offset)
        }
    };
    (first..=range.end)
        .step_by(interval as usize)
        .filter(|n| *n >= start_block)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_points_align_to_start_block() {
        assert_eq!(
            interval_points(100, 10, BlockRange::new(100, 135)),
            vec![100, 110, 120, 130]
        );
        assert_eq!(
            interval_points(100, 10, BlockRange::new(115, 135)),
            vec![120, 130]
        );
        // Range entirely before the start block.
        assert_eq!(interval_points(100, 10, BlockRange::new(50, 90)), Vec::<u64>::new());
        // Interval of one fires on every block.
        assert_eq!(
            interval_points(5, 1, BlockRange::new(7, 9)),
            vec![7, 8, 9]
        );
    }
}
