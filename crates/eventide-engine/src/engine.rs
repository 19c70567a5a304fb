//! The engine: wires instance registry, per-chain sync tasks, the
//! watermark merger, and the indexing runner into one run loop.
//!
//! Per chain, a task runs historical sync to the finalized tip and then
//! hands its source set to realtime sync; both feed an ordered per-chain
//! message lane. The run loop pulls lanes whose merge buffer has room
//! (full lanes exert backpressure on their producer), releases merged
//! events through the runner one at a time, and reacts to reorg and
//! finality messages with journal rollback and pruning.

use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use eventide_core::checkpoint::Checkpoint;
use eventide_core::config::{EngineConfig, NetworkConfig};
use eventide_core::event::Event;
use eventide_core::handler::{HandlerRegistry, JournaledStore};
use eventide_core::merger::WatermarkMerge;
use eventide_core::source::Source;
use eventide_core::status::{ChainStatus, InstanceStatus, StatusSnapshot};
use eventide_rpc::{RpcClient, RpcClientConfig};
use eventide_store::registry::{
    self, InstanceRegistry, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_TIMEOUT_SECS,
};
use eventide_store::{PgIndexingStore, SchemaDescription, StorageError, SyncCache};
use eventide_sync::historical::{HistoricalConfig, HistoricalSync};
use eventide_sync::realtime::{ChainMessage, RealtimeConfig, RealtimeSync};
use eventide_sync::{SourceSet, SyncError};

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::runner::Runner;

/// Control-plane messages outside the per-chain lanes.
enum Control {
    HeartbeatLost,
}

/// One message on a chain's lane, in per-chain order.
enum ChainFeed {
    HistoricalEvent(Event),
    HistoricalWatermark(Checkpoint),
    HistoricalDone {
        finalized_checkpoint: Checkpoint,
        cached_blocks: u64,
    },
    Realtime(ChainMessage),
    Failed(SyncError),
}

struct Lane {
    chain_id: u64,
    network: String,
    rx: mpsc::Receiver<ChainFeed>,
    open: bool,
}

enum Step {
    Lane(usize, Option<ChainFeed>),
    Ctrl(Option<Control>),
    /// `true` when the shutdown sender was dropped.
    Shutdown(bool),
    Tick,
}

/// Builder for [`Engine`] — every collaborator is explicit; there is no
/// process-global state.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    schema: Option<SchemaDescription>,
    handlers: Option<HandlerRegistry>,
    handler_fingerprint: String,
    pool: Option<PgPool>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn schema(mut self, schema: SchemaDescription) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    /// Hash of the user's handler source, part of the build id.
    pub fn handler_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.handler_fingerprint = fingerprint.into();
        self
    }

    /// Reuse an existing connection pool instead of opening one.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Result<Engine, EngineError> {
        let config = self.config.expect("EngineBuilder requires a config");
        let schema = self.schema.unwrap_or_default();
        schema.validate()?;
        // Validate source wiring up front.
        let sources = config.sources()?;
        let networks: Vec<String> = config.networks.keys().cloned().collect();
        Ok(Engine {
            config,
            schema,
            sources,
            handlers: self.handlers.unwrap_or_default(),
            handler_fingerprint: self.handler_fingerprint,
            pool: self.pool,
            metrics: Arc::new(EngineMetrics::new()),
            status: Arc::new(RwLock::new(StatusSnapshot::starting(networks))),
        })
    }
}

pub struct Engine {
    config: EngineConfig,
    schema: SchemaDescription,
    sources: Vec<Source>,
    handlers: HandlerRegistry,
    handler_fingerprint: String,
    pool: Option<PgPool>,
    metrics: Arc<EngineMetrics>,
    status: Arc<RwLock<StatusSnapshot>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Shared metrics handle for the HTTP layer (`/metrics`).
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Shared status handle for the HTTP layer (`/health`, `/ready`,
    /// `/status`). Clone before calling [`Engine::run`].
    pub fn status_handle(&self) -> Arc<RwLock<StatusSnapshot>> {
        Arc::clone(&self.status)
    }

    /// Run until the shutdown signal flips to `true` or a fatal error.
    ///
    /// Shutdown: chain tasks stop polling, in-flight work gets a five
    /// second drain deadline, the instance is flushed as `stopped`, and
    /// tables and views are left in place.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let pool = match &self.pool {
            Some(pool) => pool.clone(),
            None => {
                let url = self.config.database.resolve_connection_string()?;
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect(&url)
                    .await
                    .map_err(StorageError::from)?
            }
        };

        let cache = SyncCache::new(pool.clone());
        cache.migrate().await?;
        let instances = InstanceRegistry::new(
            pool.clone(),
            &self.config.database.schema,
            self.config.dev_mode,
        );
        instances.migrate().await?;

        let build_id = registry::build_id(
            &config_fingerprint(&self.config, &self.sources),
            &self.schema.fingerprint(),
            &self.handler_fingerprint,
        );
        let handle = instances.register(&build_id, &self.schema).await?;
        instances
            .create_tables(&handle.instance_id, &self.schema)
            .await?;

        let store = PgIndexingStore::new(
            pool.clone(),
            &self.config.database.schema,
            &handle.instance_id,
            &self.schema,
        );
        let handlers = std::mem::take(&mut self.handlers);
        let runner = Runner::new(handlers, store, handle.resume_checkpoint);

        let result = self
            .run_loop(
                &cache,
                &instances,
                &handle.instance_id,
                handle.resume_checkpoint,
                runner,
                shutdown,
            )
            .await;

        // Flush our terminal status; tables and views stay.
        if let Err(e) = instances
            .set_status(&handle.instance_id, InstanceStatus::Stopped)
            .await
        {
            tracing::warn!(error = %e, "failed to flush stopped status");
        }
        if let Ok(mut status) = self.status.write() {
            status.instance = InstanceStatus::Stopped;
            status.ready = false;
        }
        result
    }

    async fn run_loop(
        &self,
        cache: &SyncCache,
        instances: &InstanceRegistry,
        instance_id: &str,
        resume: Option<Checkpoint>,
        runner: Runner<PgIndexingStore>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        // Immediate cutover in dev mode; otherwise it happens when every
        // chain finishes its backfill.
        let mut cut_over = false;
        if self.config.dev_mode {
            instances.cutover(instance_id, &self.schema).await?;
            self.mark_ready();
            cut_over = true;
        }

        // One lane and one task per chain with sources.
        let mut lanes: Vec<Lane> = Vec::new();
        let mut chain_networks: HashMap<u64, String> = HashMap::new();
        let mut clients: Vec<(String, Arc<RpcClient>, u64)> = Vec::new();
        let mut tasks = Vec::new();
        let chain_count = self
            .sources
            .iter()
            .map(|s| s.chain_id)
            .collect::<HashSet<_>>()
            .len();
        let lane_capacity = (self.config.buffer_size / chain_count.max(1)).max(16);

        for (name, network) in &self.config.networks {
            let chain_sources: Vec<Source> = self
                .sources
                .iter()
                .filter(|s| s.chain_id == network.chain_id)
                .cloned()
                .collect();
            if chain_sources.is_empty() {
                continue;
            }
            let client = Arc::new(RpcClient::new(
                network.chain_id,
                RpcClientConfig::from_network(network)?,
            ));
            let (tx, rx) = mpsc::channel::<ChainFeed>(lane_capacity);
            lanes.push(Lane {
                chain_id: network.chain_id,
                network: name.clone(),
                rx,
                open: true,
            });
            chain_networks.insert(network.chain_id, name.clone());
            clients.push((name.clone(), Arc::clone(&client), 0));
            tasks.push(tokio::spawn(chain_task(
                name.clone(),
                network.clone(),
                chain_sources,
                client,
                cache.clone(),
                tx,
                shutdown.clone(),
            )));
        }

        // Nothing to index: the views can go live immediately.
        if lanes.is_empty() && !cut_over {
            instances.cutover(instance_id, &self.schema).await?;
            self.mark_ready();
            cut_over = true;
        }

        let (ctrl_tx, mut ctrl_rx) = mpsc::channel::<Control>(4);
        tasks.push(tokio::spawn(heartbeat_task(
            instances.clone(),
            instance_id.to_string(),
            ctrl_tx,
            shutdown.clone(),
        )));

        let mut merge = WatermarkMerge::new(lanes.iter().map(|l| l.chain_id));
        let mut historical_done: HashSet<u64> = HashSet::new();
        let mut finalized: HashMap<u64, Checkpoint> = HashMap::new();
        let mut committed = resume.unwrap_or(Checkpoint::ZERO);
        let idle_tick = Duration::from_secs(self.config.idle_timeout_secs.max(1));
        let per_chain_cap = lane_capacity;

        let result: Result<(), EngineError> = 'main: loop {
            // Deliver everything the merger releases, in order.
            for event in merge.drain_ready() {
                let checkpoint = event.checkpoint();
                match runner.process(&event).await {
                    Ok(true) => {
                        instances.set_checkpoint(instance_id, checkpoint).await?;
                        committed = checkpoint;
                        self.metrics.events_indexed.inc();
                        self.metrics
                            .checkpoint_timestamp
                            .set(checkpoint.block_timestamp as i64);
                        if let Some(network) = chain_networks.get(&event.chain_id()) {
                            self.update_chain_status(network, |s| {
                                s.block = checkpoint.block_number;
                                s.timestamp = checkpoint.block_timestamp;
                            });
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            checkpoint = %checkpoint,
                            error = %e,
                            "handler failed, stopping"
                        );
                        break 'main Err(e);
                    }
                }
            }

            // Pull the next message from a lane with merge-buffer room, so
            // a chain that is far ahead blocks its producer instead of
            // growing the buffer without bound.
            let step: Step = {
                let mut poll_lanes = Vec::new();
                let mut polls = Vec::new();
                for (idx, lane) in lanes.iter_mut().enumerate() {
                    if lane.open && merge.buffered_for(lane.chain_id) < per_chain_cap {
                        poll_lanes.push(idx);
                        polls.push(Box::pin(lane.rx.recv()));
                    }
                }
                let lane_recv = async {
                    if polls.is_empty() {
                        futures::future::pending::<(usize, Option<ChainFeed>)>().await
                    } else {
                        let (msg, which, _) = futures::future::select_all(polls).await;
                        (poll_lanes[which], msg)
                    }
                };
                tokio::select! {
                    (lane_idx, msg) = lane_recv => Step::Lane(lane_idx, msg),
                    ctrl = ctrl_rx.recv() => Step::Ctrl(ctrl),
                    changed = shutdown.changed() => Step::Shutdown(changed.is_err()),
                    _ = tokio::time::sleep(idle_tick) => Step::Tick,
                }
            };

            match step {
                Step::Lane(idx, None) => lanes[idx].open = false,
                Step::Lane(idx, Some(feed)) => {
                    let lane_chain = lanes[idx].chain_id;
                    let network = lanes[idx].network.clone();
                    match feed {
                        ChainFeed::HistoricalEvent(event) => merge.push(event),
                        ChainFeed::HistoricalWatermark(cp) => {
                            merge.advance_watermark(lane_chain, cp);
                        }
                        ChainFeed::HistoricalDone {
                            finalized_checkpoint,
                            cached_blocks,
                        } => {
                            self.metrics.cache_hits.inc_by(cached_blocks);
                            merge.advance_watermark(lane_chain, finalized_checkpoint);
                            finalized.insert(lane_chain, finalized_checkpoint);
                            historical_done.insert(lane_chain);
                            self.update_chain_status(&network, |s| s.is_realtime = true);
                            tracing::info!(network, "chain backfill complete, following tip");
                            if !cut_over && historical_done.len() == lanes.len() {
                                instances.cutover(instance_id, &self.schema).await?;
                                self.mark_ready();
                                cut_over = true;
                                let dropped = instances.gc().await?;
                                if dropped > 0 {
                                    tracing::info!(dropped, "stale instances collected");
                                }
                            }
                        }
                        ChainFeed::Realtime(ChainMessage::Advance {
                            chain_id,
                            block_number,
                            block_timestamp: _,
                            events,
                            watermark,
                        }) => {
                            for event in events {
                                merge.push(event);
                            }
                            merge.advance_watermark(chain_id, watermark);
                            let indexed = self
                                .chain_status(&network)
                                .map(|s| s.block)
                                .unwrap_or(0);
                            self.metrics
                                .sync_lag
                                .with_label_values(&[network.as_str()])
                                .set(block_number.saturating_sub(indexed) as i64);
                        }
                        ChainFeed::Realtime(ChainMessage::Reorg {
                            chain_id,
                            ancestor,
                            ancestor_block,
                            depth,
                        }) => {
                            tracing::warn!(
                                network,
                                ancestor = ancestor_block,
                                depth,
                                "rolling back to reorg ancestor"
                            );
                            merge.truncate_chain(chain_id, ancestor);
                            runner.store().rollback(ancestor).await?;
                            runner.lower_floor(ancestor);
                            if committed > ancestor {
                                committed = ancestor;
                                instances.set_checkpoint(instance_id, ancestor).await?;
                            }
                        }
                        ChainFeed::Realtime(ChainMessage::Finalized {
                            chain_id,
                            checkpoint,
                        }) => {
                            finalized.insert(chain_id, checkpoint);
                            // Journal rows at or below the lowest finalized
                            // checkpoint can never be rolled back.
                            if finalized.len() == lanes.len() {
                                if let Some(min) = finalized.values().min().copied() {
                                    runner.store().prune(min).await?;
                                }
                            }
                        }
                        ChainFeed::Failed(error) => {
                            break 'main Err(error.into());
                        }
                    }
                }
                Step::Ctrl(Some(Control::HeartbeatLost)) => {
                    break 'main Err(EngineError::HeartbeatLost);
                }
                Step::Ctrl(None) => {}
                // A dropped shutdown sender counts as a shutdown request.
                Step::Shutdown(sender_gone) => {
                    if sender_gone || *shutdown.borrow() {
                        tracing::info!("shutdown requested");
                        break 'main Ok(());
                    }
                }
                Step::Tick => {
                    // Periodic upkeep: refresh per-network request
                    // counters. Watermarks are retained per chain, so an
                    // idle chain already sits at its latest observed
                    // block and cannot stall the merger.
                    for (network, client, last) in clients.iter_mut() {
                        let total = client.request_count();
                        let delta = total.saturating_sub(*last);
                        if delta > 0 {
                            self.metrics
                                .rpc_requests
                                .with_label_values(&[network.as_str()])
                                .inc_by(delta);
                            *last = total;
                        }
                    }
                }
            }
        };

        // Give in-flight chain work a bounded drain, then cut it loose.
        let drain = futures::future::join_all(tasks.iter_mut());
        if tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .is_err()
        {
            for task in &tasks {
                task.abort();
            }
            tracing::warn!("chain tasks exceeded the drain deadline and were aborted");
        }
        result
    }

    fn mark_ready(&self) {
        if let Ok(mut status) = self.status.write() {
            status.ready = true;
            status.instance = InstanceStatus::Live;
        }
        self.metrics.ready.set(1);
    }

    fn chain_status(&self, network: &str) -> Option<ChainStatus> {
        self.status
            .read()
            .ok()
            .and_then(|s| s.chains.get(network).copied())
    }

    fn update_chain_status(&self, network: &str, f: impl FnOnce(&mut ChainStatus)) {
        if let Ok(mut status) = self.status.write() {
            if let Some(chain) = status.chains.get_mut(network) {
                f(chain);
            }
        }
    }
}

/// Deterministic configuration fingerprint: hashes sorted network and
/// source descriptions, never map iteration order.
fn config_fingerprint(config: &EngineConfig, sources: &[Source]) -> String {
    let mut hasher = Sha256::new();
    let mut networks: Vec<(&String, u64)> = config
        .networks
        .iter()
        .map(|(name, n)| (name, n.chain_id))
        .collect();
    networks.sort();
    for (name, chain_id) in networks {
        hasher.update(name.as_bytes());
        hasher.update(chain_id.to_be_bytes());
    }
    // `sources` is already sorted by name.
    for source in sources {
        hasher.update(source.name.as_bytes());
        hasher.update(source.fingerprint().as_bytes());
        hasher.update(source.start_block.to_be_bytes());
        hasher.update(source.end_block.unwrap_or(u64::MAX).to_be_bytes());
    }
    hasher.update(config.database.schema.as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-chain task: historical to the finalized tip, then realtime.
async fn chain_task(
    network: String,
    net_config: NetworkConfig,
    sources: Vec<Source>,
    client: Arc<RpcClient>,
    cache: SyncCache,
    feed: mpsc::Sender<ChainFeed>,
    shutdown: watch::Receiver<bool>,
) {
    if let Err(error) = run_chain(
        &network, net_config, sources, client, cache, &feed, shutdown,
    )
    .await
    {
        tracing::error!(network, error = %error, "chain sync failed");
        let _ = feed.send(ChainFeed::Failed(error)).await;
    }
}

async fn run_chain(
    network: &str,
    net_config: NetworkConfig,
    sources: Vec<Source>,
    client: Arc<RpcClient>,
    cache: SyncCache,
    feed: &mpsc::Sender<ChainFeed>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SyncError> {
    let chain_id = net_config.chain_id;
    let source_set = SourceSet::new(chain_id, sources);

    let (events_tx, mut events_rx) = mpsc::channel::<Event>(1_024);
    let (watermark_tx, mut watermark_rx) = watch::channel(Checkpoint::ZERO);
    let historical = HistoricalSync::new(
        HistoricalConfig::from_network(network, &net_config),
        Arc::clone(&client),
        cache.clone(),
        source_set,
        events_tx,
        watermark_tx,
    );

    let mut historical_run = pin!(historical.run());
    let outcome = loop {
        tokio::select! {
            result = &mut historical_run => {
                while let Ok(event) = events_rx.try_recv() {
                    send_feed(feed, ChainFeed::HistoricalEvent(event)).await?;
                }
                break result?;
            }
            Some(event) = events_rx.recv() => {
                send_feed(feed, ChainFeed::HistoricalEvent(event)).await?;
            }
            Ok(()) = watermark_rx.changed() => {
                let checkpoint = *watermark_rx.borrow_and_update();
                send_feed(feed, ChainFeed::HistoricalWatermark(checkpoint)).await?;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    };

    send_feed(
        feed,
        ChainFeed::HistoricalDone {
            finalized_checkpoint: outcome.finalized_checkpoint,
            cached_blocks: outcome.cached_blocks,
        },
    )
    .await?;

    let (realtime_tx, mut realtime_rx) = mpsc::channel::<ChainMessage>(256);
    let realtime = RealtimeSync::new(
        RealtimeConfig::from_network(network, &net_config),
        client,
        cache,
        outcome.sources,
        outcome.anchor,
        realtime_tx,
        shutdown.clone(),
    );

    let mut realtime_run = pin!(realtime.run());
    loop {
        tokio::select! {
            result = &mut realtime_run => {
                while let Ok(message) = realtime_rx.try_recv() {
                    send_feed(feed, ChainFeed::Realtime(message)).await?;
                }
                return result;
            }
            Some(message) = realtime_rx.recv() => {
                send_feed(feed, ChainFeed::Realtime(message)).await?;
            }
        }
    }
}

async fn send_feed(feed: &mpsc::Sender<ChainFeed>, message: ChainFeed) -> Result<(), SyncError> {
    feed.send(message)
        .await
        .map_err(|_| SyncError::ChannelClosed)
}

/// Writes the heartbeat every ten seconds; after a full staleness window
/// of consecutive failures the instance must assume it has been adopted
/// and ask for a restart.
async fn heartbeat_task(
    instances: InstanceRegistry,
    instance_id: String,
    ctrl: mpsc::Sender<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut misses: u64 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(HEARTBEAT_INTERVAL_SECS)) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
                continue;
            }
        }
        match instances.heartbeat(&instance_id).await {
            Ok(()) => misses = 0,
            Err(e) => {
                misses += 1;
                tracing::warn!(error = %e, misses, "heartbeat write failed");
                if misses * HEARTBEAT_INTERVAL_SECS >= HEARTBEAT_TIMEOUT_SECS as u64 {
                    let _ = ctrl.send(Control::HeartbeatLost).await;
                    return;
                }
            }
        }
    }
}
