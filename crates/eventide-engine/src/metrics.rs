//! Prometheus metric families, rendered by the outer HTTP layer at
//! `/metrics`.

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub struct EngineMetrics {
    registry: Registry,
    /// Events delivered to handlers.
    pub events_indexed: IntCounter,
    /// JSON-RPC requests sent, per network (includes retries).
    pub rpc_requests: IntCounterVec,
    /// Source-blocks the backfill answered from the cache without
    /// fetching.
    pub cache_hits: IntCounter,
    /// Committed checkpoint's block timestamp.
    pub checkpoint_timestamp: IntGauge,
    /// Head-minus-indexed lag in blocks, per network.
    pub sync_lag: IntGaugeVec,
    /// 1 once the instance is live.
    pub ready: IntGauge,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_indexed = IntCounter::with_opts(Opts::new(
            "eventide_events_indexed_total",
            "Events delivered to user handlers",
        ))
        .expect("valid metric");
        let rpc_requests = IntCounterVec::new(
            Opts::new("eventide_rpc_requests_total", "JSON-RPC requests sent"),
            &["network"],
        )
        .expect("valid metric");
        let cache_hits = IntCounter::with_opts(Opts::new(
            "eventide_cache_hits_total",
            "Historical ranges served from the sync cache",
        ))
        .expect("valid metric");
        let checkpoint_timestamp = IntGauge::with_opts(Opts::new(
            "eventide_checkpoint_timestamp_seconds",
            "Block timestamp of the committed checkpoint",
        ))
        .expect("valid metric");
        let sync_lag = IntGaugeVec::new(
            Opts::new("eventide_sync_lag_blocks", "Chain head minus indexed block"),
            &["network"],
        )
        .expect("valid metric");
        let ready = IntGauge::with_opts(Opts::new(
            "eventide_ready",
            "1 once the live view cutover has happened",
        ))
        .expect("valid metric");

        for collector in [
            Box::new(events_indexed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(rpc_requests.clone()),
            Box::new(cache_hits.clone()),
            Box::new(checkpoint_timestamp.clone()),
            Box::new(sync_lag.clone()),
            Box::new(ready.clone()),
        ] {
            registry.register(collector).expect("unique metric");
        }

        Self {
            registry,
            events_indexed,
            rpc_requests,
            cache_hits,
            checkpoint_timestamp,
            sync_lag,
            ready,
        }
    }

    /// The registry the HTTP layer gathers from.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
