//! The shared sync cache (`sync` schema).
//!
//! Content-addressed, append-mostly chain data: blocks, transactions,
//! receipts, logs, call traces, cached RPC results, and the fetched-range
//! bookkeeping (`intervals`). Every write is `INSERT … ON CONFLICT DO
//! NOTHING`, so concurrent instances converge without row locking. Only
//! finalized rows are accepted: the cache refuses anything above the
//! caller's finalized height.

use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};

use eventide_core::event::{Block, CallTrace, Log, Transaction as Tx, TransactionReceipt};
use eventide_core::ranges::{BlockRange, RangeSet};
use eventide_core::source::TopicFilter;

use crate::error::StorageError;

/// Everything one historical chunk (or one realtime block) writes.
#[derive(Debug, Clone, Default)]
pub struct ChunkData {
    pub blocks: Vec<Block>,
    pub transactions: Vec<Tx>,
    pub receipts: Vec<TransactionReceipt>,
    pub logs: Vec<Log>,
    pub traces: Vec<CallTrace>,
}

impl ChunkData {
    /// Highest block number referenced by any row, for the finality guard.
    fn max_block(&self) -> Option<u64> {
        let mut max = None;
        let mut consider = |n: u64| max = Some(max.map_or(n, |m: u64| m.max(n)));
        self.blocks.iter().for_each(|b| consider(b.number));
        self.transactions.iter().for_each(|t| consider(t.block_number));
        self.receipts.iter().for_each(|r| consider(r.block_number));
        self.logs.iter().for_each(|l| consider(l.block_number));
        self.traces.iter().for_each(|t| consider(t.block_number));
        max
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.transactions.is_empty()
            && self.receipts.is_empty()
            && self.logs.is_empty()
            && self.traces.is_empty()
    }
}

/// Handle to the shared `sync` schema.
#[derive(Clone)]
pub struct SyncCache {
    pool: PgPool,
}

impl SyncCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `sync` schema and its tables if missing. Safe to run
    /// from every instance concurrently.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        let statements = [
            "CREATE SCHEMA IF NOT EXISTS sync",
            "CREATE TABLE IF NOT EXISTS sync.blocks (
                chain_id     BIGINT NOT NULL,
                hash         TEXT   NOT NULL,
                number       BIGINT NOT NULL,
                parent_hash  TEXT   NOT NULL,
                timestamp    BIGINT NOT NULL,
                PRIMARY KEY (chain_id, hash)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_blocks_number
             ON sync.blocks (chain_id, number)",
            "CREATE TABLE IF NOT EXISTS sync.transactions (
                chain_id          BIGINT NOT NULL,
                hash              TEXT   NOT NULL,
                block_hash        TEXT   NOT NULL,
                block_number      BIGINT NOT NULL,
                transaction_index INTEGER NOT NULL,
                from_address      TEXT   NOT NULL,
                to_address        TEXT,
                value             TEXT   NOT NULL,
                input             TEXT   NOT NULL,
                PRIMARY KEY (chain_id, hash)
            )",
            "CREATE TABLE IF NOT EXISTS sync.transaction_receipts (
                chain_id         BIGINT NOT NULL,
                transaction_hash TEXT   NOT NULL,
                block_number     BIGINT NOT NULL,
                status           BIGINT NOT NULL,
                gas_used         BIGINT NOT NULL,
                contract_address TEXT,
                PRIMARY KEY (chain_id, transaction_hash)
            )",
            "CREATE TABLE IF NOT EXISTS sync.logs (
                chain_id          BIGINT NOT NULL,
                block_hash        TEXT   NOT NULL,
                log_index         INTEGER NOT NULL,
                block_number      BIGINT NOT NULL,
                address           TEXT   NOT NULL,
                topic0            TEXT,
                topic1            TEXT,
                topic2            TEXT,
                topic3            TEXT,
                data              TEXT   NOT NULL,
                transaction_hash  TEXT   NOT NULL,
                transaction_index INTEGER NOT NULL,
                PRIMARY KEY (chain_id, block_hash, log_index)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_logs_lookup
             ON sync.logs (chain_id, block_number, address, topic0)",
            "CREATE TABLE IF NOT EXISTS sync.traces (
                chain_id          BIGINT NOT NULL,
                transaction_hash  TEXT   NOT NULL,
                trace_index       INTEGER NOT NULL,
                block_number      BIGINT NOT NULL,
                transaction_index INTEGER NOT NULL,
                from_address      TEXT   NOT NULL,
                to_address        TEXT   NOT NULL,
                input             TEXT   NOT NULL,
                output            TEXT,
                value             TEXT   NOT NULL,
                PRIMARY KEY (chain_id, transaction_hash, trace_index)
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_traces_lookup
             ON sync.traces (chain_id, block_number, to_address)",
            "CREATE TABLE IF NOT EXISTS sync.rpc_request_results (
                chain_id     BIGINT NOT NULL,
                request_hash TEXT   NOT NULL,
                result       JSONB  NOT NULL,
                PRIMARY KEY (chain_id, request_hash)
            )",
            "CREATE TABLE IF NOT EXISTS sync.intervals (
                chain_id    BIGINT NOT NULL,
                fingerprint TEXT   NOT NULL,
                start_block BIGINT NOT NULL,
                end_block   BIGINT NOT NULL,
                PRIMARY KEY (chain_id, fingerprint, start_block)
            )",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        tracing::debug!("sync cache schema ready");
        Ok(())
    }

    /// Write one fetched chunk atomically: chain rows first, then the
    /// interval row. A failure rolls everything back, leaving `intervals`
    /// untouched so the chunk is replanned.
    pub async fn write_chunk(
        &self,
        chain_id: u64,
        finalized: u64,
        data: &ChunkData,
        interval: Option<(&str, BlockRange)>,
    ) -> Result<(), StorageError> {
        if let Some(max) = data.max_block() {
            if max > finalized {
                return Err(StorageError::AboveFinalized {
                    chain_id,
                    block: max,
                    finalized,
                });
            }
        }
        if let Some((_, range)) = &interval {
            if range.end > finalized {
                return Err(StorageError::AboveFinalized {
                    chain_id,
                    block: range.end,
                    finalized,
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        insert_blocks(&mut tx, chain_id, &data.blocks).await?;
        insert_transactions(&mut tx, chain_id, &data.transactions).await?;
        insert_receipts(&mut tx, chain_id, &data.receipts).await?;
        insert_logs(&mut tx, chain_id, &data.logs).await?;
        insert_traces(&mut tx, chain_id, &data.traces).await?;
        if let Some((fingerprint, range)) = interval {
            sqlx::query(
                "INSERT INTO sync.intervals (chain_id, fingerprint, start_block, end_block)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (chain_id, fingerprint, start_block) DO NOTHING",
            )
            .bind(chain_id as i64)
            .bind(fingerprint)
            .bind(range.start as i64)
            .bind(range.end as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    // ─── Queries ─────────────────────────────────────────────────────────

    pub async fn get_blocks(
        &self,
        chain_id: u64,
        range: BlockRange,
    ) -> Result<Vec<Block>, StorageError> {
        let rows = sqlx::query(
            "SELECT number, hash, parent_hash, timestamp FROM sync.blocks
             WHERE chain_id = $1 AND number BETWEEN $2 AND $3
             ORDER BY number",
        )
        .bind(chain_id as i64)
        .bind(range.start as i64)
        .bind(range.end as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Block {
                chain_id,
                number: r.get::<i64, _>("number") as u64,
                hash: r.get("hash"),
                parent_hash: r.get("parent_hash"),
                timestamp: r.get::<i64, _>("timestamp") as u64,
            })
            .collect())
    }

    /// Logs in a range matching an address set (empty = all) and a
    /// positional topic filter, ordered `(block_number, log_index)`.
    pub async fn get_logs(
        &self,
        chain_id: u64,
        range: BlockRange,
        addresses: &[String],
        topics: &TopicFilter,
    ) -> Result<Vec<Log>, StorageError> {
        let mut sql = String::from(
            "SELECT block_hash, log_index, block_number, address,
                    topic0, topic1, topic2, topic3, data,
                    transaction_hash, transaction_index
             FROM sync.logs
             WHERE chain_id = $1 AND block_number BETWEEN $2 AND $3",
        );
        let mut binds: Vec<Vec<String>> = Vec::new();
        if !addresses.is_empty() {
            binds.push(addresses.iter().map(|a| a.to_ascii_lowercase()).collect());
            sql.push_str(&format!(" AND lower(address) = ANY(${})", 3 + binds.len()));
        }
        for (slot, accepted) in topics.topics.iter().enumerate().take(4) {
            if !accepted.is_empty() {
                binds.push(accepted.iter().map(|t| t.to_ascii_lowercase()).collect());
                sql.push_str(&format!(
                    " AND lower(topic{slot}) = ANY(${})",
                    3 + binds.len()
                ));
            }
        }
        sql.push_str(" ORDER BY block_number, log_index");

        let mut query = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(range.start as i64)
            .bind(range.end as i64);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|r| {
                let topics = [
                    r.get::<Option<String>, _>("topic0"),
                    r.get::<Option<String>, _>("topic1"),
                    r.get::<Option<String>, _>("topic2"),
                    r.get::<Option<String>, _>("topic3"),
                ];
                Log {
                    address: r.get("address"),
                    topics: topics.into_iter().flatten().collect(),
                    data: r.get("data"),
                    block_number: r.get::<i64, _>("block_number") as u64,
                    block_hash: r.get("block_hash"),
                    transaction_hash: r.get("transaction_hash"),
                    transaction_index: r.get::<i32, _>("transaction_index") as u32,
                    log_index: r.get::<i32, _>("log_index") as u32,
                }
            })
            .collect())
    }

    /// Call traces in a range, filtered by callee address (empty = all).
    pub async fn get_traces(
        &self,
        chain_id: u64,
        range: BlockRange,
        to_addresses: &[String],
    ) -> Result<Vec<CallTrace>, StorageError> {
        let mut sql = String::from(
            "SELECT transaction_hash, trace_index, block_number, transaction_index,
                    from_address, to_address, input, output, value
             FROM sync.traces
             WHERE chain_id = $1 AND block_number BETWEEN $2 AND $3",
        );
        if !to_addresses.is_empty() {
            sql.push_str(" AND lower(to_address) = ANY($4)");
        }
        sql.push_str(" ORDER BY block_number, transaction_index, trace_index");

        let mut query = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(range.start as i64)
            .bind(range.end as i64);
        if !to_addresses.is_empty() {
            let lowered: Vec<String> =
                to_addresses.iter().map(|a| a.to_ascii_lowercase()).collect();
            query = query.bind(lowered);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|r| CallTrace {
                from: r.get("from_address"),
                to: r.get("to_address"),
                input: r.get("input"),
                output: r.get("output"),
                value: r.get("value"),
                block_number: r.get::<i64, _>("block_number") as u64,
                transaction_hash: r.get("transaction_hash"),
                transaction_index: r.get::<i32, _>("transaction_index") as u32,
                trace_index: r.get::<i32, _>("trace_index") as u32,
            })
            .collect())
    }

    pub async fn get_transactions(
        &self,
        chain_id: u64,
        hashes: &[String],
    ) -> Result<Vec<Tx>, StorageError> {
        if hashes.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            "SELECT hash, block_hash, block_number, transaction_index,
                    from_address, to_address, value, input
             FROM sync.transactions
             WHERE chain_id = $1 AND hash = ANY($2)",
        )
        .bind(chain_id as i64)
        .bind(hashes.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Tx {
                hash: r.get("hash"),
                block_hash: r.get("block_hash"),
                block_number: r.get::<i64, _>("block_number") as u64,
                transaction_index: r.get::<i32, _>("transaction_index") as u32,
                from: r.get("from_address"),
                to: r.get("to_address"),
                value: r.get("value"),
                input: r.get("input"),
            })
            .collect())
    }

    pub async fn get_receipts(
        &self,
        chain_id: u64,
        hashes: &[String],
    ) -> Result<Vec<TransactionReceipt>, StorageError> {
        if hashes.is_empty() {
            return Ok(vec![]);
        }
        let rows = sqlx::query(
            "SELECT transaction_hash, block_number, status, gas_used, contract_address
             FROM sync.transaction_receipts
             WHERE chain_id = $1 AND transaction_hash = ANY($2)",
        )
        .bind(chain_id as i64)
        .bind(hashes.to_vec())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| TransactionReceipt {
                transaction_hash: r.get("transaction_hash"),
                block_number: r.get::<i64, _>("block_number") as u64,
                status: r.get::<i64, _>("status") as u64,
                gas_used: r.get::<i64, _>("gas_used") as u64,
                contract_address: r.get("contract_address"),
            })
            .collect())
    }

    // ─── Intervals ───────────────────────────────────────────────────────

    pub async fn get_interval(
        &self,
        chain_id: u64,
        fingerprint: &str,
    ) -> Result<RangeSet, StorageError> {
        let rows = sqlx::query(
            "SELECT start_block, end_block FROM sync.intervals
             WHERE chain_id = $1 AND fingerprint = $2
             ORDER BY start_block",
        )
        .bind(chain_id as i64)
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;

        Ok(RangeSet::from_ranges(rows.iter().map(|r| {
            (
                r.get::<i64, _>("start_block") as u64,
                r.get::<i64, _>("end_block") as u64,
            )
        })))
    }

    /// Record a fetched range outside of a chunk write (used when the
    /// realtime sync flushes finalized blocks it already holds).
    pub async fn insert_interval(
        &self,
        chain_id: u64,
        fingerprint: &str,
        range: BlockRange,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync.intervals (chain_id, fingerprint, start_block, end_block)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (chain_id, fingerprint, start_block) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(fingerprint)
        .bind(range.start as i64)
        .bind(range.end as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Collapse adjoining interval rows for one fingerprint into the
    /// minimal row set. Run periodically; writers only ever append.
    pub async fn compact_intervals(
        &self,
        chain_id: u64,
        fingerprint: &str,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            "SELECT start_block, end_block FROM sync.intervals
             WHERE chain_id = $1 AND fingerprint = $2
             ORDER BY start_block
             FOR UPDATE",
        )
        .bind(chain_id as i64)
        .bind(fingerprint)
        .fetch_all(&mut *tx)
        .await?;
        if rows.len() <= 1 {
            return Ok(());
        }

        let merged = RangeSet::from_ranges(rows.iter().map(|r| {
            (
                r.get::<i64, _>("start_block") as u64,
                r.get::<i64, _>("end_block") as u64,
            )
        }));
        if merged.len() == rows.len() {
            return Ok(());
        }

        sqlx::query("DELETE FROM sync.intervals WHERE chain_id = $1 AND fingerprint = $2")
            .bind(chain_id as i64)
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        for range in merged.iter() {
            sqlx::query(
                "INSERT INTO sync.intervals (chain_id, fingerprint, start_block, end_block)
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(chain_id as i64)
            .bind(fingerprint)
            .bind(range.start as i64)
            .bind(range.end as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        tracing::debug!(chain_id, fingerprint, rows = merged.len(), "intervals compacted");
        Ok(())
    }

    // ─── Cached RPC results ──────────────────────────────────────────────

    pub async fn rpc_result_get(
        &self,
        chain_id: u64,
        request_hash: &str,
    ) -> Result<Option<Value>, StorageError> {
        let row = sqlx::query(
            "SELECT result FROM sync.rpc_request_results
             WHERE chain_id = $1 AND request_hash = $2",
        )
        .bind(chain_id as i64)
        .bind(request_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("result")))
    }

    pub async fn rpc_result_put(
        &self,
        chain_id: u64,
        request_hash: &str,
        result: &Value,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sync.rpc_request_results (chain_id, request_hash, result)
             VALUES ($1, $2, $3)
             ON CONFLICT (chain_id, request_hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(request_hash)
        .bind(result)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Deterministic key for the RPC result cache.
pub fn request_hash(method: &str, params: &Value) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(params.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

// ─── Batch inserts ────────────────────────────────────────────────────────────

async fn insert_blocks(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: u64,
    blocks: &[Block],
) -> Result<(), StorageError> {
    for block in blocks {
        sqlx::query(
            "INSERT INTO sync.blocks (chain_id, hash, number, parent_hash, timestamp)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (chain_id, hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&block.hash)
        .bind(block.number as i64)
        .bind(&block.parent_hash)
        .bind(block.timestamp as i64)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_transactions(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: u64,
    transactions: &[Tx],
) -> Result<(), StorageError> {
    for t in transactions {
        sqlx::query(
            "INSERT INTO sync.transactions
                (chain_id, hash, block_hash, block_number, transaction_index,
                 from_address, to_address, value, input)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (chain_id, hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&t.hash)
        .bind(&t.block_hash)
        .bind(t.block_number as i64)
        .bind(t.transaction_index as i32)
        .bind(&t.from)
        .bind(&t.to)
        .bind(&t.value)
        .bind(&t.input)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_receipts(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: u64,
    receipts: &[TransactionReceipt],
) -> Result<(), StorageError> {
    for r in receipts {
        sqlx::query(
            "INSERT INTO sync.transaction_receipts
                (chain_id, transaction_hash, block_number, status, gas_used, contract_address)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (chain_id, transaction_hash) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&r.transaction_hash)
        .bind(r.block_number as i64)
        .bind(r.status as i64)
        .bind(r.gas_used as i64)
        .bind(&r.contract_address)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_logs(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: u64,
    logs: &[Log],
) -> Result<(), StorageError> {
    for log in logs {
        let topic = |i: usize| log.topics.get(i).cloned();
        sqlx::query(
            "INSERT INTO sync.logs
                (chain_id, block_hash, log_index, block_number, address,
                 topic0, topic1, topic2, topic3, data, transaction_hash, transaction_index)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (chain_id, block_hash, log_index) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&log.block_hash)
        .bind(log.log_index as i32)
        .bind(log.block_number as i64)
        .bind(&log.address)
        .bind(topic(0))
        .bind(topic(1))
        .bind(topic(2))
        .bind(topic(3))
        .bind(&log.data)
        .bind(&log.transaction_hash)
        .bind(log.transaction_index as i32)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_traces(
    tx: &mut Transaction<'_, Postgres>,
    chain_id: u64,
    traces: &[CallTrace],
) -> Result<(), StorageError> {
    for t in traces {
        sqlx::query(
            "INSERT INTO sync.traces
                (chain_id, transaction_hash, trace_index, block_number, transaction_index,
                 from_address, to_address, input, output, value)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (chain_id, transaction_hash, trace_index) DO NOTHING",
        )
        .bind(chain_id as i64)
        .bind(&t.transaction_hash)
        .bind(t.trace_index as i32)
        .bind(t.block_number as i64)
        .bind(t.transaction_index as i32)
        .bind(&t.from)
        .bind(&t.to)
        .bind(&t.input)
        .bind(&t.output)
        .bind(&t.value)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_max_block() {
        let mut data = ChunkData::default();
        assert_eq!(data.max_block(), None);
        data.blocks.push(Block {
            chain_id: 1,
            number: 100,
            hash: "0xa".into(),
            parent_hash: "0x0".into(),
            timestamp: 1000,
        });
        data.logs.push(Log {
            address: "0x1".into(),
            topics: vec![],
            data: "0x".into(),
            block_number: 105,
            block_hash: "0xb".into(),
            transaction_hash: "0xt".into(),
            transaction_index: 0,
            log_index: 0,
        });
        assert_eq!(data.max_block(), Some(105));
    }

    #[test]
    fn request_hash_is_stable() {
        let params = serde_json::json!(["0x64", true]);
        let a = request_hash("eth_getBlockByNumber", &params);
        let b = request_hash("eth_getBlockByNumber", &params);
        assert_eq!(a, b);
        let c = request_hash("eth_getBlockByHash", &params);
        assert_ne!(a, c);
    }

    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL to enable, e.g.
    // DATABASE_URL=postgresql://localhost/eventide_test cargo test -- --ignored

    async fn connect() -> SyncCache {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let pool = PgPool::connect(&url).await.unwrap();
        let cache = SyncCache::new(pool);
        cache.migrate().await.unwrap();
        cache
    }

    fn block(number: u64) -> Block {
        Block {
            chain_id: 424242,
            number,
            hash: format!("0xhash{number}"),
            parent_hash: format!("0xhash{}", number - 1),
            timestamp: number * 12,
        }
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn write_chunk_and_read_back() {
        let cache = connect().await;
        let data = ChunkData {
            blocks: vec![block(100), block(101)],
            logs: vec![Log {
                address: "0xAAA".into(),
                topics: vec!["0xddf2".into()],
                data: "0x".into(),
                block_number: 100,
                block_hash: "0xhash100".into(),
                transaction_hash: "0xt1".into(),
                transaction_index: 0,
                log_index: 0,
            }],
            ..Default::default()
        };
        cache
            .write_chunk(424242, 1_000, &data, Some(("fp-test", BlockRange::new(100, 101))))
            .await
            .unwrap();

        let blocks = cache
            .get_blocks(424242, BlockRange::new(100, 101))
            .await
            .unwrap();
        assert_eq!(blocks.len(), 2);

        let logs = cache
            .get_logs(
                424242,
                BlockRange::new(100, 101),
                &["0xaaa".into()],
                &TopicFilter::default(),
            )
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].topics, vec!["0xddf2".to_string()]);

        let intervals = cache.get_interval(424242, "fp-test").await.unwrap();
        assert!(intervals.covers(BlockRange::new(100, 101)));

        // Cached RPC results share the same multi-writer semantics.
        let hash = request_hash("trace_block", &serde_json::json!(["0x64"]));
        assert!(cache.rpc_result_get(424242, &hash).await.unwrap().is_none());
        cache
            .rpc_result_put(424242, &hash, &serde_json::json!([{"type": "call"}]))
            .await
            .unwrap();
        assert!(cache.rpc_result_get(424242, &hash).await.unwrap().is_some());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn refuses_rows_above_finalized() {
        let cache = connect().await;
        let data = ChunkData {
            blocks: vec![block(5_000)],
            ..Default::default()
        };
        let err = cache
            .write_chunk(424242, 4_000, &data, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AboveFinalized { block: 5_000, .. }));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn interval_compaction_merges_adjoining() {
        let cache = connect().await;
        for (s, e) in [(200u64, 249u64), (250, 299), (300, 349)] {
            cache
                .write_chunk(
                    424243,
                    10_000,
                    &ChunkData::default(),
                    Some(("fp-compact", BlockRange::new(s, e))),
                )
                .await
                .unwrap();
        }
        cache.compact_intervals(424243, "fp-compact").await.unwrap();
        let set = cache.get_interval(424243, "fp-compact").await.unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.covers(BlockRange::new(200, 349)));
    }
}
