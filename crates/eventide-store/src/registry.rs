//! Instance registry: `_eventide_meta`, build/instance ids, crash-resume
//! adoption, heartbeats, live-view cutover, and stale-table GC.
//!
//! An instance owns `{instance_id}__*` exclusively. The public views are
//! owned by whichever instance most recently finished its backfill; they
//! are only ever rewritten during cutover, under an advisory lock keyed by
//! the user schema name.

use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};

use eventide_core::checkpoint::Checkpoint;
use eventide_core::status::InstanceStatus;

use crate::error::StorageError;
use crate::schema::{SchemaDescription, META_TABLE};

/// Heartbeat write period.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
/// An instance whose heartbeat is older than this is considered dead.
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 60;
/// How many stopped instances the GC preserves.
const GC_KEEP: usize = 3;

const INSTANCE_ID_LEN: usize = 4;
const INSTANCE_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// This instance's identity, as allocated (or adopted) at startup.
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub instance_id: String,
    pub build_id: String,
    /// `true` when a dead instance with the same build id was resumed.
    pub adopted: bool,
    /// The adopted instance's committed checkpoint, when resuming.
    pub resume_checkpoint: Option<Checkpoint>,
}

#[derive(Clone)]
pub struct InstanceRegistry {
    pool: PgPool,
    pg_schema: String,
    dev_mode: bool,
}

/// Hash of everything that defines a build; instances sharing it may adopt
/// each other's tables across restarts.
pub fn build_id(
    config_fingerprint: &str,
    schema_fingerprint: &str,
    handler_fingerprint: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config_fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(schema_fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(handler_fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_instance_id() -> String {
    let mut rng = rand::thread_rng();
    (0..INSTANCE_ID_LEN)
        .map(|_| INSTANCE_ID_CHARSET[rng.gen_range(0..INSTANCE_ID_CHARSET.len())] as char)
        .collect()
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl InstanceRegistry {
    pub fn new(pool: PgPool, pg_schema: &str, dev_mode: bool) -> Self {
        Self {
            pool,
            pg_schema: pg_schema.to_string(),
            dev_mode,
        }
    }

    fn meta_table(&self) -> String {
        format!("\"{}\".\"{META_TABLE}\"", self.pg_schema)
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS \"{}\"",
            self.pg_schema
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                instance_id  TEXT PRIMARY KEY,
                build_id     TEXT   NOT NULL,
                schema_json  JSONB  NOT NULL,
                status       TEXT   NOT NULL,
                heartbeat_at BIGINT NOT NULL,
                checkpoint   TEXT,
                dev          BOOLEAN NOT NULL DEFAULT FALSE
            )",
            self.meta_table()
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Allocate this instance's identity.
    ///
    /// Outside dev mode, a dead instance (stale heartbeat) with the same
    /// build id is adopted: its `instance_id` and checkpoint are reused so
    /// indexing resumes instead of restarting from scratch.
    pub async fn register(
        &self,
        build_id: &str,
        schema: &SchemaDescription,
    ) -> Result<InstanceHandle, StorageError> {
        let schema_json =
            serde_json::to_value(schema).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let now = now_secs();

        if !self.dev_mode {
            let dead = sqlx::query(&format!(
                "SELECT instance_id, checkpoint FROM {}
                 WHERE build_id = $1 AND heartbeat_at < $2
                 ORDER BY heartbeat_at DESC
                 LIMIT 1",
                self.meta_table()
            ))
            .bind(build_id)
            .bind(now - HEARTBEAT_TIMEOUT_SECS)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = dead {
                let instance_id: String = row.get("instance_id");
                let resume_checkpoint = row
                    .get::<Option<String>, _>("checkpoint")
                    .map(|s| {
                        Checkpoint::decode(&s)
                            .map_err(|e| StorageError::Corrupt(e.to_string()))
                    })
                    .transpose()?;
                sqlx::query(&format!(
                    "UPDATE {} SET status = $2, heartbeat_at = $3 WHERE instance_id = $1",
                    self.meta_table()
                ))
                .bind(&instance_id)
                .bind(InstanceStatus::Historical.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?;
                tracing::info!(
                    instance_id,
                    checkpoint = ?resume_checkpoint,
                    "adopted dead instance with matching build id"
                );
                return Ok(InstanceHandle {
                    instance_id,
                    build_id: build_id.to_string(),
                    adopted: true,
                    resume_checkpoint,
                });
            }
        }

        // Fresh instance id; retry on the (unlikely) collision.
        loop {
            let instance_id = random_instance_id();
            let inserted = sqlx::query(&format!(
                "INSERT INTO {} (instance_id, build_id, schema_json, status, heartbeat_at, dev)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (instance_id) DO NOTHING",
                self.meta_table()
            ))
            .bind(&instance_id)
            .bind(build_id)
            .bind(&schema_json)
            .bind(InstanceStatus::Historical.as_str())
            .bind(now)
            .bind(self.dev_mode)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 1 {
                tracing::info!(instance_id, build_id, "registered new instance");
                return Ok(InstanceHandle {
                    instance_id,
                    build_id: build_id.to_string(),
                    adopted: false,
                    resume_checkpoint: None,
                });
            }
        }
    }

    /// Create the instance's physical and journal tables.
    pub async fn create_tables(
        &self,
        instance_id: &str,
        schema: &SchemaDescription,
    ) -> Result<(), StorageError> {
        for table in &schema.tables {
            sqlx::query(&schema.create_table_sql(table, &self.pg_schema, instance_id))
                .execute(&self.pool)
                .await?;
            sqlx::query(&schema.create_journal_sql(table, &self.pg_schema, instance_id))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn heartbeat(&self, instance_id: &str) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "UPDATE {} SET heartbeat_at = $2 WHERE instance_id = $1",
            self.meta_table()
        ))
        .bind(instance_id)
        .bind(now_secs())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the committed indexing checkpoint.
    pub async fn set_checkpoint(
        &self,
        instance_id: &str,
        checkpoint: Checkpoint,
    ) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "UPDATE {} SET checkpoint = $2 WHERE instance_id = $1",
            self.meta_table()
        ))
        .bind(instance_id)
        .bind(checkpoint.encode())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "UPDATE {} SET status = $2 WHERE instance_id = $1",
            self.meta_table()
        ))
        .bind(instance_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip the public views to this instance in one transaction, under an
    /// advisory lock keyed by the user schema name. This is the moment
    /// `/ready` starts returning 200.
    pub async fn cutover(
        &self,
        instance_id: &str,
        schema: &SchemaDescription,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
            .bind(&self.pg_schema)
            .execute(&mut *tx)
            .await?;

        for table in &schema.tables {
            sqlx::query(&format!(
                "DROP VIEW IF EXISTS \"{}\".\"{}\"",
                self.pg_schema, table.name
            ))
            .execute(&mut *tx)
            .await?;
            sqlx::query(&format!(
                "CREATE VIEW \"{}\".\"{}\" AS SELECT * FROM \"{}\".\"{}\"",
                self.pg_schema,
                table.name,
                self.pg_schema,
                table.physical_name(instance_id)
            ))
            .execute(&mut *tx)
            .await?;
        }

        // The previous owner of the views is superseded.
        sqlx::query(&format!(
            "UPDATE {} SET status = $1 WHERE status = $2 AND instance_id != $3",
            self.meta_table()
        ))
        .bind(InstanceStatus::Stopped.as_str())
        .bind(InstanceStatus::Live.as_str())
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "UPDATE {} SET status = $1 WHERE instance_id = $2",
            self.meta_table()
        ))
        .bind(InstanceStatus::Live.as_str())
        .bind(instance_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::info!(instance_id, "live view cutover complete");
        Ok(())
    }

    /// Drop tables of stale instances: everything not live/historical
    /// except the three most recently heartbeating stopped instances.
    /// Dead dev-mode instances are always dropped.
    pub async fn gc(&self) -> Result<u64, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT instance_id, schema_json, status, heartbeat_at, dev FROM {}
             ORDER BY heartbeat_at DESC",
            self.meta_table()
        ))
        .fetch_all(&self.pool)
        .await?;

        let now = now_secs();
        let mut stopped_seen = 0usize;
        let mut dropped = 0u64;

        for row in rows {
            let instance_id: String = row.get("instance_id");
            let status = InstanceStatus::parse(&row.get::<String, _>("status"));
            let heartbeat_at: i64 = row.get("heartbeat_at");
            let dev: bool = row.get("dev");
            let dead = heartbeat_at < now - HEARTBEAT_TIMEOUT_SECS;

            let purge = match status {
                Some(InstanceStatus::Live) | Some(InstanceStatus::Historical) => {
                    dev && dead
                }
                _ => {
                    stopped_seen += 1;
                    (dev && dead) || stopped_seen > GC_KEEP
                }
            };
            if !purge {
                continue;
            }

            let schema: SchemaDescription =
                serde_json::from_value(row.get::<Value, _>("schema_json"))
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            for table in &schema.tables {
                sqlx::query(&format!(
                    "DROP TABLE IF EXISTS \"{}\".\"{}\" CASCADE",
                    self.pg_schema,
                    table.physical_name(&instance_id)
                ))
                .execute(&self.pool)
                .await?;
                sqlx::query(&format!(
                    "DROP TABLE IF EXISTS \"{}\".\"{}\"",
                    self.pg_schema,
                    table.journal_name(&instance_id)
                ))
                .execute(&self.pool)
                .await?;
            }
            sqlx::query(&format!(
                "DELETE FROM {} WHERE instance_id = $1",
                self.meta_table()
            ))
            .bind(&instance_id)
            .execute(&self.pool)
            .await?;

            tracing::info!(instance_id, "dropped stale instance tables");
            dropped += 1;
        }
        Ok(dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::counter_schema;

    #[test]
    fn build_id_is_deterministic() {
        let a = build_id("cfg", "schema", "handlers");
        let b = build_id("cfg", "schema", "handlers");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, build_id("cfg2", "schema", "handlers"));
    }

    #[test]
    fn instance_ids_are_short_alphanumeric() {
        for _ in 0..100 {
            let id = random_instance_id();
            assert_eq!(id.len(), 4);
            assert!(id.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        }
    }

    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL to enable.

    async fn registry(dev: bool) -> InstanceRegistry {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let pool = PgPool::connect(&url).await.unwrap();
        let registry = InstanceRegistry::new(pool, "public", dev);
        registry.migrate().await.unwrap();
        registry
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn register_creates_fresh_instance() {
        let registry = registry(true).await;
        let schema = counter_schema();
        let handle = registry.register("build-test-1", &schema).await.unwrap();
        assert!(!handle.adopted);
        assert_eq!(handle.instance_id.len(), 4);
        registry
            .create_tables(&handle.instance_id, &schema)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn dead_instance_is_adopted() {
        let registry = registry(false).await;
        let schema = counter_schema();
        let first = registry.register("build-adopt", &schema).await.unwrap();

        // Age the heartbeat past the timeout and set a checkpoint.
        let cp = Checkpoint::new(1005, 1, 50, 0, 0);
        registry
            .set_checkpoint(&first.instance_id, cp)
            .await
            .unwrap();
        sqlx::query(&format!(
            "UPDATE {} SET heartbeat_at = heartbeat_at - 120 WHERE instance_id = $1",
            registry.meta_table()
        ))
        .bind(&first.instance_id)
        .execute(&registry.pool)
        .await
        .unwrap();

        let second = registry.register("build-adopt", &schema).await.unwrap();
        assert!(second.adopted);
        assert_eq!(second.instance_id, first.instance_id);
        assert_eq!(second.resume_checkpoint, Some(cp));
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn cutover_points_views_at_instance() {
        let registry = registry(true).await;
        let schema = counter_schema();
        let handle = registry.register("build-cutover", &schema).await.unwrap();
        registry
            .create_tables(&handle.instance_id, &schema)
            .await
            .unwrap();
        registry.cutover(&handle.instance_id, &schema).await.unwrap();

        // The view answers for the instance's physical table.
        let count: i64 =
            sqlx::query_scalar("SELECT count(*) FROM \"public\".\"counters\"")
                .fetch_one(&registry.pool)
                .await
                .unwrap();
        assert_eq!(count, 0);
    }
}
