//! Postgres indexing store: the journaled `RowStore` behind user handlers.
//!
//! Rows travel as JSON and are converted by Postgres itself via
//! `jsonb_populate_record`, so one prepared statement per table covers
//! arbitrary user schemas. Every mutation runs in one transaction with its
//! journal row; operations are serialized through a single async mutex
//! (the engine delivers one event at a time, and inside a handler
//! `find`-then-`update` must be race-free).

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

use eventide_core::checkpoint::Checkpoint;
use eventide_core::error::StoreError;
use eventide_core::handler::{JournaledStore, OnConflict, Patch, RowStore};

use crate::journal::{key_of_row, merge_patch, normalize_key, JournalOp};
use crate::schema::{SchemaDescription, TableSchema};

/// Per-table SQL, prepared once at construction.
struct TableMeta {
    schema: TableSchema,
    find_sql: String,
    insert_sql: String,
    insert_skip_sql: String,
    update_sql: String,
    delete_sql: String,
    journal_insert_sql: String,
    journal_scan_sql: String,
    journal_delete_above_sql: String,
    journal_prune_sql: String,
}

fn quoted(pg_schema: &str, table: &str) -> String {
    format!("\"{pg_schema}\".\"{table}\"")
}

impl TableMeta {
    fn build(pg_schema: &str, instance_id: &str, table: &TableSchema) -> Self {
        let physical = quoted(pg_schema, &table.physical_name(instance_id));
        let journal = quoted(pg_schema, &table.journal_name(instance_id));

        let pk_cols = |alias: &str| -> String {
            table
                .primary_key
                .iter()
                .map(|k| format!("{alias}\"{k}\""))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let all_cols = |alias: &str| -> String {
            table
                .columns
                .iter()
                .map(|c| format!("{alias}\"{}\"", c.name))
                .collect::<Vec<_>>()
                .join(", ")
        };
        // `(t.pk…) = (SELECT r.pk… FROM jsonb_populate_record(…, $n) r)`
        let key_match = |bind: &str| {
            format!(
                "({}) = (SELECT {} FROM jsonb_populate_record(NULL::{physical}, {bind}) r)",
                pk_cols("t."),
                pk_cols("r.")
            )
        };

        let find_sql = format!(
            "SELECT row_to_json(t.*) AS row FROM {physical} t WHERE {}",
            key_match("$1")
        );
        let insert_sql = format!(
            "INSERT INTO {physical} AS t
             SELECT r.* FROM jsonb_populate_record(NULL::{physical}, $1) r
             RETURNING row_to_json(t.*) AS row"
        );
        let insert_skip_sql = format!(
            "INSERT INTO {physical} AS t
             SELECT r.* FROM jsonb_populate_record(NULL::{physical}, $1) r
             ON CONFLICT DO NOTHING
             RETURNING row_to_json(t.*) AS row"
        );
        let update_sql = format!(
            "UPDATE {physical} t
             SET ({}) = (SELECT {} FROM jsonb_populate_record(NULL::{physical}, $1) r)
             WHERE {}
             RETURNING row_to_json(t.*) AS row",
            all_cols(""),
            all_cols("r."),
            key_match("$2")
        );
        let delete_sql = format!(
            "DELETE FROM {physical} t WHERE {} RETURNING row_to_json(t.*) AS row",
            key_match("$1")
        );

        let journal_insert_sql = format!(
            "INSERT INTO {journal} (operation, checkpoint, key, before_image)
             VALUES ($1, $2, $3, $4)"
        );
        let journal_scan_sql = format!(
            "SELECT journal_id, operation, key, before_image FROM {journal}
             WHERE checkpoint > $1
             ORDER BY checkpoint DESC, journal_id DESC"
        );
        let journal_delete_above_sql = format!("DELETE FROM {journal} WHERE checkpoint > $1");
        let journal_prune_sql = format!("DELETE FROM {journal} WHERE checkpoint <= $1");

        Self {
            schema: table.clone(),
            find_sql,
            insert_sql,
            insert_skip_sql,
            update_sql,
            delete_sql,
            journal_insert_sql,
            journal_scan_sql,
            journal_delete_above_sql,
            journal_prune_sql,
        }
    }
}

/// The handler-facing store for one instance's tables.
pub struct PgIndexingStore {
    pool: PgPool,
    tables: HashMap<String, TableMeta>,
    /// Serializes all store operations (concurrency = 1).
    op_lock: Mutex<()>,
    /// Checkpoint of the event currently being handled.
    current: StdMutex<Checkpoint>,
}

impl PgIndexingStore {
    /// Resolve table metadata and primary keys once, up front.
    pub fn new(
        pool: PgPool,
        pg_schema: &str,
        instance_id: &str,
        schema: &SchemaDescription,
    ) -> Self {
        let tables = schema
            .tables
            .iter()
            .map(|t| (t.name.clone(), TableMeta::build(pg_schema, instance_id, t)))
            .collect();
        Self {
            pool,
            tables,
            op_lock: Mutex::new(()),
            current: StdMutex::new(Checkpoint::ZERO),
        }
    }

    fn meta(&self, table: &str) -> Result<&TableMeta, StoreError> {
        self.tables
            .get(table)
            .ok_or_else(|| StoreError::UndefinedTable {
                table: table.to_string(),
            })
    }

    fn writable(&self, table: &str) -> Result<&TableMeta, StoreError> {
        let meta = self.meta(table)?;
        if !meta.schema.onchain {
            return Err(StoreError::InvalidStoreMethod {
                table: table.to_string(),
            });
        }
        Ok(meta)
    }

    fn checkpoint(&self) -> Checkpoint {
        *self.current.lock().unwrap()
    }

    async fn journal(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        meta: &TableMeta,
        op: JournalOp,
        key: &Value,
        before_image: Option<&Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(&meta.journal_insert_sql)
            .bind(op.code())
            .bind(self.checkpoint().encode())
            .bind(key)
            .bind(before_image)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_db_error(&meta.schema.name, e))?;
        Ok(())
    }

    async fn find_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        meta: &TableMeta,
        key: &Value,
    ) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(&meta.find_sql)
            .bind(key)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_db_error(&meta.schema.name, e))?;
        Ok(row.map(|r| r.get::<Value, _>("row")))
    }
}

/// Map Postgres constraint violations onto the handler-facing taxonomy.
fn map_db_error(table: &str, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
        let detail = db.message().to_string();
        match db.code().as_deref() {
            Some("23505") => {
                return StoreError::UniqueConstraint {
                    table: table.to_string(),
                    detail,
                }
            }
            Some("23502") => {
                return StoreError::NotNullConstraint {
                    table: table.to_string(),
                    detail,
                }
            }
            Some("23514") => {
                return StoreError::CheckConstraint {
                    table: table.to_string(),
                    detail,
                }
            }
            _ => {}
        }
    }
    StoreError::Database(e.to_string())
}

#[async_trait]
impl RowStore for PgIndexingStore {
    async fn find(&self, table: &str, key: &Value) -> Result<Option<Value>, StoreError> {
        let _guard = self.op_lock.lock().await;
        let meta = self.meta(table)?;
        let (_, key) = normalize_key(&meta.schema, key)?;
        let row = sqlx::query(&meta.find_sql)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_db_error(table, e))?;
        Ok(row.map(|r| r.get::<Value, _>("row")))
    }

    async fn insert(
        &self,
        table: &str,
        rows: Vec<Value>,
        on_conflict: OnConflict,
    ) -> Result<Vec<Value>, StoreError> {
        let _guard = self.op_lock.lock().await;
        let meta = self.writable(table)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_error(table, e))?;
        let mut stored = Vec::with_capacity(rows.len());

        for row in &rows {
            let (_, key) = key_of_row(&meta.schema, row)?;
            match &on_conflict {
                OnConflict::Error => {
                    let inserted = sqlx::query(&meta.insert_sql)
                        .bind(row)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(|e| map_db_error(table, e))?;
                    self.journal(&mut tx, meta, JournalOp::Insert, &key, None)
                        .await?;
                    stored.push(inserted.get::<Value, _>("row"));
                }
                OnConflict::DoNothing => {
                    let inserted = sqlx::query(&meta.insert_skip_sql)
                        .bind(row)
                        .fetch_optional(&mut *tx)
                        .await
                        .map_err(|e| map_db_error(table, e))?;
                    // No RETURNING row means the conflict path was taken.
                    if let Some(r) = inserted {
                        self.journal(&mut tx, meta, JournalOp::Insert, &key, None)
                            .await?;
                        stored.push(r.get::<Value, _>("row"));
                    }
                }
                OnConflict::DoUpdate(patch) => {
                    // Per-row find-then-write; the resolution is atomic per
                    // row, not across the batch.
                    match self.find_in_tx(&mut tx, meta, &key).await? {
                        None => {
                            let inserted = sqlx::query(&meta.insert_sql)
                                .bind(row)
                                .fetch_one(&mut *tx)
                                .await
                                .map_err(|e| map_db_error(table, e))?;
                            self.journal(&mut tx, meta, JournalOp::Insert, &key, None)
                                .await?;
                            stored.push(inserted.get::<Value, _>("row"));
                        }
                        Some(current) => {
                            let mut merged = current.clone();
                            merge_patch(&mut merged, patch.resolve(&current));
                            let updated = sqlx::query(&meta.update_sql)
                                .bind(&merged)
                                .bind(&key)
                                .fetch_one(&mut *tx)
                                .await
                                .map_err(|e| map_db_error(table, e))?;
                            self.journal(
                                &mut tx,
                                meta,
                                JournalOp::Update,
                                &key,
                                Some(&current),
                            )
                            .await?;
                            stored.push(updated.get::<Value, _>("row"));
                        }
                    }
                }
            }
        }

        tx.commit().await.map_err(|e| map_db_error(table, e))?;
        Ok(stored)
    }

    async fn update(&self, table: &str, key: &Value, patch: Patch) -> Result<Value, StoreError> {
        let _guard = self.op_lock.lock().await;
        let meta = self.writable(table)?;
        let (canonical, key) = normalize_key(&meta.schema, key)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_error(table, e))?;

        let current = self.find_in_tx(&mut tx, meta, &key).await?.ok_or_else(|| {
            StoreError::RecordNotFound {
                table: table.to_string(),
                key: canonical,
            }
        })?;

        let mut merged = current.clone();
        merge_patch(&mut merged, patch.resolve(&current));
        let updated = sqlx::query(&meta.update_sql)
            .bind(&merged)
            .bind(&key)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_db_error(table, e))?;
        self.journal(&mut tx, meta, JournalOp::Update, &key, Some(&current))
            .await?;

        tx.commit().await.map_err(|e| map_db_error(table, e))?;
        Ok(updated.get::<Value, _>("row"))
    }

    async fn delete(&self, table: &str, key: &Value) -> Result<bool, StoreError> {
        let _guard = self.op_lock.lock().await;
        let meta = self.writable(table)?;
        let (_, key) = normalize_key(&meta.schema, key)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_error(table, e))?;

        let deleted = sqlx::query(&meta.delete_sql)
            .bind(&key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_db_error(table, e))?;
        let existed = match deleted {
            Some(row) => {
                let before: Value = row.get("row");
                self.journal(&mut tx, meta, JournalOp::Delete, &key, Some(&before))
                    .await?;
                true
            }
            None => false,
        };

        tx.commit().await.map_err(|e| map_db_error(table, e))?;
        Ok(existed)
    }

    async fn sql(&self, statement: &str) -> Result<Vec<Value>, StoreError> {
        let _guard = self.op_lock.lock().await;
        let head = statement.trim_start().to_ascii_lowercase();
        if !(head.starts_with("select") || head.starts_with("with")) {
            return Err(StoreError::ReadOnlySql {
                statement: statement.to_string(),
            });
        }
        let inner = statement.trim().trim_end_matches(';');
        let wrapped = format!("SELECT row_to_json(q.*) AS row FROM ({inner}) q");
        let rows = sqlx::query(&wrapped)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get::<Value, _>("row")).collect())
    }
}

#[async_trait]
impl JournaledStore for PgIndexingStore {
    fn begin_event(&self, checkpoint: Checkpoint) {
        *self.current.lock().unwrap() = checkpoint;
    }

    async fn rollback(&self, ancestor: Checkpoint) -> Result<u64, StoreError> {
        let _guard = self.op_lock.lock().await;
        let encoded = ancestor.encode();
        let mut replayed = 0u64;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        for meta in self.tables.values() {
            let entries = sqlx::query(&meta.journal_scan_sql)
                .bind(&encoded)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| map_db_error(&meta.schema.name, e))?;

            for entry in &entries {
                let op = JournalOp::from_code(entry.get::<i16, _>("operation")).ok_or_else(
                    || {
                        StoreError::Serialization(format!(
                            "unknown journal operation in '{}'",
                            meta.schema.name
                        ))
                    },
                )?;
                let key: Value = entry.get("key");
                let before: Option<Value> = entry.get("before_image");
                match op {
                    JournalOp::Insert => {
                        sqlx::query(&meta.delete_sql)
                            .bind(&key)
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(|e| map_db_error(&meta.schema.name, e))?;
                    }
                    JournalOp::Update => {
                        let image = before.ok_or_else(|| {
                            StoreError::Serialization("journal row missing before image".into())
                        })?;
                        sqlx::query(&meta.update_sql)
                            .bind(&image)
                            .bind(&key)
                            .fetch_one(&mut *tx)
                            .await
                            .map_err(|e| map_db_error(&meta.schema.name, e))?;
                    }
                    JournalOp::Delete => {
                        let image = before.ok_or_else(|| {
                            StoreError::Serialization("journal row missing before image".into())
                        })?;
                        sqlx::query(&meta.insert_sql)
                            .bind(&image)
                            .fetch_one(&mut *tx)
                            .await
                            .map_err(|e| map_db_error(&meta.schema.name, e))?;
                    }
                }
            }
            replayed += entries.len() as u64;

            sqlx::query(&meta.journal_delete_above_sql)
                .bind(&encoded)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_db_error(&meta.schema.name, e))?;
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        if replayed > 0 {
            tracing::info!(replayed, ancestor = %ancestor, "journal rollback complete");
        }
        Ok(replayed)
    }

    async fn prune(&self, finalized: Checkpoint) -> Result<u64, StoreError> {
        let _guard = self.op_lock.lock().await;
        let encoded = finalized.encode();
        let mut pruned = 0u64;
        for meta in self.tables.values() {
            let result = sqlx::query(&meta.journal_prune_sql)
                .bind(&encoded)
                .execute(&self.pool)
                .await
                .map_err(|e| map_db_error(&meta.schema.name, e))?;
            pruned += result.rows_affected();
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceRegistry;
    use crate::testutil::counter_schema;
    use serde_json::json;

    // Integration tests require a running PostgreSQL instance.
    // Set DATABASE_URL to enable.

    async fn store() -> PgIndexingStore {
        let url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");
        let pool = PgPool::connect(&url).await.unwrap();
        let schema = counter_schema();
        let registry = InstanceRegistry::new(pool.clone(), "public", true);
        registry.migrate().await.unwrap();
        registry
            .create_tables("itest", &schema)
            .await
            .unwrap();
        // Start from a clean slate between runs.
        sqlx::query("TRUNCATE \"public\".\"itest__counters\", \"public\".\"itest_reorg__counters\"")
            .execute(&pool)
            .await
            .unwrap();
        PgIndexingStore::new(pool, "public", "itest", &schema)
    }

    fn cp(block: u64) -> Checkpoint {
        Checkpoint::new(block * 12, 1, block, 0, 1)
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn insert_find_update_delete_roundtrip() {
        let store = store().await;
        store.begin_event(cp(100));

        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap();
        let row = store.find("counters", &json!("a")).await.unwrap().unwrap();
        assert_eq!(row["value"], 1);

        store.begin_event(cp(101));
        let updated = store
            .update(
                "counters",
                &json!("a"),
                Patch::object(json!({ "value": 2 })),
            )
            .await
            .unwrap();
        assert_eq!(updated["value"], 2);

        store.begin_event(cp(102));
        assert!(store.delete("counters", &json!("a")).await.unwrap());
        assert!(!store.delete("counters", &json!("a")).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn rollback_restores_prior_state() {
        let store = store().await;

        store.begin_event(cp(100));
        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap();

        store.begin_event(cp(101));
        store
            .update(
                "counters",
                &json!("a"),
                Patch::object(json!({ "value": 2 })),
            )
            .await
            .unwrap();
        store
            .insert(
                "counters",
                vec![json!({ "id": "b", "value": 7 })],
                OnConflict::Error,
            )
            .await
            .unwrap();

        let replayed = store.rollback(cp(100)).await.unwrap();
        assert_eq!(replayed, 2);

        let a = store.find("counters", &json!("a")).await.unwrap().unwrap();
        assert_eq!(a["value"], 1);
        assert!(store.find("counters", &json!("b")).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL (set DATABASE_URL to enable)"]
    async fn raw_sql_is_read_only() {
        let store = store().await;
        let err = store
            .sql("UPDATE \"public\".\"itest__counters\" SET value = 0")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnlySql { .. }));
    }
}
