//! In-memory indexing store.
//!
//! Backs unit tests and scenario tests with the same `RowStore` semantics
//! as the Postgres store: schema validation, primary-key conflict
//! handling, and a journal that supports checkpoint rollback. All data is
//! lost when the process exits.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use eventide_core::checkpoint::Checkpoint;
use eventide_core::error::StoreError;
use eventide_core::handler::{JournaledStore, OnConflict, Patch, RowStore};

use crate::journal::{key_of_row, merge_patch, normalize_key, JournalEntry, JournalOp};
use crate::schema::{SchemaDescription, TableSchema};

struct Inner {
    /// table name → canonical key string → row.
    tables: BTreeMap<String, BTreeMap<String, Value>>,
    /// table name → journal rows with a global sequence for ordering.
    journals: HashMap<String, Vec<(u64, JournalEntry)>>,
    seq: u64,
    current: Checkpoint,
}

/// An in-memory [`RowStore`] + [`JournaledStore`].
pub struct MemIndexingStore {
    schema: SchemaDescription,
    inner: Mutex<Inner>,
}

impl MemIndexingStore {
    pub fn new(schema: SchemaDescription) -> Self {
        let tables = schema
            .tables
            .iter()
            .map(|t| (t.name.clone(), BTreeMap::new()))
            .collect();
        let journals = schema
            .tables
            .iter()
            .map(|t| (t.name.clone(), Vec::new()))
            .collect();
        Self {
            schema,
            inner: Mutex::new(Inner {
                tables,
                journals,
                seq: 0,
                current: Checkpoint::ZERO,
            }),
        }
    }

    fn table_schema(&self, table: &str) -> Result<&TableSchema, StoreError> {
        self.schema
            .table(table)
            .ok_or_else(|| StoreError::UndefinedTable {
                table: table.to_string(),
            })
    }

    fn writable(&self, table: &str) -> Result<&TableSchema, StoreError> {
        let schema = self.table_schema(table)?;
        if !schema.onchain {
            return Err(StoreError::InvalidStoreMethod {
                table: table.to_string(),
            });
        }
        Ok(schema)
    }

    /// All rows of a table in key order (test helper).
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of journal rows for a table (test helper).
    pub fn journal_len(&self, table: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .journals
            .get(table)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Inner {
    fn journal(&mut self, table: &str, entry: JournalEntry) {
        self.seq += 1;
        let seq = self.seq;
        self.journals
            .entry(table.to_string())
            .or_default()
            .push((seq, entry));
    }
}

#[async_trait]
impl RowStore for MemIndexingStore {
    async fn find(&self, table: &str, key: &Value) -> Result<Option<Value>, StoreError> {
        let schema = self.table_schema(table)?;
        let (canonical, _) = normalize_key(schema, key)?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .and_then(|t| t.get(&canonical))
            .cloned())
    }

    async fn insert(
        &self,
        table: &str,
        rows: Vec<Value>,
        on_conflict: OnConflict,
    ) -> Result<Vec<Value>, StoreError> {
        let schema = self.writable(table)?;
        let mut inner = self.inner.lock().unwrap();
        let checkpoint = inner.current;
        let mut stored = Vec::with_capacity(rows.len());

        for row in rows {
            let (canonical, key) = key_of_row(schema, &row)?;
            let existing = inner
                .tables
                .get(table)
                .and_then(|t| t.get(&canonical))
                .cloned();
            match existing {
                None => {
                    inner
                        .tables
                        .get_mut(table)
                        .expect("table exists")
                        .insert(canonical, row.clone());
                    inner.journal(
                        table,
                        JournalEntry {
                            op: JournalOp::Insert,
                            checkpoint,
                            key,
                            before_image: None,
                        },
                    );
                    stored.push(row);
                }
                Some(current) => match &on_conflict {
                    OnConflict::Error => {
                        return Err(StoreError::UniqueConstraint {
                            table: table.to_string(),
                            detail: format!("duplicate key {canonical}"),
                        })
                    }
                    OnConflict::DoNothing => {}
                    OnConflict::DoUpdate(patch) => {
                        let mut updated = current.clone();
                        merge_patch(&mut updated, patch.resolve(&current));
                        inner
                            .tables
                            .get_mut(table)
                            .expect("table exists")
                            .insert(canonical, updated.clone());
                        inner.journal(
                            table,
                            JournalEntry {
                                op: JournalOp::Update,
                                checkpoint,
                                key,
                                before_image: Some(current),
                            },
                        );
                        stored.push(updated);
                    }
                },
            }
        }
        Ok(stored)
    }

    async fn update(&self, table: &str, key: &Value, patch: Patch) -> Result<Value, StoreError> {
        let schema = self.writable(table)?;
        let (canonical, key_object) = normalize_key(schema, key)?;
        let mut inner = self.inner.lock().unwrap();
        let checkpoint = inner.current;

        let current = inner
            .tables
            .get(table)
            .and_then(|t| t.get(&canonical))
            .cloned()
            .ok_or_else(|| StoreError::RecordNotFound {
                table: table.to_string(),
                key: canonical.clone(),
            })?;

        let mut updated = current.clone();
        merge_patch(&mut updated, patch.resolve(&current));
        inner
            .tables
            .get_mut(table)
            .expect("table exists")
            .insert(canonical, updated.clone());
        inner.journal(
            table,
            JournalEntry {
                op: JournalOp::Update,
                checkpoint,
                key: key_object,
                before_image: Some(current),
            },
        );
        Ok(updated)
    }

    async fn delete(&self, table: &str, key: &Value) -> Result<bool, StoreError> {
        let schema = self.writable(table)?;
        let (canonical, key_object) = normalize_key(schema, key)?;
        let mut inner = self.inner.lock().unwrap();
        let checkpoint = inner.current;

        let removed = inner
            .tables
            .get_mut(table)
            .expect("table exists")
            .remove(&canonical);
        match removed {
            Some(before) => {
                inner.journal(
                    table,
                    JournalEntry {
                        op: JournalOp::Delete,
                        checkpoint,
                        key: key_object,
                        before_image: Some(before),
                    },
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sql(&self, statement: &str) -> Result<Vec<Value>, StoreError> {
        let head = statement.trim_start().to_ascii_lowercase();
        if !(head.starts_with("select") || head.starts_with("with")) {
            return Err(StoreError::ReadOnlySql {
                statement: statement.to_string(),
            });
        }
        Err(StoreError::Database(
            "the in-memory store does not execute raw sql".into(),
        ))
    }
}

#[async_trait]
impl JournaledStore for MemIndexingStore {
    fn begin_event(&self, checkpoint: Checkpoint) {
        self.inner.lock().unwrap().current = checkpoint;
    }

    async fn rollback(&self, ancestor: Checkpoint) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        // Collect every journal row above the ancestor, newest write first.
        let mut pending: Vec<(String, u64, JournalEntry)> = Vec::new();
        for (table, journal) in &inner.journals {
            for (seq, entry) in journal {
                if entry.checkpoint > ancestor {
                    pending.push((table.clone(), *seq, entry.clone()));
                }
            }
        }
        pending.sort_by(|a, b| b.1.cmp(&a.1));

        let replayed = pending.len() as u64;
        for (table, seq, entry) in pending {
            let rows = inner.tables.get_mut(&table).expect("table exists");
            let canonical = serde_json::to_string(&entry.key)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            match entry.op {
                JournalOp::Insert => {
                    rows.remove(&canonical);
                }
                JournalOp::Update | JournalOp::Delete => {
                    let image = entry.before_image.clone().ok_or_else(|| {
                        StoreError::Serialization("journal row missing before image".into())
                    })?;
                    rows.insert(canonical, image);
                }
            }
            inner
                .journals
                .get_mut(&table)
                .expect("journal exists")
                .retain(|(s, _)| *s != seq);
        }
        Ok(replayed)
    }

    async fn prune(&self, finalized: Checkpoint) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut pruned = 0;
        for journal in inner.journals.values_mut() {
            let before = journal.len();
            journal.retain(|(_, e)| e.checkpoint > finalized);
            pruned += (before - journal.len()) as u64;
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::counter_schema;
    use serde_json::json;

    fn store() -> MemIndexingStore {
        MemIndexingStore::new(counter_schema())
    }

    fn cp(block: u64) -> Checkpoint {
        Checkpoint::new(block * 12, 1, block, 0, 1)
    }

    #[tokio::test]
    async fn insert_then_find() {
        let store = store();
        store.begin_event(cp(100));
        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap();

        let row = store.find("counters", &json!("a")).await.unwrap();
        assert_eq!(row, Some(json!({ "id": "a", "value": 1 })));
    }

    #[tokio::test]
    async fn insert_then_reorg_beyond_returns_null() {
        let store = store();
        store.begin_event(cp(103));
        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap();

        // Roll back past the insert — the row vanishes.
        store.rollback(cp(102)).await.unwrap();
        assert_eq!(store.find("counters", &json!("a")).await.unwrap(), None);
        assert_eq!(store.journal_len("counters"), 0);
    }

    #[tokio::test]
    async fn journal_restores_exact_prior_state() {
        let store = store();

        store.begin_event(cp(100));
        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap();
        let state_at_100 = store.rows("counters");

        store.begin_event(cp(101));
        store
            .update(
                "counters",
                &json!("a"),
                Patch::object(json!({ "value": 2 })),
            )
            .await
            .unwrap();
        store.begin_event(cp(102));
        store.delete("counters", &json!("a")).await.unwrap();
        store.begin_event(cp(103));
        store
            .insert(
                "counters",
                vec![json!({ "id": "b", "value": 9 })],
                OnConflict::Error,
            )
            .await
            .unwrap();

        // Rolling back to block 100 must reproduce the state exactly.
        let replayed = store.rollback(cp(100)).await.unwrap();
        assert_eq!(replayed, 3);
        assert_eq!(store.rows("counters"), state_at_100);
    }

    #[tokio::test]
    async fn update_missing_row_fails() {
        let store = store();
        store.begin_event(cp(100));
        let err = store
            .update(
                "counters",
                &json!("ghost"),
                Patch::object(json!({ "value": 1 })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordNotFound { .. }));
    }

    #[tokio::test]
    async fn offchain_tables_are_read_only() {
        let mut schema = counter_schema();
        schema.tables[0].onchain = false;
        let store = MemIndexingStore::new(schema);
        store.begin_event(cp(100));

        let err = store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidStoreMethod { .. }));

        // Reads are still allowed.
        assert!(store.find("counters", &json!("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn undefined_table_rejected() {
        let store = store();
        let err = store.find("ghosts", &json!("a")).await.unwrap_err();
        assert!(matches!(err, StoreError::UndefinedTable { .. }));
    }

    #[tokio::test]
    async fn conflict_policies() {
        let store = store();
        store.begin_event(cp(100));
        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 1 })],
                OnConflict::Error,
            )
            .await
            .unwrap();

        // Error policy surfaces the violation.
        let err = store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 5 })],
                OnConflict::Error,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueConstraint { .. }));

        // DoNothing keeps the original.
        let stored = store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 5 })],
                OnConflict::DoNothing,
            )
            .await
            .unwrap();
        assert!(stored.is_empty());
        let row = store.find("counters", &json!("a")).await.unwrap().unwrap();
        assert_eq!(row["value"], 1);

        // DoUpdate patches the existing row.
        store
            .insert(
                "counters",
                vec![json!({ "id": "a", "value": 5 })],
                OnConflict::DoUpdate(Patch::object(json!({ "value": 5 }))),
            )
            .await
            .unwrap();
        let row = store.find("counters", &json!("a")).await.unwrap().unwrap();
        assert_eq!(row["value"], 5);
    }

    #[tokio::test]
    async fn raw_sql_rejects_writes() {
        let store = store();
        let err = store
            .sql("DELETE FROM counters")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ReadOnlySql { .. }));
    }

    #[tokio::test]
    async fn prune_drops_finalized_journal_rows() {
        let store = store();
        for block in 100..=104 {
            store.begin_event(cp(block));
            store
                .insert(
                    "counters",
                    vec![json!({ "id": block.to_string(), "value": 0 })],
                    OnConflict::Error,
                )
                .await
                .unwrap();
        }
        assert_eq!(store.journal_len("counters"), 5);

        let pruned = store.prune(cp(102)).await.unwrap();
        assert_eq!(pruned, 3);
        assert_eq!(store.journal_len("counters"), 2);

        // Rollback can still undo the unpruned tail.
        store.rollback(cp(102)).await.unwrap();
        assert_eq!(store.rows("counters").len(), 3);
    }
}
