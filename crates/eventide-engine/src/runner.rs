//! The indexing runner: delivers merged events to user handlers, one at a
//! time, against the journaled store.
//!
//! The engine's main loop calls [`Runner::process`] sequentially, so at
//! most one handler is ever in flight; inside the handler every store
//! operation is serialized by the store itself. On crash resume the
//! runner skips events at or below the adopted checkpoint so nothing is
//! re-delivered.

use std::sync::Mutex;

use eventide_core::checkpoint::Checkpoint;
use eventide_core::event::Event;
use eventide_core::handler::{HandlerRegistry, JournaledStore};

use crate::error::EngineError;

pub struct Runner<S: JournaledStore> {
    handlers: HandlerRegistry,
    store: S,
    /// Events at or below this checkpoint were committed by a previous
    /// life of this instance and must not be re-delivered.
    floor: Mutex<Option<Checkpoint>>,
}

impl<S: JournaledStore> Runner<S> {
    pub fn new(handlers: HandlerRegistry, store: S, resume_from: Option<Checkpoint>) -> Self {
        Self {
            handlers,
            store,
            floor: Mutex::new(resume_from),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Lower the skip floor after a reorg rollback so the re-delivered
    /// canonical events are processed even though they sit below the
    /// previously committed checkpoint.
    pub fn lower_floor(&self, ancestor: Checkpoint) {
        let mut floor = self.floor.lock().unwrap();
        if floor.is_some_and(|f| f > ancestor) {
            *floor = Some(ancestor);
        }
    }

    /// Handle one event. Returns `false` when the event was skipped by the
    /// resume floor, `true` when it was dispatched (or had no handler).
    pub async fn process(&self, event: &Event) -> Result<bool, EngineError> {
        let checkpoint = event.checkpoint();
        if self
            .floor
            .lock()
            .unwrap()
            .is_some_and(|floor| checkpoint <= floor)
        {
            return Ok(false);
        }

        self.store.begin_event(checkpoint);
        self.handlers
            .dispatch(event, &self.store)
            .await
            .map_err(|e| EngineError::HandlerFailed {
                checkpoint,
                source_name: event.source_name().to_string(),
                event: event.event_name().to_string(),
                reason: e.to_string(),
            })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventide_core::event::SetupEvent;
    use eventide_core::handler::{EventHandler, HandlerError, OnConflict, Patch, RowStore};
    use eventide_store::schema::{ColumnSchema, SchemaDescription, TableSchema};
    use eventide_store::MemIndexingStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn schema() -> SchemaDescription {
        SchemaDescription {
            tables: vec![TableSchema {
                name: "counters".into(),
                columns: vec![
                    ColumnSchema {
                        name: "id".into(),
                        sql_type: "TEXT".into(),
                        nullable: false,
                    },
                    ColumnSchema {
                        name: "value".into(),
                        sql_type: "BIGINT".into(),
                        nullable: false,
                    },
                ],
                primary_key: vec!["id".into()],
                onchain: true,
            }],
        }
    }

    fn event(block: u64, index: u32) -> Event {
        Event::Setup(SetupEvent {
            checkpoint: Checkpoint::new(block * 12, 1, block, 0, index),
            source: "Token".into(),
            chain_id: 1,
            start_block: block,
        })
    }

    /// Increments a counter row through find-then-write.
    struct CountingHandler;

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &Event, store: &dyn RowStore) -> Result<(), HandlerError> {
            match store.find("counters", &json!("total")).await? {
                None => {
                    store
                        .insert(
                            "counters",
                            vec![json!({ "id": "total", "value": 1 })],
                            OnConflict::Error,
                        )
                        .await?;
                }
                Some(row) => {
                    let next = row["value"].as_i64().unwrap_or(0) + 1;
                    store
                        .update(
                            "counters",
                            &json!("total"),
                            Patch::object(json!({ "value": next })),
                        )
                        .await?;
                }
            }
            Ok(())
        }
    }

    fn counting_runner(resume: Option<Checkpoint>) -> Runner<MemIndexingStore> {
        let mut handlers = HandlerRegistry::new();
        handlers.register("Token", "setup", Arc::new(CountingHandler));
        Runner::new(handlers, MemIndexingStore::new(schema()), resume)
    }

    async fn counter_value(runner: &Runner<MemIndexingStore>) -> i64 {
        runner
            .store()
            .find("counters", &json!("total"))
            .await
            .unwrap()
            .map(|row| row["value"].as_i64().unwrap())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn events_increment_counter() {
        // Events at blocks 100, 101, 102 — the counter ends at 3.
        let runner = counting_runner(None);
        for block in [100, 101, 102] {
            assert!(runner.process(&event(block, 0)).await.unwrap());
        }
        assert_eq!(counter_value(&runner).await, 3);
    }

    #[tokio::test]
    async fn resume_floor_skips_committed_events() {
        // Instance resumed at checkpoint C: events at or below C are not
        // re-delivered, the first event above C is.
        let resume = Checkpoint::new(1005, 1, 50, 0, 0);
        let runner = counting_runner(Some(resume));

        let below = Event::Setup(SetupEvent {
            checkpoint: Checkpoint::new(1005, 1, 50, 0, 0),
            source: "Token".into(),
            chain_id: 1,
            start_block: 50,
        });
        assert!(!runner.process(&below).await.unwrap());

        let above = event(51, 0);
        assert!(runner.process(&above).await.unwrap());
        assert_eq!(counter_value(&runner).await, 1);
    }

    #[tokio::test]
    async fn reorg_rollback_and_redelivery() {
        // Blocks 100–104 delivered, then 103–104 reorg away and their
        // canonical replacements are re-delivered.
        let runner = counting_runner(None);
        for block in 100..=104 {
            runner.process(&event(block, 0)).await.unwrap();
        }
        assert_eq!(counter_value(&runner).await, 5);

        // Roll back past blocks 103 and 104.
        let ancestor = Checkpoint::new(102 * 12, 1, 102, u32::MAX, u32::MAX);
        runner.store().rollback(ancestor).await.unwrap();
        runner.lower_floor(ancestor);
        assert_eq!(counter_value(&runner).await, 3);

        // The canonical 103'–104' replace them.
        for block in [103, 104] {
            runner.process(&event(block, 1)).await.unwrap();
        }
        assert_eq!(counter_value(&runner).await, 5);
    }

    #[tokio::test]
    async fn at_most_one_handler_in_flight() {
        struct ConcurrencyProbe {
            active: Arc<AtomicU32>,
            max_seen: Arc<AtomicU32>,
        }

        #[async_trait]
        impl EventHandler for ConcurrencyProbe {
            async fn handle(
                &self,
                _event: &Event,
                _store: &dyn RowStore,
            ) -> Result<(), HandlerError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let active = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            "Token",
            "setup",
            Arc::new(ConcurrencyProbe {
                active: active.clone(),
                max_seen: max_seen.clone(),
            }),
        );
        let runner = Runner::new(handlers, MemIndexingStore::new(schema()), None);

        for block in 100..120 {
            runner.process(&event(block, 0)).await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_error_carries_event_context() {
        struct Failing;

        #[async_trait]
        impl EventHandler for Failing {
            async fn handle(
                &self,
                _event: &Event,
                _store: &dyn RowStore,
            ) -> Result<(), HandlerError> {
                Err(HandlerError::Failed("boom".into()))
            }
        }

        let mut handlers = HandlerRegistry::new();
        handlers.register("Token", "setup", Arc::new(Failing));
        let runner = Runner::new(handlers, MemIndexingStore::new(schema()), None);

        let err = runner.process(&event(100, 0)).await.unwrap_err();
        match err {
            EngineError::HandlerFailed {
                checkpoint,
                source_name,
                event,
                ..
            } => {
                assert_eq!(checkpoint.block_number, 100);
                assert_eq!(source_name, "Token");
                assert_eq!(event, "setup");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
