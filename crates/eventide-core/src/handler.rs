//! User handler traits, the store surface handlers write through, and the
//! handler registry keyed by `(contract, event)`.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::error::StoreError;
use crate::event::Event;

// ─── Store surface ────────────────────────────────────────────────────────────

/// New column values for an update or conflict resolution: either a plain
/// column → value object, or a function of the current row.
#[derive(Clone)]
pub enum Patch {
    /// Column name → new value.
    Object(Map<String, Value>),
    /// Compute new column values from the current row.
    With(Arc<dyn Fn(&Value) -> Map<String, Value> + Send + Sync>),
}

impl Patch {
    /// Convenience constructor from a JSON object value.
    pub fn object(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Object(map),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                Self::Object(map)
            }
        }
    }

    /// Resolve the patch against the current row.
    pub fn resolve(&self, current: &Value) -> Map<String, Value> {
        match self {
            Self::Object(map) => map.clone(),
            Self::With(f) => f(current),
        }
    }
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(map) => f.debug_tuple("Object").field(map).finish(),
            Self::With(_) => f.write_str("With(<fn>)"),
        }
    }
}

/// What `insert` does when a row with the same primary key already exists.
#[derive(Debug, Clone)]
pub enum OnConflict {
    /// Surface the unique-constraint violation.
    Error,
    /// Keep the existing row untouched.
    DoNothing,
    /// Update the existing row with the patch.
    DoUpdate(Patch),
}

/// The write API exposed to user handlers.
///
/// Rows are JSON objects keyed by column name; `key` is either an object of
/// primary-key columns or, for single-column keys, the bare key value.
/// Implementations serialize all operations (one in flight at a time), so a
/// `find` followed by an `update` inside one handler is race-free.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Look up a row by primary key.
    async fn find(&self, table: &str, key: &Value) -> Result<Option<Value>, StoreError>;

    /// Insert rows, returning them as stored.
    ///
    /// With [`OnConflict::DoUpdate`] and more than one row, each row is
    /// resolved with a find-then-insert-or-update pair; the batch is atomic
    /// per row, not across rows.
    async fn insert(
        &self,
        table: &str,
        rows: Vec<Value>,
        on_conflict: OnConflict,
    ) -> Result<Vec<Value>, StoreError>;

    /// Update the row with the given key; errors with
    /// [`StoreError::RecordNotFound`] when no row matches.
    async fn update(&self, table: &str, key: &Value, patch: Patch) -> Result<Value, StoreError>;

    /// Delete the row with the given key; returns whether a row existed.
    async fn delete(&self, table: &str, key: &Value) -> Result<bool, StoreError>;

    /// Read-only escape hatch. Statements other than `SELECT`/`WITH` are
    /// rejected — writes must go through the typed API so every mutation is
    /// journaled.
    async fn sql(&self, statement: &str) -> Result<Vec<Value>, StoreError>;
}

/// Engine-facing extension of [`RowStore`]: checkpoint tagging for journal
/// rows, reorg rollback, and journal pruning.
#[async_trait]
pub trait JournaledStore: RowStore {
    /// Tag subsequent writes with the checkpoint of the event being handled.
    fn begin_event(&self, checkpoint: Checkpoint);

    /// Undo every journaled write with checkpoint greater than `ancestor`,
    /// newest first. Returns the number of journal rows replayed.
    async fn rollback(&self, ancestor: Checkpoint) -> Result<u64, StoreError>;

    /// Drop journal rows at or below `finalized` — they can never be rolled
    /// back. Returns the number of rows pruned.
    async fn prune(&self, finalized: Checkpoint) -> Result<u64, StoreError>;
}

// ─── Handlers ─────────────────────────────────────────────────────────────────

/// Error returned by a user handler.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure raised by handler business logic.
    #[error("handler failed: {0}")]
    Failed(String),
}

/// A user-supplied event handler.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event, store: &dyn RowStore) -> Result<(), HandlerError>;
}

/// Registry of handlers keyed by `(source name, event name)`.
///
/// Setup handlers register under the reserved event name `"setup"`, block
/// handlers under `"block"`.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn EventHandler>>,
}

/// Reserved event name for per-contract setup handlers.
pub const SETUP_EVENT: &str = "setup";
/// Reserved event name for block-interval handlers.
pub const BLOCK_EVENT: &str = "block";

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one event of one source. A second
    /// registration for the same key replaces the first.
    pub fn register(
        &mut self,
        source: impl Into<String>,
        event: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        self.handlers.insert((source.into(), event.into()), handler);
    }

    /// Look up the handler for an event, if any is registered.
    pub fn get(&self, source: &str, event: &str) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&(source.to_string(), event.to_string()))
    }

    /// Dispatch an event to its handler. Events without a registered
    /// handler are skipped.
    pub async fn dispatch(
        &self,
        event: &Event,
        store: &dyn RowStore,
    ) -> Result<bool, HandlerError> {
        match self.get(event.source_name(), event.event_name()) {
            Some(handler) => {
                handler.handle(event, store).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}
