//! eventide-store — durable state for the indexing engine.
//!
//! Three storage domains with different ownership rules:
//!
//! - the **sync cache** (`sync` schema): shared across instances,
//!   multi-writer safe, finalized chain data only;
//! - the **indexing store**: per-instance `{instance_id}__*` user tables
//!   plus `{instance_id}_reorg__*` journals, written only through the
//!   serialized handler API;
//! - the **instance registry** (`_eventide_meta`): instance ids, build
//!   ids, heartbeats, live-view cutover, and stale-table GC.

pub mod cache;
pub mod error;
pub mod indexing;
pub mod journal;
pub mod memory;
pub mod registry;
pub mod schema;

pub use cache::{ChunkData, SyncCache};
pub use error::StorageError;
pub use indexing::PgIndexingStore;
pub use memory::MemIndexingStore;
pub use registry::{InstanceHandle, InstanceRegistry};
pub use schema::{ColumnSchema, SchemaDescription, TableSchema};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::schema::{ColumnSchema, SchemaDescription, TableSchema};

    /// A one-table schema used across the store tests.
    pub fn counter_schema() -> SchemaDescription {
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
}
