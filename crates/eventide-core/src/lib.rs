//! eventide-core — foundation for the cross-chain indexing engine.
//!
//! # Architecture
//!
//! ```text
//! EngineConfig → Vec<Source>
//!                     │
//!   historical/realtime sync (eventide-sync) → per-chain event streams
//!                     │
//!               WatermarkMerge      (total order across chains)
//!                     │
//!               HandlerRegistry → RowStore (journaled user writes)
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod merger;
pub mod ranges;
pub mod source;
pub mod status;

pub use checkpoint::Checkpoint;
pub use config::{EngineConfig, NetworkConfig};
pub use error::StoreError;
pub use event::{Block, Event, Log};
pub use handler::{EventHandler, HandlerRegistry, JournaledStore, OnConflict, Patch, RowStore};
pub use merger::WatermarkMerge;
pub use ranges::{BlockRange, RangeSet};
pub use source::Source;
pub use status::{ChainStatus, InstanceStatus, StatusSnapshot};
