//! eventide-sync — gets chain data from the node to the engine.
//!
//! Historical sync backfills the shared cache and replays it as an ordered
//! event stream; realtime sync follows the tip, detects reorgs against the
//! local unfinalized window, and flushes aged blocks into the cache. Both
//! phases assemble events through the same per-block code so checkpoints
//! are identical across runs.

pub mod assemble;
pub mod chunk;
pub mod error;
pub mod historical;
pub mod realtime;

pub use assemble::{block_end_checkpoint, SourceSet};
pub use chunk::{ChunkSizer, INITIAL_CHUNK_SIZE};
pub use error::SyncError;
pub use historical::{HistoricalConfig, HistoricalOutcome, HistoricalSync};
pub use realtime::{ChainMessage, LocalChain, RealtimeConfig, RealtimeSync};
