//! eventide-engine — the orchestrator.
//!
//! ```text
//! EngineBuilder → Engine::run(shutdown)
//!                     ├── InstanceRegistry  (build/instance ids, heartbeat, cutover, GC)
//!                     ├── per-chain tasks   (historical → realtime, via eventide-sync)
//!                     ├── WatermarkMerge    (cross-chain total order)
//!                     ├── Runner            (one handler in flight, journaled writes)
//!                     └── EngineMetrics / StatusSnapshot (for the HTTP layer)
//! ```

pub mod engine;
pub mod error;
pub mod metrics;
pub mod runner;

pub use engine::{Engine, EngineBuilder};
pub use error::{exit_code, EngineError, EXIT_FATAL, EXIT_RESTART};
pub use metrics::EngineMetrics;
pub use runner::Runner;
