//! Engine-level errors and their process exit codes.

use thiserror::Error;

use eventide_core::checkpoint::Checkpoint;
use eventide_core::config::ConfigError;
use eventide_core::error::StoreError;
use eventide_store::schema::SchemaError;
use eventide_store::StorageError;
use eventide_sync::SyncError;

/// Exit code for fatal errors (deep reorg, schema conflict, uncaught
/// handler failure, unrecoverable database error).
pub const EXIT_FATAL: i32 = 1;
/// Exit code asking the supervisor for a restart (transient condition).
pub const EXIT_RESTART: i32 = 75;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// A user handler failed; the event's coordinates are attached so the
    /// failure is reproducible.
    #[error("handler for {source_name}:{event} failed at {checkpoint}: {reason}")]
    HandlerFailed {
        checkpoint: Checkpoint,
        source_name: String,
        event: String,
        reason: String,
    },

    /// The heartbeat could not be written for longer than the staleness
    /// window; another instance may have adopted our tables.
    #[error("instance heartbeat lost")]
    HeartbeatLost,
}

impl EngineError {
    /// Process exit code for this error: 75 asks for a restart, 1 is
    /// fatal.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::HeartbeatLost => EXIT_RESTART,
            _ => EXIT_FATAL,
        }
    }
}

/// Exit code for an engine run result: 0 on clean stop.
pub fn exit_code(result: &Result<(), EngineError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(exit_code(&Ok(())), 0);
        assert_eq!(exit_code(&Err(EngineError::HeartbeatLost)), 75);
        assert_eq!(
            exit_code(&Err(EngineError::Sync(SyncError::DeepReorg {
                chain_id: 1,
                depth: 70
            }))),
            1
        );
    }
}
