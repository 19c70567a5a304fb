//! Storage-layer errors (cache, journal, registry).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The cache refused a row above the chain's finalized height.
    #[error("chain {chain_id}: block {block} is above the finalized height {finalized}")]
    AboveFinalized {
        chain_id: u64,
        block: u64,
        finalized: u64,
    },

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The schema stored for an instance does not match this build.
    #[error("schema conflict: {0}")]
    SchemaConflict(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}
