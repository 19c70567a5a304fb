//! Errors surfaced to user handlers by the indexing store.

use thiserror::Error;

/// Errors returned by [`crate::handler::RowStore`] operations.
///
/// The first three are programmer errors in handler code; the constraint
/// variants are user-schema violations. Any of them left uncaught by the
/// handler terminates indexing (the orchestrator reports the failing
/// event's checkpoint and exits non-zero).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced table does not exist in the user schema.
    #[error("table '{table}' is not declared in the schema")]
    UndefinedTable { table: String },

    /// The table exists but is not an onchain table, so handlers may not
    /// write to it.
    #[error("table '{table}' is not an onchain table and cannot be written from a handler")]
    InvalidStoreMethod { table: String },

    /// `update` targeted a row that does not exist.
    #[error("no row in '{table}' with key {key}")]
    RecordNotFound { table: String, key: String },

    /// The `sql` escape hatch only accepts read statements; writes must go
    /// through the typed API so the reorg journal stays sound.
    #[error("raw sql is read-only; statement rejected: {statement}")]
    ReadOnlySql { statement: String },

    /// Unique constraint violated.
    #[error("unique constraint violated on '{table}': {detail}")]
    UniqueConstraint { table: String, detail: String },

    /// NOT NULL constraint violated.
    #[error("not-null constraint violated on '{table}': {detail}")]
    NotNullConstraint { table: String, detail: String },

    /// CHECK constraint violated.
    #[error("check constraint violated on '{table}': {detail}")]
    CheckConstraint { table: String, detail: String },

    /// Row payload could not be encoded or decoded.
    #[error("row serialization error: {0}")]
    Serialization(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    /// Returns `true` for mistakes in handler code (as opposed to
    /// infrastructure failures).
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            Self::UndefinedTable { .. }
                | Self::InvalidStoreMethod { .. }
                | Self::RecordNotFound { .. }
                | Self::ReadOnlySql { .. }
        )
    }

    /// Returns `true` for user-schema constraint violations.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            Self::UniqueConstraint { .. }
                | Self::NotNullConstraint { .. }
                | Self::CheckConstraint { .. }
        )
    }
}
