//! Sync-layer errors.

use thiserror::Error;

use eventide_rpc::RpcError;
use eventide_store::StorageError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No common ancestor inside the finality window. The chain diverged
    /// below the depth reorgs are assumed impossible at; the instance must
    /// stop rather than guess.
    #[error("chain {chain_id}: reorg deeper than the finality window ({depth} blocks)")]
    DeepReorg { chain_id: u64, depth: u64 },

    /// The node answers for a different chain than configured.
    #[error("chain {expected}: node reports chain id {actual}")]
    ChainIdMismatch { expected: u64, actual: u64 },

    /// The downstream consumer went away; shutting down.
    #[error("event channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Deep reorgs and chain-id mismatches cannot be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeepReorg { .. } | Self::ChainIdMismatch { .. })
    }
}
