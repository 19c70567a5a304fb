//! eventide-rpc — rate-limited JSON-RPC client for the sync layer.
//!
//! One [`RpcClient`] per chain: token-bucket pacing, a separate in-flight
//! cap, unlimited capped-backoff retry for transient failures, and typed
//! `eth_*` / `trace_*` methods returning parsed chain records.

pub mod client;
pub mod error;
pub mod limiter;
pub mod retry;
pub mod types;
pub mod wire;

pub use client::{RpcClient, RpcClientConfig};
pub use error::RpcError;
pub use limiter::TokenBucket;
pub use retry::Backoff;
pub use types::BlockWithTransactions;
