//! RPC error classification.
//!
//! Transient errors (timeouts, 5xx, 429) are retried indefinitely with
//! capped exponential backoff; permanent errors abort the fetch and are
//! escalated by the caller; "response too large" is neither — it tells the
//! historical sync to bisect its block range.

use thiserror::Error;

use crate::wire::JsonRpcErrorObject;

#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection-level failure (refused, reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// HTTP 429 from the provider.
    #[error("rate limited by provider")]
    RateLimited,

    /// Non-success HTTP status.
    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    /// JSON-RPC error object returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node rejected the request because the response would be too
    /// large; the caller should shrink the block range and retry.
    #[error("response too large: {message}")]
    ResponseTooLarge { message: String },

    /// The response could not be deserialized.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    /// Classify a JSON-RPC error object from the node.
    pub fn from_rpc(err: JsonRpcErrorObject) -> Self {
        if is_too_large(&err) {
            Self::ResponseTooLarge {
                message: err.message,
            }
        } else {
            Self::Rpc {
                code: err.code,
                message: err.message,
            }
        }
    }

    /// Transient errors are retried with backoff, without an attempt cap.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } | Self::RateLimited => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Drives the historical chunk bisection.
    pub fn is_response_too_large(&self) -> bool {
        matches!(self, Self::ResponseTooLarge { .. })
    }
}

/// Providers signal oversized `eth_getLogs` responses inconsistently:
/// -32005 (limit exceeded) is the standard code, but several return
/// -32000 or -32602 with a recognizable message.
fn is_too_large(err: &JsonRpcErrorObject) -> bool {
    if err.code == -32005 {
        return true;
    }
    let msg = err.message.to_ascii_lowercase();
    msg.contains("too large")
        || msg.contains("too many")
        || msg.contains("query returned more than")
        || msg.contains("block range")
        || msg.contains("response size")
}
