//! HTTP JSON-RPC client with built-in pacing and reliability:
//!
//! - Token-bucket rate limiting (`max_requests_per_second`)
//! - Separate in-flight cap so one slow provider cannot head-of-line block
//! - Unlimited retry with capped exponential backoff for transient errors
//! - Fallback across multiple endpoint URLs

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use eventide_core::config::{ConfigError, NetworkConfig};
use eventide_core::event::{Block, Log, TransactionReceipt};
use eventide_core::source::TopicFilter;

use crate::error::RpcError;
use crate::limiter::TokenBucket;
use crate::retry::Backoff;
use crate::types::{
    block_from_value, call_traces_from_value, logs_from_value, parse_hex_u64, receipt_from_value,
    BlockWithTransactions,
};
use crate::wire::{JsonRpcRequest, JsonRpcResponse};

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Endpoints tried in order; later entries are fallbacks.
    pub urls: Vec<String>,
    pub max_requests_per_second: u32,
    pub max_concurrent_requests: u32,
    pub request_timeout: Duration,
}

impl RpcClientConfig {
    pub fn from_network(network: &NetworkConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            urls: network.rpc_urls()?,
            max_requests_per_second: network.max_requests_per_second,
            max_concurrent_requests: network.max_concurrent_requests,
            request_timeout: Duration::from_secs(30),
        })
    }
}

/// A rate-limited JSON-RPC client for one chain.
pub struct RpcClient {
    chain_id: u64,
    urls: Vec<String>,
    http: reqwest::Client,
    bucket: TokenBucket,
    inflight: Semaphore,
    backoff: Backoff,
    request_timeout: Duration,
    next_id: AtomicU64,
    requests_sent: AtomicU64,
}

impl RpcClient {
    pub fn new(chain_id: u64, config: RpcClientConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            chain_id,
            urls: config.urls,
            http,
            bucket: TokenBucket::per_second(config.max_requests_per_second),
            inflight: Semaphore::new(config.max_concurrent_requests.max(1) as usize),
            backoff: Backoff::default(),
            request_timeout: config.request_timeout,
            next_id: AtomicU64::new(1),
            requests_sent: AtomicU64::new(0),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Requests sent so far, including retries. Scraped into metrics.
    pub fn request_count(&self) -> u64 {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Send one JSON-RPC request, retrying transient failures indefinitely
    /// with capped backoff and rotating through fallback URLs.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, RpcError> {
        let _permit = self
            .inflight
            .acquire()
            .await
            .expect("inflight semaphore closed");

        let req = JsonRpcRequest::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.bucket.acquire().await;
            let url = &self.urls[(attempt as usize - 1) % self.urls.len()];
            self.requests_sent.fetch_add(1, Ordering::Relaxed);

            match self.send_once(url, &req).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.delay(attempt);
                    tracing::warn!(
                        method = req.method,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        url = %url,
                        "transient rpc failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, url: &str, req: &JsonRpcRequest) -> Result<Value, RpcError> {
        let resp = self.http.post(url).json(req).send().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::Timeout {
                    ms: self.request_timeout.as_millis() as u64,
                }
            } else {
                RpcError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(RpcError::RateLimited);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RpcError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| RpcError::Malformed(e.to_string()))?;
        parsed.into_result().map_err(RpcError::from_rpc)
    }

    // ─── Typed eth methods ───────────────────────────────────────────────

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let v = self.request("eth_blockNumber", vec![]).await?;
        v.as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| RpcError::Malformed(format!("eth_blockNumber returned {v}")))
    }

    /// Verify the node serves the configured chain.
    pub async fn fetch_chain_id(&self) -> Result<u64, RpcError> {
        let v = self.request("eth_chainId", vec![]).await?;
        v.as_str()
            .and_then(parse_hex_u64)
            .ok_or_else(|| RpcError::Malformed(format!("eth_chainId returned {v}")))
    }

    /// `number: None` fetches the latest block. `hydrate` includes full
    /// transaction objects.
    pub async fn get_block_by_number(
        &self,
        number: Option<u64>,
        hydrate: bool,
    ) -> Result<Option<BlockWithTransactions>, RpcError> {
        let tag = match number {
            Some(n) => json!(format!("0x{n:x}")),
            None => json!("latest"),
        };
        let v = self
            .request("eth_getBlockByNumber", vec![tag, json!(hydrate)])
            .await?;
        block_from_value(self.chain_id, &v).map_err(RpcError::Malformed)
    }

    pub async fn get_block_by_hash(
        &self,
        hash: &str,
        hydrate: bool,
    ) -> Result<Option<BlockWithTransactions>, RpcError> {
        let v = self
            .request("eth_getBlockByHash", vec![json!(hash), json!(hydrate)])
            .await?;
        block_from_value(self.chain_id, &v).map_err(RpcError::Malformed)
    }

    pub async fn latest_block(&self) -> Result<Block, RpcError> {
        self.get_block_by_number(None, false)
            .await?
            .map(|b| b.block)
            .ok_or_else(|| RpcError::Malformed("node returned null for latest block".into()))
    }

    /// `eth_getLogs` over an inclusive block range.
    pub async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
        addresses: &[String],
        topics: &TopicFilter,
    ) -> Result<Vec<Log>, RpcError> {
        let mut filter = json!({
            "fromBlock": format!("0x{from_block:x}"),
            "toBlock": format!("0x{to_block:x}"),
        });
        if !addresses.is_empty() {
            filter["address"] = json!(addresses);
        }
        if !topics.topics.is_empty() {
            filter["topics"] = topics_param(topics);
        }
        let v = self.request("eth_getLogs", vec![filter]).await?;
        logs_from_value(&v).map_err(RpcError::Malformed)
    }

    pub async fn get_transaction_receipt(
        &self,
        hash: &str,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let v = self
            .request("eth_getTransactionReceipt", vec![json!(hash)])
            .await?;
        receipt_from_value(&v).map_err(RpcError::Malformed)
    }

    /// Parity-style flat call traces for one block.
    pub async fn trace_block(
        &self,
        number: u64,
    ) -> Result<Vec<eventide_core::event::CallTrace>, RpcError> {
        let v = self
            .request("trace_block", vec![json!(format!("0x{number:x}"))])
            .await?;
        call_traces_from_value(&v).map_err(RpcError::Malformed)
    }
}

/// Render a [`TopicFilter`] as the JSON-RPC `topics` parameter:
/// empty slot → `null`, one value → string, several → array.
fn topics_param(filter: &TopicFilter) -> Value {
    Value::Array(
        filter
            .topics
            .iter()
            .map(|slot| match slot.len() {
                0 => Value::Null,
                1 => json!(slot[0]),
                _ => json!(slot),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_param_shapes() {
        let filter = TopicFilter {
            topics: vec![
                vec!["0xaaa".into()],
                vec![],
                vec!["0x1".into(), "0x2".into()],
            ],
        };
        let param = topics_param(&filter);
        assert_eq!(param[0], "0xaaa");
        assert_eq!(param[1], Value::Null);
        assert_eq!(param[2], json!(["0x1", "0x2"]));
    }
}
