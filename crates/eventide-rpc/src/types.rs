//! Raw JSON-RPC payloads and their conversion into chain records.
//!
//! Nodes return quantities as `0x`-prefixed hex strings; everything here
//! parses defensively and reports malformed payloads instead of folding
//! them to zero.

use serde::Deserialize;
use serde_json::Value;

use eventide_core::event::{Block, CallTrace, Log, Transaction, TransactionReceipt};

/// Parse a hex quantity (with or without `0x`).
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

fn hex_field(v: &Value, field: &str) -> Result<u64, String> {
    v.get(field)
        .and_then(Value::as_str)
        .and_then(parse_hex_u64)
        .ok_or_else(|| format!("missing or malformed field '{field}'"))
}

fn str_field(v: &Value, field: &str) -> Result<String, String> {
    v.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("missing field '{field}'"))
}

/// A block header with its transactions, as returned by
/// `eth_getBlockByNumber` / `eth_getBlockByHash`.
#[derive(Debug, Clone)]
pub struct BlockWithTransactions {
    pub block: Block,
    /// Empty when the block was fetched with transaction hashes only.
    pub transactions: Vec<Transaction>,
}

/// Convert a block response. `Null` means the block does not exist.
pub fn block_from_value(
    chain_id: u64,
    v: &Value,
) -> Result<Option<BlockWithTransactions>, String> {
    if v.is_null() {
        return Ok(None);
    }
    let block = Block {
        chain_id,
        number: hex_field(v, "number")?,
        hash: str_field(v, "hash")?,
        parent_hash: str_field(v, "parentHash")?,
        timestamp: hex_field(v, "timestamp")?,
    };
    let mut transactions = Vec::new();
    if let Some(txs) = v.get("transactions").and_then(Value::as_array) {
        for tx in txs {
            // Hash-only blocks carry strings here; skip those.
            if tx.is_object() {
                transactions.push(transaction_from_value(tx)?);
            }
        }
    }
    Ok(Some(BlockWithTransactions {
        block,
        transactions,
    }))
}

pub fn transaction_from_value(v: &Value) -> Result<Transaction, String> {
    Ok(Transaction {
        hash: str_field(v, "hash")?,
        block_hash: str_field(v, "blockHash")?,
        block_number: hex_field(v, "blockNumber")?,
        transaction_index: hex_field(v, "transactionIndex")? as u32,
        from: str_field(v, "from")?,
        to: v.get("to").and_then(Value::as_str).map(str::to_string),
        value: str_field(v, "value").unwrap_or_else(|_| "0x0".into()),
        input: str_field(v, "input").unwrap_or_else(|_| "0x".into()),
    })
}

/// Convert an `eth_getLogs` response. Logs flagged `removed` (already
/// reorged away by the node) are dropped.
pub fn logs_from_value(v: &Value) -> Result<Vec<Log>, String> {
    let arr = v.as_array().ok_or("eth_getLogs did not return an array")?;
    let mut logs = Vec::with_capacity(arr.len());
    for raw in arr {
        if raw.get("removed").and_then(Value::as_bool) == Some(true) {
            continue;
        }
        let topics = raw
            .get("topics")
            .and_then(Value::as_array)
            .map(|t| {
                t.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        logs.push(Log {
            address: str_field(raw, "address")?,
            topics,
            data: str_field(raw, "data").unwrap_or_else(|_| "0x".into()),
            block_number: hex_field(raw, "blockNumber")?,
            block_hash: str_field(raw, "blockHash")?,
            transaction_hash: str_field(raw, "transactionHash")?,
            transaction_index: hex_field(raw, "transactionIndex")? as u32,
            log_index: hex_field(raw, "logIndex")? as u32,
        });
    }
    Ok(logs)
}

pub fn receipt_from_value(v: &Value) -> Result<Option<TransactionReceipt>, String> {
    if v.is_null() {
        return Ok(None);
    }
    Ok(Some(TransactionReceipt {
        transaction_hash: str_field(v, "transactionHash")?,
        block_number: hex_field(v, "blockNumber")?,
        status: hex_field(v, "status").unwrap_or(1),
        gas_used: hex_field(v, "gasUsed").unwrap_or(0),
        contract_address: v
            .get("contractAddress")
            .and_then(Value::as_str)
            .map(str::to_string),
    }))
}

/// One entry of a `trace_block` response (parity-style flat traces).
#[derive(Debug, Deserialize)]
struct RawTrace {
    #[serde(default)]
    action: Value,
    #[serde(default)]
    result: Value,
    #[serde(rename = "transactionHash")]
    transaction_hash: Option<String>,
    #[serde(rename = "transactionPosition")]
    transaction_position: Option<u64>,
    #[serde(rename = "blockNumber")]
    block_number: Option<u64>,
    #[serde(rename = "type", default)]
    kind: String,
}

/// Convert a `trace_block` response into call traces. Non-call entries
/// (rewards, creates, suicides) are dropped; `trace_index` follows the
/// node's depth-first order within the block.
pub fn call_traces_from_value(v: &Value) -> Result<Vec<CallTrace>, String> {
    let arr = v.as_array().ok_or("trace_block did not return an array")?;
    let mut traces = Vec::new();
    for (i, raw) in arr.iter().enumerate() {
        let parsed: RawTrace =
            serde_json::from_value(raw.clone()).map_err(|e| format!("trace entry {i}: {e}"))?;
        if parsed.kind != "call" {
            continue;
        }
        let (Some(tx_hash), Some(tx_pos), Some(block_number)) = (
            parsed.transaction_hash,
            parsed.transaction_position,
            parsed.block_number,
        ) else {
            continue;
        };
        let to = match parsed.action.get("to").and_then(Value::as_str) {
            Some(to) => to.to_string(),
            None => continue,
        };
        traces.push(CallTrace {
            from: str_field(&parsed.action, "from")?,
            to,
            input: str_field(&parsed.action, "input").unwrap_or_else(|_| "0x".into()),
            output: parsed
                .result
                .get("output")
                .and_then(Value::as_str)
                .map(str::to_string),
            value: str_field(&parsed.action, "value").unwrap_or_else(|_| "0x0".into()),
            block_number,
            transaction_hash: tx_hash,
            transaction_index: tx_pos as u32,
            trace_index: traces.len() as u32,
        });
    }
    Ok(traces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_hex_basics() {
        assert_eq!(parse_hex_u64("0x1"), Some(1));
        assert_eq!(parse_hex_u64("0xff"), Some(255));
        assert_eq!(parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(parse_hex_u64("0x"), None);
        assert_eq!(parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn block_conversion() {
        let v = json!({
            "number": "0x64",
            "hash": "0xabc",
            "parentHash": "0xdef",
            "timestamp": "0x3e8",
            "transactions": [
                {
                    "hash": "0xt1",
                    "blockHash": "0xabc",
                    "blockNumber": "0x64",
                    "transactionIndex": "0x0",
                    "from": "0xf",
                    "to": "0xt",
                    "value": "0x1",
                    "input": "0x"
                }
            ]
        });
        let parsed = block_from_value(1, &v).unwrap().unwrap();
        assert_eq!(parsed.block.number, 100);
        assert_eq!(parsed.block.timestamp, 1000);
        assert_eq!(parsed.transactions.len(), 1);
        assert_eq!(parsed.transactions[0].transaction_index, 0);
    }

    #[test]
    fn null_block_is_none() {
        assert!(block_from_value(1, &Value::Null).unwrap().is_none());
    }

    #[test]
    fn hash_only_block_has_no_transactions() {
        let v = json!({
            "number": "0x64",
            "hash": "0xabc",
            "parentHash": "0xdef",
            "timestamp": "0x3e8",
            "transactions": ["0xt1", "0xt2"]
        });
        let parsed = block_from_value(1, &v).unwrap().unwrap();
        assert!(parsed.transactions.is_empty());
    }

    #[test]
    fn removed_logs_are_dropped() {
        let v = json!([
            {
                "address": "0xa",
                "topics": ["0x1"],
                "data": "0x",
                "blockNumber": "0x64",
                "blockHash": "0xabc",
                "transactionHash": "0xt",
                "transactionIndex": "0x0",
                "logIndex": "0x0"
            },
            {
                "address": "0xa",
                "topics": ["0x1"],
                "data": "0x",
                "blockNumber": "0x64",
                "blockHash": "0xabc",
                "transactionHash": "0xt",
                "transactionIndex": "0x0",
                "logIndex": "0x1",
                "removed": true
            }
        ]);
        let logs = logs_from_value(&v).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].log_index, 0);
    }

    #[test]
    fn malformed_log_is_an_error() {
        let v = json!([{ "address": "0xa" }]);
        assert!(logs_from_value(&v).is_err());
    }

    #[test]
    fn call_traces_filtered_by_type() {
        let v = json!([
            {
                "type": "call",
                "action": { "from": "0xf", "to": "0xt", "input": "0xa9059cbb", "value": "0x0" },
                "result": { "output": "0x01" },
                "transactionHash": "0xt1",
                "transactionPosition": 2,
                "blockNumber": 100
            },
            {
                "type": "reward",
                "action": { "author": "0xminer" },
                "blockNumber": 100
            }
        ]);
        let traces = call_traces_from_value(&v).unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].to, "0xt");
        assert_eq!(traces[0].transaction_index, 2);
    }
}
