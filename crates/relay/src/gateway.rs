//! Ledger gateway: chain height and log queries against the source chain.
//!
//! [JsonRpcGateway] speaks plain Ethereum JSON-RPC over HTTP (`eth_blockNumber`,
//! `eth_getLogs`). Logs are returned unsorted; ordering is the caller's concern.

use crate::abi::{log_is_removed, log_matches_topic, raw_event_from_log, RawEvent};
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("RPC call timed out after {0:?}")]
    Timeout(Duration),
}

/// Source-ledger access consumed by the scheduler.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Current chain tip.
    async fn latest_height(&self) -> Result<u64, GatewayError>;

    /// Logs emitted by `contract` with first topic `topic0`, in `[from_block, to_block]`.
    async fn get_logs(
        &self,
        contract: Address,
        topic0: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, GatewayError>;
}

fn build_logs_filter(
    address: &Address,
    topic0: Option<&B256>,
    from_block: u64,
    to_block: u64,
) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address.as_slice())),
        "fromBlock": format!("0x{:x}", from_block),
        "toBlock": format!("0x{:x}", to_block),
    });
    // Single-topic filter: [topic0] only (some nodes reject [topic0, null, null, null]).
    if let Some(t0) = topic0 {
        filter["topics"] = json!([format!("0x{}", hex::encode(t0))]);
    }
    filter
}

/// HTTP JSON-RPC gateway.
pub struct JsonRpcGateway {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcGateway {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params
        });
        let resp = self.client.post(&self.url).json(&body).send().await?;
        let json: Value = resp.json().await?;
        if let Some(err) = json.get("error") {
            return Err(GatewayError::Rpc(err.to_string()));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| GatewayError::Malformed("missing result".into()))
    }

    async fn raw_logs(&self, filter: Value) -> Result<Vec<Value>, GatewayError> {
        let result = self.call("eth_getLogs", json!([filter])).await?;
        match result {
            Value::Array(logs) => Ok(logs),
            other => Err(GatewayError::Malformed(format!("getLogs not array: {}", other))),
        }
    }
}

#[async_trait]
impl LedgerGateway for JsonRpcGateway {
    async fn latest_height(&self) -> Result<u64, GatewayError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let s = result
            .as_str()
            .ok_or_else(|| GatewayError::Malformed("blockNumber not string".into()))?;
        let s = s.strip_prefix("0x").unwrap_or(s);
        u64::from_str_radix(s, 16).map_err(|e| GatewayError::Malformed(e.to_string()))
    }

    async fn get_logs(
        &self,
        contract: Address,
        topic0: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawEvent>, GatewayError> {
        let filter = build_logs_filter(&contract, Some(&topic0), from_block, to_block);
        let logs = match self.raw_logs(filter).await {
            Ok(logs) => logs,
            Err(e) => {
                tracing::debug!(reason = %e, "eth_getLogs with topic filter failed, trying address-only");
                let fallback = build_logs_filter(&contract, None, from_block, to_block);
                self.raw_logs(fallback)
                    .await?
                    .into_iter()
                    .filter(|log| log_matches_topic(log, &topic0))
                    .collect()
            }
        };
        Ok(collect_raw_events(&logs, from_block, to_block))
    }
}

/// Convert raw log values, dropping reorged (`removed`) entries and entries without a usable
/// identity. Both are logged; neither can be keyed for replay protection.
fn collect_raw_events(logs: &[Value], from: u64, to: u64) -> Vec<RawEvent> {
    let mut out = Vec::with_capacity(logs.len());
    for log in logs {
        if log_is_removed(log) {
            tracing::warn!(from, to, log = %log, "dropping log flagged removed by the node");
            continue;
        }
        match raw_event_from_log(log) {
            Ok(raw) => out.push(raw),
            Err(e) => tracing::warn!(from, to, reason = %e, log = %log, "dropping log without identity"),
        }
    }
    if !logs.is_empty() && out.is_empty() {
        tracing::warn!(raw_count = logs.len(), from, to, "logs received but none usable");
    }
    out
}
