//! `BlockchainClient`: the abstract view of the upstream chain.
//!
//! Two implementations ship here: [`BitcoinRpcBlockchainClient`], which
//! talks to a real Bitcoin-family JSON-RPC node over raw
//! `reqwest::blocking` calls, and [`InMemoryBlockchainClient`], a scriptable
//! fixture used by the engine's own tests to drive exact reorg scenarios.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_txid: String,
    pub prev_vout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value_satoshis: u64,
    pub script_asm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u32,
    pub hash: String,
    pub transactions: Vec<Transaction>,
}

/// Abstract upstream chain. All methods may suspend (network I/O); callers
/// must not straddle a suspension with a mutation of engine state.
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    async fn tip_height(&self) -> EngineResult<u32>;
    /// Fails (not panics) if `height` is beyond the current tip.
    async fn block_hash(&self, height: u32) -> EngineResult<String>;
    async fn block(&self, height: u32) -> EngineResult<Block>;
    async fn raw_transaction(&self, txid: &str) -> EngineResult<Transaction>;
}

/// Exponential backoff around a single upstream attempt. The closure is
/// handed a per-attempt timeout that doubles on every retry: timeout `t0`,
/// then `t0 * 2^k` on the k-th retry.
pub async fn with_retry<T, F, Fut>(
    request_timeout: Duration,
    max_retries: u32,
    mut attempt: F,
) -> EngineResult<T>
where
    F: FnMut(Duration) -> Fut,
    Fut: std::future::Future<Output = EngineResult<T>>,
{
    let mut last_err = None;
    for k in 0..=max_retries {
        let timeout = request_timeout * 2u32.pow(k);
        match attempt(timeout).await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && k < max_retries => {
                last_err = Some(e);
                tokio::time::sleep(timeout).await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| EngineError::UpstreamError("retries exhausted".into())))
}

/// Real upstream: Bitcoin Core-compatible JSON-RPC node.
///
/// Every method goes through the same raw JSON-RPC path so all four RPC
/// calls get a fresh, doubling timeout on each retry attempt rather than
/// one baked in at construction.
pub struct BitcoinRpcBlockchainClient {
    url: String,
    user: String,
    pass: String,
    request_timeout: Duration,
    max_retries: u32,
    // Bitcoin Core's JSON-RPC connection handling is not safe for
    // unbounded concurrent callers from this client; one request at a time
    // matches the single-in-flight-tick contract of the sync engine.
    lock: TokioMutex<()>,
}

impl BitcoinRpcBlockchainClient {
    pub fn new(
        url: String,
        user: String,
        pass: String,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            url,
            user,
            pass,
            request_timeout,
            max_retries,
            lock: TokioMutex::new(()),
        }
    }

    async fn call(&self, method: &'static str, params: Value) -> EngineResult<Value> {
        let _guard = self.lock.lock().await;
        let request_timeout = self.request_timeout;
        let max_retries = self.max_retries;
        let handle = BitcoinRpcBlockchainClientHandle {
            url: self.url.clone(),
            user: self.user.clone(),
            pass: self.pass.clone(),
        };
        with_retry(request_timeout, max_retries, move |timeout| {
            let handle = BitcoinRpcBlockchainClientHandle {
                url: handle.url.clone(),
                user: handle.user.clone(),
                pass: handle.pass.clone(),
            };
            let params = params.clone();
            async move {
                tokio::task::spawn_blocking(move || handle.rpc_call(timeout, method, params))
                    .await
                    .map_err(|e| EngineError::UpstreamError(format!("blocking task join error: {e}")))?
            }
        })
        .await
    }
}

/// Plain-data clone of the connection parameters, movable into
/// `spawn_blocking` without dragging the tokio mutex or the typed RPC
/// client handle along.
struct BitcoinRpcBlockchainClientHandle {
    url: String,
    user: String,
    pass: String,
}

impl BitcoinRpcBlockchainClientHandle {
    fn rpc_call(&self, timeout: Duration, method: &str, params: Value) -> EngineResult<Value> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::UpstreamError(format!("building http client: {e}")))?;

        let response = client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&serde_json::json!({
                "jsonrpc": "1.0",
                "id": "sidetree-anchor",
                "method": method,
                "params": params,
            }))
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    crate::metrics::record_upstream_error("timeout");
                    EngineError::UpstreamTimeout(format!("{method}: {e}"))
                } else {
                    crate::metrics::record_upstream_error("transport");
                    EngineError::UpstreamError(format!("{method}: {e}"))
                }
            })?;

        let json: Value = response.json().map_err(|e| {
            crate::metrics::record_upstream_error("malformed");
            EngineError::UpstreamMalformed(format!("{method}: non-JSON response: {e}"))
        })?;

        if let Some(err) = json.get("error") {
            if !err.is_null() {
                crate::metrics::record_upstream_error("rpc");
                return Err(EngineError::UpstreamError(format!("{method}: rpc error {err}")));
            }
        }

        json.get("result").cloned().ok_or_else(|| {
            crate::metrics::record_upstream_error("malformed");
            EngineError::UpstreamMalformed(format!("{method}: missing result field"))
        })
    }
}

fn parse_transaction(tx: &Value) -> EngineResult<Transaction> {
    let txid = tx
        .get("txid")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::UpstreamMalformed("transaction missing txid".into()))?
        .to_string();

    let inputs = tx
        .get("vin")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::UpstreamMalformed("transaction missing vin".into()))?
        .iter()
        .filter_map(|vin| {
            let prev_txid = vin.get("txid").and_then(Value::as_str)?.to_string();
            let prev_vout = vin.get("vout").and_then(Value::as_u64)? as u32;
            Some(TxIn { prev_txid, prev_vout })
        })
        .collect();

    let outputs = tx
        .get("vout")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::UpstreamMalformed("transaction missing vout".into()))?
        .iter()
        .map(|vout| {
            let btc = vout
                .get("value")
                .and_then(Value::as_f64)
                .ok_or_else(|| EngineError::UpstreamMalformed("vout missing value".into()))?;
            // Multiply once and round once (DESIGN.md: no repeated rounding).
            let value_satoshis = (btc * 100_000_000.0).round() as u64;
            let script_asm = vout
                .get("scriptPubKey")
                .and_then(|s| s.get("asm"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            Ok(TxOut { value_satoshis, script_asm })
        })
        .collect::<EngineResult<Vec<_>>>()?;

    Ok(Transaction { txid, inputs, outputs })
}

#[async_trait]
impl BlockchainClient for BitcoinRpcBlockchainClient {
    async fn tip_height(&self) -> EngineResult<u32> {
        let result = self.call("getblockcount", serde_json::json!([])).await?;
        result
            .as_u64()
            .map(|h| h as u32)
            .ok_or_else(|| EngineError::UpstreamMalformed("getblockcount: non-numeric result".into()))
    }

    async fn block_hash(&self, height: u32) -> EngineResult<String> {
        let result = self.call("getblockhash", serde_json::json!([height])).await?;
        result
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| EngineError::UpstreamMalformed("getblockhash: non-string result".into()))
    }

    async fn block(&self, height: u32) -> EngineResult<Block> {
        let hash = self.block_hash(height).await?;
        let result = self
            .call("getblock", serde_json::json!([hash.clone(), 2]))
            .await?;

        let tx_array = result
            .get("tx")
            .and_then(Value::as_array)
            .ok_or_else(|| EngineError::UpstreamMalformed("getblock: missing tx array".into()))?;

        let transactions = tx_array
            .iter()
            .map(parse_transaction)
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(Block { height, hash, transactions })
    }

    async fn raw_transaction(&self, txid: &str) -> EngineResult<Transaction> {
        let result = self
            .call("getrawtransaction", serde_json::json!([txid, true]))
            .await?;
        parse_transaction(&result)
    }
}

/// Scriptable in-memory chain, used by engine tests to drive exact reorg
/// scenarios without a live node. `chain` holds the currently-canonical
/// sequence of blocks (index == height); [`InMemoryBlockchainClient::reorg`]
/// truncates and replaces the tail to simulate an upstream reorganization.
pub struct InMemoryBlockchainClient {
    chain: std::sync::Mutex<Vec<Block>>,
}

impl InMemoryBlockchainClient {
    pub fn new(chain: Vec<Block>) -> Self {
        Self { chain: std::sync::Mutex::new(chain) }
    }

    pub fn push_block(&self, block: Block) {
        self.chain.lock().unwrap().push(block);
    }

    /// Replace everything from `from_height` onward with `replacement`
    /// blocks (heights renumbered starting at `from_height`).
    pub fn reorg(&self, from_height: u32, replacement: Vec<Block>) {
        let mut chain = self.chain.lock().unwrap();
        chain.truncate(from_height as usize);
        for (i, mut block) in replacement.into_iter().enumerate() {
            block.height = from_height + i as u32;
            chain.push(block);
        }
    }
}

#[async_trait]
impl BlockchainClient for InMemoryBlockchainClient {
    async fn tip_height(&self) -> EngineResult<u32> {
        let chain = self.chain.lock().unwrap();
        if chain.is_empty() {
            return Err(EngineError::UpstreamError("empty chain".into()));
        }
        Ok(chain.len() as u32 - 1)
    }

    async fn block_hash(&self, height: u32) -> EngineResult<String> {
        let chain = self.chain.lock().unwrap();
        chain
            .get(height as usize)
            .map(|b| b.hash.clone())
            .ok_or_else(|| EngineError::UpstreamError(format!("height {height} beyond tip")))
    }

    async fn block(&self, height: u32) -> EngineResult<Block> {
        let chain = self.chain.lock().unwrap();
        chain
            .get(height as usize)
            .cloned()
            .ok_or_else(|| EngineError::UpstreamError(format!("height {height} beyond tip")))
    }

    async fn raw_transaction(&self, txid: &str) -> EngineResult<Transaction> {
        let chain = self.chain.lock().unwrap();
        for block in chain.iter() {
            for tx in &block.transactions {
                if tx.txid == txid {
                    return Ok(tx.clone());
                }
            }
        }
        Err(EngineError::UpstreamError(format!("unknown txid {txid}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(height: u32, hash: &str) -> Block {
        Block { height, hash: hash.to_string(), transactions: vec![] }
    }

    #[tokio::test]
    async fn in_memory_client_reports_tip_and_hash() {
        let client = InMemoryBlockchainClient::new(vec![block(0, "h0"), block(1, "h1")]);
        assert_eq!(client.tip_height().await.unwrap(), 1);
        assert_eq!(client.block_hash(1).await.unwrap(), "h1");
        assert!(client.block_hash(2).await.is_err());
    }

    #[tokio::test]
    async fn in_memory_client_reorg_replaces_tail() {
        let client = InMemoryBlockchainClient::new(vec![block(0, "h0"), block(1, "h1"), block(2, "h2")]);
        client.reorg(1, vec![block(0, "h1-new"), block(0, "h2-new")]);
        assert_eq!(client.tip_height().await.unwrap(), 2);
        assert_eq!(client.block_hash(1).await.unwrap(), "h1-new");
        assert_eq!(client.block_hash(2).await.unwrap(), "h2-new");
    }
}
