//! L1 JSON-RPC client.
//!
//! Talks to a Bitcoin-Core-style node over HTTP (basic auth, POST mode).
//! The indexer consumes it through the `BtcRpc` trait so it can be mocked.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// L1 client errors
#[derive(Debug, Error)]
pub enum BtcError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transaction not found: {0}")]
    TxNotFound(String),

    #[error("parse error: {0}")]
    Parse(String),
}

/// One deposit-shaped transaction found in a block: it pays the listen
/// address and its sender set could be resolved.
#[derive(Debug, Clone)]
pub struct BlockDeposit {
    pub tx_index: i64,
    pub tx_hash: String,
    /// Every distinct input address, resolution order preserved.
    pub froms: Vec<String>,
    pub to: String,
    pub value_sats: i64,
}

/// Result of scanning one block for deposits.
#[derive(Debug, Clone)]
pub struct BlockScan {
    pub deposits: Vec<BlockDeposit>,
    /// Block header timestamp.
    pub block_time: i64,
}

/// L1 node capabilities the workers need.
#[async_trait]
pub trait BtcRpc: Send + Sync {
    async fn latest_height(&self) -> Result<i64, BtcError>;

    /// Scan one block for transactions paying the listen address, starting
    /// at `from_tx_index` (cursor resume inside a block).
    async fn scan_block(&self, height: i64, from_tx_index: i64) -> Result<BlockScan, BtcError>;

    /// Confirmation count of a transaction; zero while in the mempool.
    async fn confirmations(&self, txid: &str) -> Result<u64, BtcError>;

    /// Broadcast a serialised transaction, returning its txid.
    async fn broadcast(&self, tx_hex: &str) -> Result<String, BtcError>;
}

/// Bitcoin-Core JSON-RPC client.
pub struct BtcClient {
    http: Client,
    url: String,
    user: String,
    pass: String,
    listen_address: String,
}

impl BtcClient {
    pub fn new(url: &str, user: &str, pass: &str, listen_address: &str) -> Self {
        Self {
            http: Client::new(),
            url: url.to_string(),
            user: user.to_string(),
            pass: pass.to_string(),
            listen_address: listen_address.to_string(),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, BtcError> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "bitbridge",
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await?;

        let rpc: RpcResponse<T> = resp.json().await?;
        if let Some(err) = rpc.error {
            return Err(BtcError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        rpc.result
            .ok_or_else(|| BtcError::Parse(format!("{method}: empty result")))
    }

    /// Resolve the sender address of one input by looking at the prevout it
    /// spends.
    async fn input_address(&self, txid: &str, vout: u32) -> Result<Option<String>, BtcError> {
        let prev: RawTransaction = self.call("getrawtransaction", json!([txid, true])).await?;
        Ok(prev
            .vout
            .into_iter()
            .find(|o| o.n == vout)
            .and_then(|o| o.script_pub_key.address))
    }
}

#[async_trait]
impl BtcRpc for BtcClient {
    async fn latest_height(&self) -> Result<i64, BtcError> {
        self.call("getblockcount", json!([])).await
    }

    async fn scan_block(&self, height: i64, from_tx_index: i64) -> Result<BlockScan, BtcError> {
        let hash: String = self.call("getblockhash", json!([height])).await?;
        let block: VerboseBlock = self.call("getblock", json!([hash, 2])).await?;

        let mut deposits = Vec::new();
        for (index, tx) in block.tx.iter().enumerate() {
            let tx_index = index as i64;
            if tx_index < from_tx_index {
                continue;
            }

            let value_sats: i64 = tx
                .vout
                .iter()
                .filter(|o| o.script_pub_key.address.as_deref() == Some(&self.listen_address))
                .map(|o| btc_to_sats(o.value))
                .sum::<Result<i64, BtcError>>()?;
            if value_sats == 0 {
                continue;
            }

            // Coinbase txs have no resolvable senders and cannot be deposits.
            let mut froms = Vec::new();
            for input in &tx.vin {
                let (txid, vout) = match (&input.txid, input.vout) {
                    (Some(txid), Some(vout)) => (txid, vout),
                    _ => continue,
                };
                if let Some(addr) = self.input_address(txid, vout).await? {
                    if !froms.contains(&addr) {
                        froms.push(addr);
                    }
                }
            }
            if froms.is_empty() {
                continue;
            }

            deposits.push(BlockDeposit {
                tx_index,
                tx_hash: tx.txid.clone(),
                froms,
                to: self.listen_address.clone(),
                value_sats,
            });
        }

        Ok(BlockScan {
            deposits,
            block_time: block.time,
        })
    }

    async fn confirmations(&self, txid: &str) -> Result<u64, BtcError> {
        let tx: RawTransaction = self.call("getrawtransaction", json!([txid, true])).await?;
        Ok(tx.confirmations.unwrap_or(0))
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, BtcError> {
        self.call("sendrawtransaction", json!([tx_hex])).await
    }
}

fn btc_to_sats(value: f64) -> Result<i64, BtcError> {
    bitcoin::Amount::from_btc(value)
        .map(|a| a.to_sat() as i64)
        .map_err(|e| BtcError::Parse(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct VerboseBlock {
    time: i64,
    tx: Vec<RawTransaction>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    txid: String,
    #[serde(default)]
    vin: Vec<TxInput>,
    #[serde(default)]
    vout: Vec<TxOutput>,
    #[serde(default)]
    confirmations: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TxInput {
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    vout: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TxOutput {
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: ScriptPubKey,
}

#[derive(Debug, Deserialize)]
struct ScriptPubKey {
    #[serde(default)]
    address: Option<String>,
}
