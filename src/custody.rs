//! Custody-provider UTXO lookup.
//!
//! The withdraw constructor funds its batches from the listen address's
//! unspent outputs, served by the custody provider's indexer API in pages of
//! sixteen.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

/// Entries returned per page by the custody API.
pub const UTXO_PAGE_SIZE: i64 = 16;

#[derive(Debug, Error)]
pub enum CustodyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("custody api error {code}: {message}")]
    Api { code: i64, message: String },
}

/// One unspent output of the listen address.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenUtxo {
    pub txid: String,
    pub vout: u32,
    pub satoshi: i64,
    #[serde(rename = "scriptPk")]
    pub script_pk: String,
}

/// One page of unspent outputs.
#[derive(Debug, Clone)]
pub struct UtxoPage {
    /// Total number of outputs held by the address, across all pages.
    pub total: i64,
    pub utxos: Vec<ListenUtxo>,
}

/// Paged UTXO retrieval.
#[async_trait]
pub trait UtxoProvider: Send + Sync {
    async fn unspent_page(&self, address: &str, cursor: i64) -> Result<UtxoPage, CustodyError>;
}

/// HTTP client against the custody provider's indexer.
pub struct CustodyClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl CustodyClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl UtxoProvider for CustodyClient {
    async fn unspent_page(&self, address: &str, cursor: i64) -> Result<UtxoPage, CustodyError> {
        let url = format!(
            "{}/v1/indexer/address/{}/utxo-data?cursor={}&size={}",
            self.base_url, address, cursor, UTXO_PAGE_SIZE
        );

        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let envelope: Envelope = resp.json().await?;
        if envelope.code != 0 {
            return Err(CustodyError::Api {
                code: envelope.code,
                message: envelope.msg,
            });
        }

        let data = envelope.data.unwrap_or_default();
        Ok(UtxoPage {
            total: data.total,
            utxos: data.utxo,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<UtxoData>,
}

#[derive(Debug, Default, Deserialize)]
struct UtxoData {
    #[serde(default)]
    total: i64,
    #[serde(default)]
    utxo: Vec<ListenUtxo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decoding() {
        let raw = serde_json::json!({
            "code": 0,
            "msg": "ok",
            "data": {
                "total": 2,
                "utxo": [
                    {"txid": "aa", "vout": 0, "satoshi": 2000, "scriptPk": "0014ab"},
                    {"txid": "bb", "vout": 1, "satoshi": 500, "scriptPk": "0014cd"}
                ]
            }
        });

        let env: Envelope = serde_json::from_value(raw).unwrap();
        let data = env.data.unwrap();
        assert_eq!(data.total, 2);
        assert_eq!(data.utxo[0].satoshi, 2000);
        assert_eq!(data.utxo[1].script_pk, "0014cd");
    }
}
