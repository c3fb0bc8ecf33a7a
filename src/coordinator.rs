//! Signing coordinator client.
//!
//! The coordinator holds the co-signer keys. The constructor registers each
//! PSBT under its pre-signature L1 txid; the broadcaster polls for the
//! collected signature sets; the finaliser reports the terminal state back.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coordinator code for a txid that is already registered.
const CODE_INDEX_EXIST: i64 = 1101;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("coordinator error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("withdraw not found: {0}")]
    NotFound(String),
}

/// Terminal state reported back to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerStatus {
    Completed,
    Failed,
}

impl SignerStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Signature sets collected for a registered withdraw, one entry per
/// co-signer. Each entry is a hex-encoded JSON array of per-input signatures.
#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawSignatures {
    pub signatures: Vec<String>,
}

#[async_trait]
pub trait SigningCoordinator: Send + Sync {
    /// Register a PSBT for signing. Registering the same txid twice is
    /// idempotent success.
    async fn create_withdraw(
        &self,
        btc_tx_id: &str,
        b2_tx_hashes: &[String],
        psbt: &str,
    ) -> Result<(), CoordinatorError>;

    async fn query_withdraw(&self, btc_tx_id: &str) -> Result<WithdrawSignatures, CoordinatorError>;

    async fn update_withdraw(
        &self,
        btc_tx_id: &str,
        status: SignerStatus,
    ) -> Result<(), CoordinatorError>;
}

/// HTTP client against the coordinator.
pub struct CoordinatorClient {
    http: Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SigningCoordinator for CoordinatorClient {
    async fn create_withdraw(
        &self,
        btc_tx_id: &str,
        b2_tx_hashes: &[String],
        psbt: &str,
    ) -> Result<(), CoordinatorError> {
        let url = format!("{}/v1/withdraw/create", self.base_url);
        let resp: Envelope<serde_json::Value> = self
            .http
            .post(&url)
            .json(&CreateRequest {
                btc_tx_id,
                b2_tx_hashes,
                psbt,
            })
            .send()
            .await?
            .json()
            .await?;

        match resp.code {
            0 | CODE_INDEX_EXIST => Ok(()),
            code => Err(CoordinatorError::Api {
                code,
                message: resp.message,
            }),
        }
    }

    async fn query_withdraw(&self, btc_tx_id: &str) -> Result<WithdrawSignatures, CoordinatorError> {
        let url = format!("{}/v1/withdraw/{}", self.base_url, btc_tx_id);
        let resp: Envelope<WithdrawSignatures> = self.http.get(&url).send().await?.json().await?;

        if resp.code != 0 {
            return Err(CoordinatorError::Api {
                code: resp.code,
                message: resp.message,
            });
        }
        resp.data
            .ok_or_else(|| CoordinatorError::NotFound(btc_tx_id.to_string()))
    }

    async fn update_withdraw(
        &self,
        btc_tx_id: &str,
        status: SignerStatus,
    ) -> Result<(), CoordinatorError> {
        let url = format!("{}/v1/withdraw/update", self.base_url);
        let resp: Envelope<serde_json::Value> = self
            .http
            .post(&url)
            .json(&UpdateRequest {
                btc_tx_id,
                status: status.as_str(),
            })
            .send()
            .await?
            .json()
            .await?;

        match resp.code {
            0 | CODE_INDEX_EXIST => Ok(()),
            code => Err(CoordinatorError::Api {
                code,
                message: resp.message,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    btc_tx_id: &'a str,
    b2_tx_hashes: &'a [String],
    psbt: &'a str,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    btc_tx_id: &'a str,
    status: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<T>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_envelope_decoding() {
        let raw = serde_json::json!({
            "code": 0,
            "message": "",
            "data": {"signatures": ["deadbeef", "cafebabe"]}
        });
        let env: Envelope<WithdrawSignatures> = serde_json::from_value(raw).unwrap();
        assert_eq!(env.data.unwrap().signatures.len(), 2);
    }

    #[test]
    fn test_signer_status_wire_values() {
        assert_eq!(SignerStatus::Completed.as_str(), "completed");
        assert_eq!(SignerStatus::Failed.as_str(), "failed");
    }
}
