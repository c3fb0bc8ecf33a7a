//! L1-address → smart-account translation.
//!
//! Two hops: the pubkey registry maps an L1 address to the public key its
//! owner registered (code "1001" means no binding exists yet; the registry
//! is eventually consistent), and the derivation service maps that pubkey to
//! the deterministic L2 smart-account address.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Registry code for a missing address → pubkey binding.
pub const ADDRESS_NOT_FOUND_CODE: &str = "1001";

#[derive(Debug, Error)]
pub enum AaError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// No pubkey registered for the L1 address yet. Retriable later.
    #[error("address not found")]
    NotFound,

    #[error("translation service error: {0}")]
    Service(String),
}

/// Resolves an L1 sender to its L2 smart-account address.
#[async_trait]
pub trait AddressTranslator: Send + Sync {
    async fn smart_account(&self, btc_address: &str) -> Result<String, AaError>;
}

/// HTTP client against the pubkey registry and the derivation service.
pub struct AaClient {
    http: Client,
    pubkey_api: String,
    account_api: String,
}

impl AaClient {
    pub fn new(pubkey_api: &str, account_api: &str) -> Self {
        Self {
            http: Client::new(),
            pubkey_api: pubkey_api.trim_end_matches('/').to_string(),
            account_api: account_api.trim_end_matches('/').to_string(),
        }
    }

    async fn pubkey(&self, btc_address: &str) -> Result<String, AaError> {
        let url = format!("{}/v1/btc/pubkey/{}", self.pubkey_api, btc_address);
        let resp: PubkeyResponse = self.http.get(&url).send().await?.json().await?;

        if resp.code == ADDRESS_NOT_FOUND_CODE {
            return Err(AaError::NotFound);
        }
        if resp.code != "0" {
            return Err(AaError::Service(resp.message));
        }
        Ok(resp.data.pubkey)
    }

    async fn derive_account(&self, pubkey: &str) -> Result<String, AaError> {
        let url = format!("{}/v1/btc/account", self.account_api);
        let resp: AccountResponse = self
            .http
            .post(&url)
            .json(&AccountRequest { pubkey })
            .send()
            .await?
            .json()
            .await?;

        if resp.code != "0" {
            return Err(AaError::Service(resp.message));
        }
        if resp.data.smart_account_address.is_empty() {
            return Err(AaError::Service("empty smart account address".to_string()));
        }
        Ok(resp.data.smart_account_address)
    }
}

#[async_trait]
impl AddressTranslator for AaClient {
    async fn smart_account(&self, btc_address: &str) -> Result<String, AaError> {
        let pubkey = self.pubkey(btc_address).await?;
        self.derive_account(&pubkey).await
    }
}

#[derive(Debug, Deserialize)]
struct PubkeyResponse {
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: PubkeyData,
}

#[derive(Debug, Default, Deserialize)]
struct PubkeyData {
    #[serde(default)]
    pubkey: String,
}

#[derive(Debug, Serialize)]
struct AccountRequest<'a> {
    pubkey: &'a str,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: AccountData,
}

#[derive(Debug, Default, Deserialize)]
struct AccountData {
    #[serde(default)]
    smart_account_address: String,
}
