//! Rollup (L2) access.
//!
//! The bridge contract exposes a single credit method plus deposit/withdraw
//! events. The workers consume the chain through the `RollupBridge` trait;
//! the concrete client lives in `client`.

mod client;

pub use client::RollupClient;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

alloy::sol! {
    /// Bridge contract surface consumed by the orchestrator.
    interface IBridge {
        function depositV2(bytes32 txHash, address to, uint256 amount);

        event Deposit(bytes32 indexed txHash, address indexed to, uint256 amount);
        event Withdraw(address indexed from, string to, uint256 amount);
    }
}

/// Submission errors. The named variants map one-to-one onto deposit
/// statuses; everything else is transient and retried.
#[derive(Debug, Error)]
pub enum RollupError {
    /// The contract already consumed this L1 tx hash.
    #[error("non-repeatable processing")]
    TxHashExist,

    /// The bridge contract cannot cover the credit.
    #[error("insufficient balance")]
    ContractInsufficientBalance,

    /// The bridge key cannot cover gas.
    #[error("gas required exceeds allowance")]
    FromGasInsufficient,

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("signing error: {0}")]
    Signer(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid tx hash: {0}")]
    InvalidHash(String),
}

/// Wait-mined outcomes other than a status-1 receipt.
#[derive(Debug, Error)]
pub enum WaitMinedError {
    /// Receipt observed with status != 1.
    #[error("tx wait mined status failed")]
    StatusFailed,

    /// The bound elapsed without a receipt; the chain may be stalled.
    #[error("wait mined deadline exceeded")]
    DeadlineExceeded,

    #[error("rpc error: {0}")]
    Rpc(String),
}

/// A signed-and-broadcast L2 transaction.
#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub tx_hash: String,
    pub nonce: u64,
    pub gas_price: u128,
}

/// Enough of a pending transaction to rebuild and replace it.
#[derive(Debug, Clone)]
pub struct TxTemplate {
    pub nonce: u64,
    pub gas_price: u128,
    pub to: String,
    pub value: u128,
    pub input: Vec<u8>,
}

/// Where a submitted transaction currently stands.
#[derive(Debug, Clone)]
pub enum TxLookup {
    /// Unknown to the node; the submission was lost.
    NotFound,
    /// Sitting in the mempool; replaceable with a gas bump.
    Pending(TxTemplate),
    /// Already mined; the receipt path owns it.
    Mined,
}

/// One decoded withdraw event.
#[derive(Debug, Clone)]
pub struct WithdrawEvent {
    pub block_number: u64,
    pub block_hash: String,
    pub tx_hash: String,
    pub tx_index: i64,
    pub log_index: i64,
    /// L2 sender (first indexed topic).
    pub from: String,
    /// Destination L1 address carried in the event data.
    pub to: String,
    /// Amount in satoshis.
    pub amount: i64,
}

/// Rollup capabilities the workers need.
#[async_trait]
pub trait RollupBridge: Send + Sync {
    /// Submit the deposit call crediting `recipient` for an observed L1 tx.
    /// `nonce` pins the nonce slot on a reconciler resubmit; `None` fetches
    /// the pending nonce.
    async fn deposit(
        &self,
        l1_tx_hash: &str,
        recipient: &str,
        value_sats: i64,
        nonce: Option<u64>,
    ) -> Result<SubmittedTx, RollupError>;

    /// Rebroadcast a stuck transaction: same nonce and payload, gas price
    /// bumped by the configured factor (never below the previous attempt).
    async fn replace(&self, template: &TxTemplate) -> Result<SubmittedTx, RollupError>;

    /// Plain-value EOA transfer fallback.
    async fn transfer(&self, recipient: &str, value_sats: i64) -> Result<SubmittedTx, RollupError>;

    /// Poll for the receipt up to `timeout`. `Ok` means receipt status 1.
    async fn wait_mined(&self, tx_hash: &str, timeout: Duration) -> Result<(), WaitMinedError>;

    /// Receipt status by hash; `None` when no receipt exists.
    async fn receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, RollupError>;

    /// Locate a transaction in the mempool or the chain.
    async fn lookup_transaction(&self, tx_hash: &str) -> Result<TxLookup, RollupError>;

    async fn latest_block(&self) -> Result<u64, RollupError>;

    /// Withdraw events emitted by the bridge contract in one block.
    async fn withdraw_events(&self, block: u64) -> Result<Vec<WithdrawEvent>, RollupError>;
}

/// Map a node error string onto the named submission outcomes. The contract
/// and node surface these as revert/estimation messages, so substring
/// matching is the only classification available.
pub(crate) fn classify_submit_error(message: &str) -> RollupError {
    if message.contains("non-repeatable processing") {
        RollupError::TxHashExist
    } else if message.contains("insufficient balance") {
        RollupError::ContractInsufficientBalance
    } else if message.contains("gas required exceeds allowance") {
        RollupError::FromGasInsufficient
    } else {
        RollupError::Rpc(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_submit_error() {
        assert!(matches!(
            classify_submit_error("execution reverted: non-repeatable processing"),
            RollupError::TxHashExist
        ));
        assert!(matches!(
            classify_submit_error("execution reverted: insufficient balance"),
            RollupError::ContractInsufficientBalance
        ));
        assert!(matches!(
            classify_submit_error("gas required exceeds allowance (0)"),
            RollupError::FromGasInsufficient
        ));
        assert!(matches!(
            classify_submit_error("connection refused"),
            RollupError::Rpc(_)
        ));
    }
}
