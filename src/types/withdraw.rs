//! Withdraw records and status machines.
//!
//! A `Withdraw` row is one L2 withdraw log entry; a `WithdrawTx` row is the
//! aggregated L1 spend settling a batch of them. The two machines:
//!
//! Withdraw:   pending → submitted → success | failed (failed batches reset
//!             the rows to pending so a fresh batch can pick them up)
//! WithdrawTx: signature_pending → signature_completed → broadcast_success →
//!             confirmed → success, with broadcast_failed → failed on the
//!             error path

use serde::{Deserialize, Serialize};

use super::deposit::status_text;

/// Status of a single withdraw intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawStatus {
    /// Waiting to be picked up by the constructor.
    Pending,
    /// Included in a WithdrawTx batch.
    Submitted,
    /// The batch confirmed on L1.
    Success,
    /// The batch failed permanently.
    Failed,
}

/// Status of an aggregated L1 spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawTxStatus {
    /// Registered with the signing coordinator, signatures outstanding.
    SignaturePending,
    /// The coordinator reports the threshold has been reached.
    SignatureCompleted,
    BroadcastSuccess,
    BroadcastFailed,
    /// At least six L1 confirmations observed.
    Confirmed,
    /// Terminal state reported back to the coordinator.
    Success,
    Failed,
}

status_text!(WithdrawStatus {
    Pending => "pending",
    Submitted => "submitted",
    Success => "success",
    Failed => "failed",
});

status_text!(WithdrawTxStatus {
    SignaturePending => "signature_pending",
    SignatureCompleted => "signature_completed",
    BroadcastSuccess => "broadcast_success",
    BroadcastFailed => "broadcast_failed",
    Confirmed => "confirmed",
    Success => "success",
    Failed => "failed",
});

/// One L2 withdraw event, keyed by (block, tx index, log index).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdraw {
    pub id: i64,
    /// Source of the eventual L1 payment: the listen address.
    pub btc_from: String,
    /// Destination L1 address decoded from the event data.
    pub btc_to: String,
    /// Amount in satoshis.
    pub btc_value: i64,
    pub b2_block_number: i64,
    pub b2_block_hash: String,
    pub b2_tx_hash: String,
    pub b2_tx_index: i64,
    pub b2_log_index: i64,
    pub status: WithdrawStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One aggregated multi-output L1 spend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawTx {
    pub id: i64,
    /// Pre-signature L1 txid the coordinator keys signatures by.
    pub btc_tx_id: String,
    /// Base64 PSBT shipped to the signers.
    pub psbt: String,
    /// JSON array of the L2 tx hashes this spend settles.
    pub b2_tx_hashes: String,
    /// Post-signature broadcast hash.
    pub btc_tx_hash: Option<String>,
    pub status: WithdrawTxStatus,
    /// Failure detail on the error path.
    pub reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl WithdrawTx {
    /// Decode the settled L2 tx hash list.
    pub fn settled_hashes(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.b2_tx_hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            WithdrawTxStatus::SignaturePending,
            WithdrawTxStatus::SignatureCompleted,
            WithdrawTxStatus::BroadcastSuccess,
            WithdrawTxStatus::BroadcastFailed,
            WithdrawTxStatus::Confirmed,
            WithdrawTxStatus::Success,
            WithdrawTxStatus::Failed,
        ] {
            assert_eq!(WithdrawTxStatus::from_str(&status.to_string()), Ok(status));
        }
    }

    #[test]
    fn test_settled_hashes() {
        let tx = WithdrawTx {
            id: 1,
            btc_tx_id: "txid".to_string(),
            psbt: String::new(),
            b2_tx_hashes: r#"["0xaa","0xbb"]"#.to_string(),
            btc_tx_hash: None,
            status: WithdrawTxStatus::SignaturePending,
            reason: None,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(tx.settled_hashes().unwrap(), vec!["0xaa", "0xbb"]);
    }
}
