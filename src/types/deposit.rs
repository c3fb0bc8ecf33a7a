//! Deposit record and status machines.
//!
//! One `Deposit` row exists per L1 transaction that paid the listen address,
//! keyed by the unique L1 tx hash. The row is created by the indexer or the
//! notification ingestor and then driven to a terminal rollup status by the
//! dispatcher/reconciler pair:
//!
//! pending → wait_mined → success
//!                      ↘ wait_mined_status_failed / wait_mined_failed /
//!                        context_deadline_exceeded (reclaimed by the
//!                        reconciler with the recorded nonce)

use serde::{Deserialize, Serialize};

/// Rollup-side submission status of a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    /// Not yet submitted, or submit failed with a retriable transport error.
    Pending,
    /// Receipt observed with status 1.
    Success,
    /// The contract already consumed this L1 tx hash. Terminal; the uniqueness
    /// guard on-chain makes this equivalent to success.
    TxHashExist,
    /// Submitted, hash and nonce recorded, receipt not yet observed.
    WaitMined,
    /// Receipt observed with status != 1.
    WaitMinedStatusFailed,
    /// Waiting for the receipt failed with an unclassified error.
    WaitMinedFailed,
    /// The wait was cut short (timeout or shutdown); the reconciler owns the
    /// row from here.
    ContextDeadlineExceeded,
    /// The bridge contract cannot cover the credit.
    ContractInsufficientBalance,
    /// The bridge key cannot cover gas.
    FromAccountGasInsufficient,
    /// The translation service has no pubkey for the sender yet.
    AaAddressNotFound,
}

impl DepositStatus {
    /// Statuses the reconciler is allowed to pull back into a submission
    /// attempt. Every other transition is monotonic.
    pub fn is_reclaimable(&self) -> bool {
        matches!(
            self,
            Self::WaitMined | Self::WaitMinedFailed | Self::ContextDeadlineExceeded
        )
    }
}

/// Status of the temporary EOA-transfer fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EoaStatus {
    Pending,
    Success,
    Failed,
    WaitMinedFailed,
    ContextDeadlineExceeded,
}

/// Whether the indexer has observed the deposit on L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerStatus {
    Pending,
    Success,
}

/// Whether the custody provider's callback has been received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Pending,
    Success,
}

macro_rules! status_text {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let s = match self {
                    $(Self::$variant => $text),+
                };
                write!(f, "{}", s)
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(format!("unknown {} value: {}", stringify!($ty), s)),
                }
            }
        }
    };
}

status_text!(DepositStatus {
    Pending => "pending",
    Success => "success",
    TxHashExist => "tx_hash_exist",
    WaitMined => "wait_mined",
    WaitMinedStatusFailed => "wait_mined_status_failed",
    WaitMinedFailed => "wait_mined_failed",
    ContextDeadlineExceeded => "context_deadline_exceeded",
    ContractInsufficientBalance => "contract_insufficient_balance",
    FromAccountGasInsufficient => "from_account_gas_insufficient",
    AaAddressNotFound => "aa_address_not_found",
});

status_text!(EoaStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    WaitMinedFailed => "wait_mined_failed",
    ContextDeadlineExceeded => "context_deadline_exceeded",
});

status_text!(ListenerStatus {
    Pending => "pending",
    Success => "success",
});

status_text!(CallbackStatus {
    Pending => "pending",
    Success => "success",
});

pub(crate) use status_text;

/// A deposit observed on L1, bridged to the rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: i64,
    /// L1 block that carried the deposit tx.
    pub btc_block_number: i64,
    /// Index of the tx inside its block.
    pub btc_tx_index: i64,
    /// Unique L1 tx hash.
    pub btc_tx_hash: String,
    /// Primary sender (first of the sender set).
    pub btc_from: String,
    /// Full sender set as a JSON array; a UTXO spend may have several.
    pub btc_froms: String,
    /// Recipient, always the listen address at observation time.
    pub btc_to: String,
    /// Deposited value in satoshis.
    pub btc_value: i64,
    /// Smart-account address derived from the sender's pubkey.
    pub aa_address: Option<String>,
    pub b2_tx_hash: Option<String>,
    pub b2_tx_nonce: Option<u64>,
    pub b2_tx_status: DepositStatus,
    pub b2_tx_retry: u32,
    pub b2_eoa_tx_hash: Option<String>,
    pub b2_eoa_tx_nonce: Option<u64>,
    pub b2_eoa_tx_status: EoaStatus,
    pub listener_status: ListenerStatus,
    pub callback_status: CallbackStatus,
    /// L1 block timestamp, copied from the header.
    pub btc_block_time: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            DepositStatus::Pending,
            DepositStatus::Success,
            DepositStatus::TxHashExist,
            DepositStatus::WaitMined,
            DepositStatus::WaitMinedStatusFailed,
            DepositStatus::WaitMinedFailed,
            DepositStatus::ContextDeadlineExceeded,
            DepositStatus::ContractInsufficientBalance,
            DepositStatus::FromAccountGasInsufficient,
            DepositStatus::AaAddressNotFound,
        ] {
            assert_eq!(DepositStatus::from_str(&status.to_string()), Ok(status));
        }
        assert!(DepositStatus::from_str("bogus").is_err());
    }

    #[test]
    fn test_reclaimable_set() {
        assert!(DepositStatus::WaitMined.is_reclaimable());
        assert!(DepositStatus::ContextDeadlineExceeded.is_reclaimable());
        assert!(DepositStatus::WaitMinedFailed.is_reclaimable());
        assert!(!DepositStatus::Success.is_reclaimable());
        assert!(!DepositStatus::Pending.is_reclaimable());
        assert!(!DepositStatus::WaitMinedStatusFailed.is_reclaimable());
    }
}
