//! Custody-provider notification ingestor.
//!
//! Second, independent deposit source: the custody provider pushes a
//! callback per observed recharge. The handler validates, then commits the
//! notification receipt and the implied Deposit row in one store
//! transaction. Only system faults return a retriable code; every
//! validation failure is final for that request.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::storage::{NotifiedDeposit, Store};

/// Request type for a deposit recharge, the only one supported.
pub const REQUEST_TYPE_RECHARGE: i64 = 1;

/// Response codes on the notification channel.
pub mod codes {
    pub const SUCCESS: i64 = 200;
    /// Store or other internal fault; the caller should retry.
    pub const SYSTEM_ERROR: i64 = 1;
    pub const UNSUPPORTED_REQUEST_TYPE: i64 = 2001;
    pub const MALFORMED_DETAIL: i64 = 2002;
    pub const PARAMETER_ERROR: i64 = 2003;
    pub const LISTEN_ADDRESS_MISMATCH: i64 = 2004;
    pub const IP_NOT_WHITELISTED: i64 = 2005;
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionNotifyRequest {
    #[serde(rename = "RequestId", alias = "requestId")]
    pub request_id: String,
    #[serde(rename = "RequestType", alias = "requestType")]
    pub request_type: i64,
    #[serde(rename = "RequestDetail", alias = "requestDetail")]
    pub request_detail: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionNotifyResponse {
    #[serde(rename = "Code")]
    pub code: i64,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "RequestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl TransactionNotifyResponse {
    fn rejected(code: i64, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            request_id: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RequestDetail {
    #[serde(rename = "From", default)]
    from: String,
    #[serde(rename = "To", default)]
    to: String,
    #[serde(rename = "TxHash", default)]
    tx_hash: String,
    #[serde(rename = "Amount", default)]
    amount: String,
}

/// Stateless handler over (store, listen address); the HTTP layer in `api`
/// is a thin shim around it.
pub struct NotifyHandler {
    store: Arc<Store>,
    listen_address: String,
}

impl NotifyHandler {
    pub fn new(store: Arc<Store>, listen_address: String) -> Self {
        Self {
            store,
            listen_address,
        }
    }

    pub fn handle(&self, req: &TransactionNotifyRequest) -> TransactionNotifyResponse {
        info!(request_id = %req.request_id, request_type = req.request_type, "notification received");

        if req.request_type != REQUEST_TYPE_RECHARGE {
            return TransactionNotifyResponse::rejected(
                codes::UNSUPPORTED_REQUEST_TYPE,
                "request type nonsupport",
            );
        }

        let detail: RequestDetail = match serde_json::from_value(req.request_detail.clone()) {
            Ok(detail) => detail,
            Err(e) => {
                error!(error = %e, "request detail unmarshal failed");
                return TransactionNotifyResponse::rejected(
                    codes::MALFORMED_DETAIL,
                    "request detail unmarshal err",
                );
            }
        };

        if detail.from.is_empty() || detail.to.is_empty() || detail.tx_hash.is_empty() {
            return TransactionNotifyResponse::rejected(
                codes::PARAMETER_ERROR,
                "request detail check err",
            );
        }

        if detail.to != self.listen_address {
            return TransactionNotifyResponse::rejected(
                codes::LISTEN_ADDRESS_MISMATCH,
                "request detail to mismatch",
            );
        }

        let amount: i64 = match detail.amount.parse() {
            Ok(amount) => amount,
            Err(_) => {
                return TransactionNotifyResponse::rejected(
                    codes::MALFORMED_DETAIL,
                    "request detail amount err",
                );
            }
        };

        let deposit = NotifiedDeposit {
            btc_tx_hash: detail.tx_hash.clone(),
            btc_from: detail.from.clone(),
            btc_to: detail.to.clone(),
            btc_value: amount,
        };
        let raw_detail = req.request_detail.to_string();

        if let Err(e) = self.store.record_notification(
            &req.request_id,
            req.request_type,
            &raw_detail,
            &deposit,
        ) {
            error!(error = %e, request_id = %req.request_id, "notification persist failed");
            return TransactionNotifyResponse::rejected(codes::SYSTEM_ERROR, "system error");
        }

        info!(request_id = %req.request_id, tx_hash = %detail.tx_hash, "notification recorded");
        TransactionNotifyResponse {
            code: codes::SUCCESS,
            message: String::new(),
            request_id: Some(req.request_id.clone()),
        }
    }
}
