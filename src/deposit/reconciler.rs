//! Unconfirmed deposit reconciler.
//!
//! Owns rows whose L2 submission ended ambiguously: wait_mined (crashed
//! mid-wait), context_deadline_exceeded, wait_mined_failed. Each tick it
//! re-examines them against the chain, oldest stuck nonce first, and either
//! settles them from a receipt or re-enters the dispatcher's submit path:
//! with the stored nonce when the tx is lost, or with the old tx as a
//! gas-bumped replacement when it is still in the mempool.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::rollup::{RollupBridge, TxLookup};
use crate::shutdown::Shutdown;
use crate::storage::{DepositOutcome, Store};
use crate::types::{Deposit, DepositStatus};

use super::dispatcher::{DepositDispatcher, HandleError, SubmitMode};

#[derive(Clone)]
pub struct DepositReconciler {
    store: Arc<Store>,
    bridge: Arc<dyn RollupBridge>,
    dispatcher: DepositDispatcher,
    batch_limit: u32,
    tick: Duration,
    pause: Duration,
    enable_eoa_transfer: bool,
    shutdown: Shutdown,
}

impl DepositReconciler {
    pub fn new(
        store: Arc<Store>,
        bridge: Arc<dyn RollupBridge>,
        dispatcher: DepositDispatcher,
        config: &Config,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            bridge,
            dispatcher,
            batch_limit: config.batch_limit,
            tick: config.deposit_tick(),
            pause: config.deposit_pause(),
            enable_eoa_transfer: config.enable_eoa_transfer,
            shutdown,
        }
    }

    pub async fn run(self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("deposit reconciler stopping");
                    return;
                }
                _ = sleep(self.tick) => {}
            }

            let rows = match self.store.deposits_unconfirmed(self.batch_limit) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "unconfirmed batch query failed");
                    continue;
                }
            };
            info!(batch = rows.len(), "handling unconfirmed deposits");

            for row in rows {
                if self.shutdown.is_triggered() {
                    warn!("deposit reconciler stopping mid-batch");
                    return;
                }

                let worker = self.clone();
                let deposit = row.clone();
                let result =
                    tokio::spawn(async move { worker.handle_unconfirmed(&deposit).await }).await;

                match result {
                    Err(join_error) => {
                        error!(error = %join_error, tx_hash = %row.btc_tx_hash, "reconcile handler panicked");
                    }
                    Ok(Err(HandleError::Stopped)) => return,
                    Ok(Err(e)) => {
                        error!(error = %e, tx_hash = %row.btc_tx_hash, "handle unconfirmed failed");
                    }
                    Ok(Ok(())) => {}
                }

                let mut shutdown = self.shutdown.clone();
                tokio::select! {
                    _ = shutdown.triggered() => return,
                    _ = sleep(self.pause) => {}
                }
            }
        }
    }

    /// Drive one ambiguous row toward a terminal state.
    pub async fn handle_unconfirmed(&self, deposit: &Deposit) -> Result<(), HandleError> {
        let b2_tx_hash = match deposit.b2_tx_hash.as_deref() {
            Some(hash) if !hash.is_empty() => hash.to_string(),
            _ => {
                // No submission was recorded; hand the row back to the
                // dispatcher as a plain pending deposit.
                warn!(tx_hash = %deposit.btc_tx_hash, "unconfirmed row without l2 hash, resetting");
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::Pending)?;
                return Ok(());
            }
        };

        let receipt = self
            .bridge
            .receipt_status(&b2_tx_hash)
            .await
            .map_err(|e| HandleError::Transient(format!("receipt: {e}")))?;

        match receipt {
            Some(true) => {
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::Success)?;
                info!(tx_hash = %deposit.btc_tx_hash, b2_tx_hash = %b2_tx_hash, "deposit confirmed by receipt");
                Ok(())
            }
            Some(false) => {
                let mut outcome = DepositOutcome {
                    status: DepositStatus::WaitMinedStatusFailed,
                    retry: deposit.b2_tx_retry,
                    b2_tx_hash: None,
                    aa_address: None,
                    b2_tx_nonce: None,
                    eoa_hash: None,
                    eoa_nonce: None,
                    eoa_status: deposit.b2_eoa_tx_status,
                };

                if self.enable_eoa_transfer {
                    match deposit.aa_address.as_deref() {
                        Some(aa_address) if !aa_address.is_empty() => {
                            let (hash, nonce, status) = self
                                .dispatcher
                                .eoa_fallback(aa_address, deposit.btc_value)
                                .await;
                            outcome.eoa_hash = hash;
                            outcome.eoa_nonce = nonce;
                            outcome.eoa_status = status;
                        }
                        _ => {
                            warn!(tx_hash = %deposit.btc_tx_hash, "no aa address recorded, skipping eoa fallback");
                        }
                    }
                }

                self.store.record_deposit_outcome(deposit.id, &outcome)?;
                Ok(())
            }
            None => {
                // No receipt: the tx is either lost or parked in the mempool.
                match self
                    .bridge
                    .lookup_transaction(&b2_tx_hash)
                    .await
                    .map_err(|e| HandleError::Transient(format!("lookup: {e}")))?
                {
                    TxLookup::NotFound => {
                        // The node never saw (or dropped) the tx. Resubmit
                        // into the same nonce slot.
                        let nonce = deposit.b2_tx_nonce.unwrap_or_default();
                        info!(tx_hash = %deposit.btc_tx_hash, nonce, "l2 tx lost, resubmitting with stored nonce");
                        self.dispatcher
                            .handle_deposit(deposit, SubmitMode::Pinned(nonce))
                            .await
                    }
                    TxLookup::Pending(template) => {
                        info!(
                            tx_hash = %deposit.btc_tx_hash,
                            nonce = template.nonce,
                            gas_price = template.gas_price,
                            "l2 tx stuck in mempool, replacing with gas bump"
                        );
                        self.dispatcher
                            .handle_deposit(deposit, SubmitMode::Replace(template))
                            .await
                    }
                    TxLookup::Mined => {
                        // Receipt will surface on a later tick; do nothing.
                        Ok(())
                    }
                }
            }
        }
    }
}
