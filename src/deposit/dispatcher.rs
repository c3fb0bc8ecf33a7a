//! Deposit dispatcher.
//!
//! Tick-driven worker that selects Deposits ready to bridge and runs each
//! through a bounded state transition: confirmation check, address
//! translation, L2 submission, wait-mined, commit. Rows are processed in
//! (L1 block, row id) order so L2 nonces are consumed in L1 arrival order.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::aa::{AaError, AddressTranslator};
use crate::btc_client::BtcRpc;
use crate::config::Config;
use crate::rollup::{RollupBridge, RollupError, TxTemplate, WaitMinedError};
use crate::shutdown::Shutdown;
use crate::storage::{DepositOutcome, Store, StoreError};
use crate::types::{Deposit, DepositStatus, EoaStatus};

/// Where the submission gets its nonce and payload.
#[derive(Debug, Clone)]
pub enum SubmitMode {
    /// Fetch the pending nonce and build a fresh call.
    Fresh,
    /// Fresh call pinned to a stored nonce (reconciler: tx lost).
    Pinned(u64),
    /// Rebroadcast of a mempool-stuck tx with a gas bump (reconciler).
    Replace(TxTemplate),
}

#[derive(Debug, Error)]
pub enum HandleError {
    /// Shutdown observed mid-row; state is committed and consistent.
    #[error("worker stopping")]
    Stopped,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Remote failure that must not advance the row; retried next tick.
    #[error("transient: {0}")]
    Transient(String),
}

#[derive(Clone)]
pub struct DepositDispatcher {
    store: Arc<Store>,
    bridge: Arc<dyn RollupBridge>,
    btc: Arc<dyn BtcRpc>,
    translator: Arc<dyn AddressTranslator>,
    required_confirmations: u64,
    batch_limit: u32,
    tick: Duration,
    pause: Duration,
    backoff: Duration,
    wait_mined_timeout: Duration,
    enable_eoa_transfer: bool,
    shutdown: Shutdown,
}

impl DepositDispatcher {
    pub fn new(
        store: Arc<Store>,
        bridge: Arc<dyn RollupBridge>,
        btc: Arc<dyn BtcRpc>,
        translator: Arc<dyn AddressTranslator>,
        config: &Config,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            bridge,
            btc,
            translator,
            required_confirmations: config.btc_confirmations,
            batch_limit: config.batch_limit,
            tick: config.deposit_tick(),
            pause: config.deposit_pause(),
            backoff: config.deposit_backoff(),
            wait_mined_timeout: config.wait_mined_timeout(),
            enable_eoa_transfer: config.enable_eoa_transfer,
            shutdown,
        }
    }

    pub async fn run(self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("deposit dispatcher stopping");
                    return;
                }
                _ = sleep(self.tick) => {}
            }

            let ready = match self.store.deposits_ready(self.batch_limit) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "ready batch query failed");
                    continue;
                }
            };
            info!(batch = ready.len(), "handling deposit batch");
            if self.process_rows(ready).await {
                return;
            }

            // Rows parked on address translation: the registry is eventually
            // consistent, so they are retried on every tick.
            let parked = match self.store.deposits_address_pending(self.batch_limit) {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "address-pending batch query failed");
                    continue;
                }
            };
            info!(batch = parked.len(), "handling address-pending batch");
            if self.process_rows(parked).await {
                return;
            }
        }
    }

    /// Run one batch, a row at a time. Returns true when shutdown fired.
    async fn process_rows(&self, rows: Vec<Deposit>) -> bool {
        for row in rows {
            if self.shutdown.is_triggered() {
                warn!("deposit dispatcher stopping mid-batch");
                return true;
            }

            let worker = self.clone();
            let deposit = row.clone();
            let result =
                tokio::spawn(async move { worker.handle_deposit(&deposit, SubmitMode::Fresh).await })
                    .await;

            match result {
                Err(join_error) => {
                    // Panic isolated to the row; the batch continues.
                    error!(error = %join_error, tx_hash = %row.btc_tx_hash, "deposit handler panicked");
                }
                Ok(Err(HandleError::Stopped)) => return true,
                Ok(Err(e)) => {
                    error!(error = %e, tx_hash = %row.btc_tx_hash, "handle deposit failed");
                }
                Ok(Ok(())) => {}
            }

            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => return true,
                _ = sleep(self.pause) => {}
            }
        }
        false
    }

    /// One bounded state transition for one Deposit row.
    pub async fn handle_deposit(
        &self,
        deposit: &Deposit,
        mode: SubmitMode,
    ) -> Result<(), HandleError> {
        // 1. The L1 tx must be buried deep enough before any L2 effect.
        let confirmations = self
            .btc
            .confirmations(&deposit.btc_tx_hash)
            .await
            .map_err(|e| HandleError::Transient(format!("confirmations: {e}")))?;
        if confirmations < self.required_confirmations {
            return Err(HandleError::Transient(format!(
                "tx {} has {confirmations}/{} confirmations",
                deposit.btc_tx_hash, self.required_confirmations
            )));
        }

        // 2. Resolve the sender's smart account.
        let aa_address = match self.translator.smart_account(&deposit.btc_from).await {
            Ok(address) => address,
            Err(AaError::NotFound) => {
                warn!(tx_hash = %deposit.btc_tx_hash, from = %deposit.btc_from, "aa address not found");
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::AaAddressNotFound)?;
                return Ok(());
            }
            Err(e) => return Err(HandleError::Transient(format!("translate: {e}"))),
        };

        // 3. Submit.
        let submitted = match &mode {
            SubmitMode::Fresh => {
                self.bridge
                    .deposit(&deposit.btc_tx_hash, &aa_address, deposit.btc_value, None)
                    .await
            }
            SubmitMode::Pinned(nonce) => {
                self.bridge
                    .deposit(
                        &deposit.btc_tx_hash,
                        &aa_address,
                        deposit.btc_value,
                        Some(*nonce),
                    )
                    .await
            }
            SubmitMode::Replace(template) => self.bridge.replace(template).await,
        };

        let submitted = match submitted {
            Ok(submitted) => submitted,
            Err(RollupError::TxHashExist) => {
                // The contract already consumed this hash; uniqueness on-chain
                // makes this a terminal success.
                warn!(tx_hash = %deposit.btc_tx_hash, "deposit hash already processed");
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::TxHashExist)?;
                return Ok(());
            }
            Err(RollupError::ContractInsufficientBalance) => {
                error!(tx_hash = %deposit.btc_tx_hash, "bridge contract balance too low");
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::ContractInsufficientBalance)?;
                return Ok(());
            }
            Err(RollupError::FromGasInsufficient) => {
                error!(tx_hash = %deposit.btc_tx_hash, "bridge key gas balance too low");
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::FromAccountGasInsufficient)?;
                return Ok(());
            }
            Err(e) => {
                let retry = deposit.b2_tx_retry + 1;
                error!(error = %e, tx_hash = %deposit.btc_tx_hash, retry, "deposit submit failed, will retry");
                self.store
                    .record_deposit_retry(deposit.id, DepositStatus::Pending, retry)?;

                // Likely a network fault; suspend so the next tick starts
                // against fresh chain state.
                let mut shutdown = self.shutdown.clone();
                return tokio::select! {
                    _ = shutdown.triggered() => Err(HandleError::Stopped),
                    _ = sleep(self.backoff) => {
                        Err(HandleError::Transient(format!("submit failed: {e}")))
                    }
                };
            }
        };

        // 4. Make the submission durable before waiting: after a crash the
        // reconciler finds the tx by this hash or nonce.
        self.store.mark_deposit_submitted(
            deposit.id,
            &submitted.tx_hash,
            &aa_address,
            submitted.nonce,
        )?;
        info!(
            tx_hash = %deposit.btc_tx_hash,
            b2_tx_hash = %submitted.tx_hash,
            nonce = submitted.nonce,
            "deposit submitted, waiting for receipt"
        );

        // 5. Wait for mining, bounded and cancellable.
        let mut shutdown = self.shutdown.clone();
        let wait_result = tokio::select! {
            _ = shutdown.triggered() => {
                self.store
                    .set_deposit_status(deposit.id, DepositStatus::ContextDeadlineExceeded)?;
                return Err(HandleError::Stopped);
            }
            result = self.bridge.wait_mined(&submitted.tx_hash, self.wait_mined_timeout) => result,
        };

        let mut outcome = DepositOutcome {
            status: DepositStatus::Success,
            retry: deposit.b2_tx_retry,
            b2_tx_hash: Some(submitted.tx_hash.clone()),
            aa_address: Some(aa_address.clone()),
            b2_tx_nonce: Some(submitted.nonce),
            eoa_hash: None,
            eoa_nonce: None,
            eoa_status: EoaStatus::Pending,
        };

        match wait_result {
            Ok(()) => {}
            Err(WaitMinedError::StatusFailed) => {
                error!(b2_tx_hash = %submitted.tx_hash, "deposit mined with failure status");
                outcome.status = DepositStatus::WaitMinedStatusFailed;
                if self.enable_eoa_transfer {
                    let (hash, nonce, status) =
                        self.eoa_fallback(&aa_address, deposit.btc_value).await;
                    outcome.eoa_hash = hash;
                    outcome.eoa_nonce = nonce;
                    outcome.eoa_status = status;
                }
            }
            Err(WaitMinedError::DeadlineExceeded) => {
                // Chain unavailable or badly congested; the reconciler takes
                // over with the stored nonce.
                error!(b2_tx_hash = %submitted.tx_hash, "wait mined deadline exceeded");
                outcome.status = DepositStatus::ContextDeadlineExceeded;
            }
            Err(WaitMinedError::Rpc(e)) => {
                error!(error = %e, b2_tx_hash = %submitted.tx_hash, "wait mined failed");
                outcome.status = DepositStatus::WaitMinedFailed;
            }
        }

        // 6. Final commit, all fields at once.
        self.store.record_deposit_outcome(deposit.id, &outcome)?;
        info!(tx_hash = %deposit.btc_tx_hash, status = %outcome.status, "deposit handled");
        Ok(())
    }

    /// Temporary fallback: credit the smart account with a plain transfer
    /// when the contract call mined with failure status.
    pub(crate) async fn eoa_fallback(
        &self,
        recipient: &str,
        value_sats: i64,
    ) -> (Option<String>, Option<u64>, EoaStatus) {
        let submitted = match self.bridge.transfer(recipient, value_sats).await {
            Ok(submitted) => submitted,
            Err(e) => {
                error!(error = %e, recipient, "eoa transfer failed");
                return (None, None, EoaStatus::Failed);
            }
        };

        let status = match self
            .bridge
            .wait_mined(&submitted.tx_hash, self.wait_mined_timeout)
            .await
        {
            Ok(()) => EoaStatus::Success,
            Err(WaitMinedError::DeadlineExceeded) => EoaStatus::ContextDeadlineExceeded,
            Err(e) => {
                error!(error = %e, eoa_tx_hash = %submitted.tx_hash, "eoa transfer wait mined failed");
                EoaStatus::WaitMinedFailed
            }
        };

        (Some(submitted.tx_hash), Some(submitted.nonce), status)
    }
}
