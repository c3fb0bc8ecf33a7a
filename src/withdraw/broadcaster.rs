//! Withdraw broadcaster, confirmer and finaliser.
//!
//! Three sub-workers over the WithdrawTx status machine:
//!
//! - broadcast: poll the coordinator for two complete signature sets,
//!   assemble the final witness stack `[null, sig0, sig1, witnessScript]`
//!   per input, and hand the serialised spend to the L1 node;
//! - confirm: watch broadcast transactions until six confirmations;
//! - finalise: report the terminal state to the coordinator, then flip the
//!   batch and its Withdraw rows together (failed batches return their rows
//!   to pending for reconstruction).
//!
//! Transient remote errors never advance a row; it is simply revisited on
//! the next tick.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::{Psbt, Witness};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::btc_client::BtcRpc;
use crate::coordinator::{SignerStatus, SigningCoordinator};
use crate::shutdown::Shutdown;
use crate::storage::Store;
use crate::types::{WithdrawStatus, WithdrawTx, WithdrawTxStatus};

/// Confirmations required before a batch counts as settled on L1.
const REQUIRED_CONFIRMATIONS: u64 = 6;

/// Co-signer signature sets needed to satisfy the witness script.
const REQUIRED_SIGNATURE_SETS: usize = 2;

/// One per-input signature as shipped by the coordinator.
#[derive(Debug, Clone, Deserialize)]
struct InputSignature {
    /// DER signature plus sighash byte, hex encoded.
    sign: String,
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Coordinator(#[from] crate::coordinator::CoordinatorError),

    #[error("psbt decode: {0}")]
    Psbt(String),

    /// Fewer than two usable signature sets so far; retried next tick.
    #[error("signatures incomplete: {0} of {REQUIRED_SIGNATURE_SETS}")]
    SignaturesIncomplete(usize),

    #[error("witness assembly: {0}")]
    Witness(String),
}

#[derive(Clone)]
pub struct WithdrawBroadcaster {
    store: Arc<Store>,
    btc: Arc<dyn BtcRpc>,
    coordinator: Arc<dyn SigningCoordinator>,
    tick: Duration,
    confirm_tick: Duration,
    shutdown: Shutdown,
}

impl WithdrawBroadcaster {
    pub fn new(
        store: Arc<Store>,
        btc: Arc<dyn BtcRpc>,
        coordinator: Arc<dyn SigningCoordinator>,
        tick: Duration,
        confirm_tick: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            btc,
            coordinator,
            tick,
            confirm_tick,
            shutdown,
        }
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    pub async fn run_broadcast(self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("withdraw broadcaster stopping");
                    return;
                }
                _ = sleep(self.tick) => {}
            }

            let mut batches = Vec::new();
            for status in [
                WithdrawTxStatus::SignaturePending,
                WithdrawTxStatus::SignatureCompleted,
            ] {
                match self.store.withdraw_txs_by_status(status) {
                    Ok(rows) => batches.extend(rows),
                    Err(e) => error!(error = %e, "broadcast batch query failed"),
                }
            }

            for batch in batches {
                if self.shutdown.is_triggered() {
                    return;
                }
                match self.broadcast_batch(&batch).await {
                    Ok(()) => {}
                    Err(BroadcastError::SignaturesIncomplete(have)) => {
                        info!(btc_tx_id = %batch.btc_tx_id, have, "signatures outstanding");
                    }
                    Err(e) => {
                        error!(error = %e, btc_tx_id = %batch.btc_tx_id, "broadcast failed");
                    }
                }
            }
        }
    }

    /// Assemble and broadcast one batch once its signatures are complete.
    pub async fn broadcast_batch(&self, batch: &WithdrawTx) -> Result<(), BroadcastError> {
        let psbt = Psbt::from_str(&batch.psbt).map_err(|e| BroadcastError::Psbt(e.to_string()))?;

        let collected = self.coordinator.query_withdraw(&batch.btc_tx_id).await?;
        let signature_sets = decode_signature_sets(&collected.signatures);
        if signature_sets.len() < REQUIRED_SIGNATURE_SETS {
            return Err(BroadcastError::SignaturesIncomplete(signature_sets.len()));
        }

        if batch.status == WithdrawTxStatus::SignaturePending {
            self.store
                .set_withdraw_tx_status(batch.id, WithdrawTxStatus::SignatureCompleted)?;
        }

        let mut tx = psbt.unsigned_tx.clone();
        for (index, input) in tx.input.iter_mut().enumerate() {
            let witness_script = psbt
                .inputs
                .get(index)
                .and_then(|i| i.witness_utxo.as_ref())
                .map(|utxo| utxo.script_pubkey.clone())
                .ok_or_else(|| {
                    BroadcastError::Witness(format!("input {index} missing witness utxo"))
                })?;

            let first = signature_bytes(&signature_sets[0], index)?;
            let second = signature_bytes(&signature_sets[1], index)?;

            // CHECKMULTISIG pops one extra stack element, hence the leading
            // null.
            input.witness =
                Witness::from_slice(&[Vec::new(), first, second, witness_script.to_bytes()]);
        }

        let tx_hex = bitcoin::consensus::encode::serialize_hex(&tx);
        match self.btc.broadcast(&tx_hex).await {
            Ok(btc_tx_hash) => {
                self.store.record_broadcast(
                    batch.id,
                    WithdrawTxStatus::BroadcastSuccess,
                    Some(&btc_tx_hash),
                    None,
                )?;
                info!(btc_tx_id = %batch.btc_tx_id, btc_tx_hash = %btc_tx_hash, "withdraw batch broadcast");
            }
            Err(e) => {
                self.store.record_broadcast(
                    batch.id,
                    WithdrawTxStatus::BroadcastFailed,
                    None,
                    Some(&e.to_string()),
                )?;
                error!(error = %e, btc_tx_id = %batch.btc_tx_id, "withdraw batch broadcast rejected");
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Confirm
    // ------------------------------------------------------------------

    pub async fn run_confirm(self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("withdraw confirmer stopping");
                    return;
                }
                _ = sleep(self.confirm_tick) => {}
            }

            let batches = match self
                .store
                .withdraw_txs_by_status(WithdrawTxStatus::BroadcastSuccess)
            {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "confirm batch query failed");
                    continue;
                }
            };

            for batch in batches {
                if self.shutdown.is_triggered() {
                    return;
                }
                if let Err(e) = self.confirm_batch(&batch).await {
                    error!(error = %e, btc_tx_id = %batch.btc_tx_id, "confirmation check failed");
                }
            }
        }
    }

    pub async fn confirm_batch(&self, batch: &WithdrawTx) -> Result<(), BroadcastError> {
        let btc_tx_hash = match batch.btc_tx_hash.as_deref() {
            Some(hash) if !hash.is_empty() => hash,
            _ => {
                error!(btc_tx_id = %batch.btc_tx_id, "broadcast batch without l1 hash");
                return Ok(());
            }
        };

        let confirmations = match self.btc.confirmations(btc_tx_hash).await {
            Ok(confirmations) => confirmations,
            Err(e) => {
                // Transient; the row stays broadcast_success for next tick.
                error!(error = %e, btc_tx_hash, "confirmation lookup failed");
                return Ok(());
            }
        };

        if confirmations >= REQUIRED_CONFIRMATIONS {
            self.store
                .set_withdraw_tx_status(batch.id, WithdrawTxStatus::Confirmed)?;
            info!(btc_tx_id = %batch.btc_tx_id, confirmations, "withdraw batch confirmed");
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Finalise
    // ------------------------------------------------------------------

    pub async fn run_finalize(self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("withdraw finaliser stopping");
                    return;
                }
                _ = sleep(self.tick) => {}
            }

            let batches = match self.store.withdraw_txs_finalizable() {
                Ok(rows) => rows,
                Err(e) => {
                    error!(error = %e, "finalise batch query failed");
                    continue;
                }
            };

            for batch in batches {
                if self.shutdown.is_triggered() {
                    return;
                }
                if let Err(e) = self.finalize_batch(&batch).await {
                    error!(error = %e, btc_tx_id = %batch.btc_tx_id, "finalise failed");
                }
            }
        }
    }

    /// Report the terminal state upstream, then flip the batch and its rows
    /// together. A failed batch returns its rows to pending so construction
    /// can retry them in a fresh spend.
    pub async fn finalize_batch(&self, batch: &WithdrawTx) -> Result<(), BroadcastError> {
        let (signer_status, tx_status, withdraw_status) = match batch.status {
            WithdrawTxStatus::Confirmed => (
                SignerStatus::Completed,
                WithdrawTxStatus::Success,
                WithdrawStatus::Success,
            ),
            WithdrawTxStatus::BroadcastFailed => (
                SignerStatus::Failed,
                WithdrawTxStatus::Failed,
                WithdrawStatus::Pending,
            ),
            other => {
                error!(btc_tx_id = %batch.btc_tx_id, status = %other, "batch not finalizable");
                return Ok(());
            }
        };

        // The coordinator must observe the terminal state before local rows
        // lose the batch linkage.
        self.coordinator
            .update_withdraw(&batch.btc_tx_id, signer_status)
            .await?;

        let hashes = batch
            .settled_hashes()
            .map_err(|e| BroadcastError::Witness(format!("hash list decode: {e}")))?;
        self.store
            .finalize_withdraw_tx(batch.id, tx_status, &hashes, withdraw_status)?;

        info!(btc_tx_id = %batch.btc_tx_id, status = %tx_status, "withdraw batch finalised");
        Ok(())
    }
}

/// Decode up to the required number of signature sets; malformed entries are
/// dropped (a co-signer may upload garbage without blocking the others).
fn decode_signature_sets(signatures: &[String]) -> Vec<Vec<InputSignature>> {
    let mut sets = Vec::new();
    for entry in signatures {
        let bytes = match hex::decode(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "signature set not hex, skipping");
                continue;
            }
        };
        match serde_json::from_slice::<Vec<InputSignature>>(&bytes) {
            Ok(set) => sets.push(set),
            Err(e) => {
                error!(error = %e, "signature set not decodable, skipping");
                continue;
            }
        }
        if sets.len() == REQUIRED_SIGNATURE_SETS {
            break;
        }
    }
    sets
}

fn signature_bytes(set: &[InputSignature], index: usize) -> Result<Vec<u8>, BroadcastError> {
    let entry = set
        .get(index)
        .ok_or_else(|| BroadcastError::Witness(format!("no signature for input {index}")))?;
    hex::decode(&entry.sign)
        .map_err(|e| BroadcastError::Witness(format!("signature for input {index}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custody::ListenUtxo;
    use crate::shutdown;
    use crate::testutil::{MockBtc, MockCoordinator};
    use crate::types::Withdraw;
    use crate::withdraw::builder::WithdrawalBuilder;
    use bitcoin::Network;

    const LISTEN: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";
    const DEST: &str = "bcrt1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qzf4jry";
    const PUBKEY_1: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PUBKEY_2: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    struct Fixture {
        store: Arc<Store>,
        btc: Arc<MockBtc>,
        coordinator: Arc<MockCoordinator>,
        broadcaster: WithdrawBroadcaster,
        _shutdown: shutdown::ShutdownHandle,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory().unwrap());
        let btc = Arc::new(MockBtc::default());
        let coordinator = Arc::new(MockCoordinator::default());
        let (handle, observer) = shutdown::channel();

        let broadcaster = WithdrawBroadcaster::new(
            store.clone(),
            btc.clone(),
            coordinator.clone(),
            Duration::from_secs(10),
            Duration::from_secs(300),
            observer,
        );

        Fixture {
            store,
            btc,
            coordinator,
            broadcaster,
            _shutdown: handle,
        }
    }

    /// Build a real one-input batch through the constructor-side builder and
    /// persist it as signature_pending.
    fn seed_batch(store: &Store) -> WithdrawTx {
        store
            .insert_withdraw(&Withdraw {
                id: 0,
                btc_from: LISTEN.to_string(),
                btc_to: DEST.to_string(),
                btc_value: 500,
                b2_block_number: 7,
                b2_block_hash: "0xblock".to_string(),
                b2_tx_hash: "0xb2tx1".to_string(),
                b2_tx_index: 0,
                b2_log_index: 1,
                status: WithdrawStatus::Pending,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
        let pending = store.pending_withdraws().unwrap();
        let ids: Vec<i64> = pending.iter().map(|w| w.id).collect();

        let builder = WithdrawalBuilder::new(
            Network::Regtest,
            LISTEN.to_string(),
            100,
            vec![PUBKEY_1.to_string(), PUBKEY_2.to_string()],
        );
        let built = builder
            .build(
                &[(DEST.to_string(), 500)],
                &[ListenUtxo {
                    txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                        .to_string(),
                    vout: 0,
                    satoshi: 2000,
                    script_pk: String::new(),
                }],
                br#"["0xb2tx1"]"#,
            )
            .unwrap();

        store
            .submit_withdraw_batch(&ids, &built.btc_tx_id, &built.psbt, r#"["0xb2tx1"]"#)
            .unwrap();
        store
            .withdraw_txs_by_status(WithdrawTxStatus::SignaturePending)
            .unwrap()
            .remove(0)
    }

    /// Hex-encoded JSON array with one per-input signature.
    fn signature_set(sig_hex: &str) -> String {
        let json = format!(r#"[{{"sign":"{sig_hex}"}}]"#);
        hex::encode(json.as_bytes())
    }

    #[tokio::test]
    async fn test_broadcast_assembles_canonical_witness() {
        let f = fixture();
        let batch = seed_batch(&f.store);
        f.coordinator.signatures.lock().unwrap().insert(
            batch.btc_tx_id.clone(),
            vec![signature_set("aa01"), signature_set("bb02")],
        );

        f.broadcaster.broadcast_batch(&batch).await.unwrap();

        let rows = f
            .store
            .withdraw_txs_by_status(WithdrawTxStatus::BroadcastSuccess)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].btc_tx_hash.as_deref(), Some("broadcast-txid"));

        // decode what actually went out
        let broadcasts = f.btc.broadcasts.lock().unwrap();
        assert_eq!(broadcasts.len(), 1);
        let raw = hex::decode(&broadcasts[0]).unwrap();
        let tx: bitcoin::Transaction = bitcoin::consensus::encode::deserialize(&raw).unwrap();
        let witness: Vec<_> = tx.input[0].witness.iter().collect();
        assert_eq!(witness.len(), 4);
        assert!(witness[0].is_empty(), "leading null for CHECKMULTISIG");
        assert_eq!(witness[1], [0xaa, 0x01]);
        assert_eq!(witness[2], [0xbb, 0x02]);
        assert!(!witness[3].is_empty(), "witness script present");
    }

    #[tokio::test]
    async fn test_incomplete_signatures_leave_row() {
        let f = fixture();
        let batch = seed_batch(&f.store);
        f.coordinator
            .signatures
            .lock()
            .unwrap()
            .insert(batch.btc_tx_id.clone(), vec![signature_set("aa01")]);

        let result = f.broadcaster.broadcast_batch(&batch).await;
        assert!(matches!(
            result,
            Err(BroadcastError::SignaturesIncomplete(1))
        ));

        let rows = f
            .store
            .withdraw_txs_by_status(WithdrawTxStatus::SignaturePending)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(f.btc.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_broadcast_marks_failed_with_reason() {
        let f = fixture();
        let batch = seed_batch(&f.store);
        f.coordinator.signatures.lock().unwrap().insert(
            batch.btc_tx_id.clone(),
            vec![signature_set("aa01"), signature_set("bb02")],
        );
        *f.btc.broadcast_error.lock().unwrap() = Some("txn-mempool-conflict".to_string());

        f.broadcaster.broadcast_batch(&batch).await.unwrap();

        let rows = f
            .store
            .withdraw_txs_by_status(WithdrawTxStatus::BroadcastFailed)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0]
            .reason
            .as_deref()
            .unwrap()
            .contains("txn-mempool-conflict"));
    }

    #[tokio::test]
    async fn test_confirmer_promotes_at_six_confirmations() {
        let f = fixture();
        let batch = seed_batch(&f.store);
        f.store
            .record_broadcast(
                batch.id,
                WithdrawTxStatus::BroadcastSuccess,
                Some("broadcast-txid"),
                None,
            )
            .unwrap();
        let batch = f
            .store
            .withdraw_txs_by_status(WithdrawTxStatus::BroadcastSuccess)
            .unwrap()
            .remove(0);

        // below threshold: no movement
        f.btc
            .confirmations
            .lock()
            .unwrap()
            .insert("broadcast-txid".to_string(), 3);
        f.broadcaster.confirm_batch(&batch).await.unwrap();
        assert_eq!(
            f.store
                .withdraw_txs_by_status(WithdrawTxStatus::BroadcastSuccess)
                .unwrap()
                .len(),
            1
        );

        f.btc
            .confirmations
            .lock()
            .unwrap()
            .insert("broadcast-txid".to_string(), 6);
        f.broadcaster.confirm_batch(&batch).await.unwrap();
        assert_eq!(
            f.store
                .withdraw_txs_by_status(WithdrawTxStatus::Confirmed)
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_finalise_confirmed_batch() {
        let f = fixture();
        let batch = seed_batch(&f.store);
        f.store
            .set_withdraw_tx_status(batch.id, WithdrawTxStatus::Confirmed)
            .unwrap();
        let batch = f.store.withdraw_txs_finalizable().unwrap().remove(0);

        f.broadcaster.finalize_batch(&batch).await.unwrap();

        let updates = f.coordinator.updates.lock().unwrap();
        assert_eq!(
            updates.as_slice(),
            &[(batch.btc_tx_id.clone(), SignerStatus::Completed)]
        );
        drop(updates);

        let settled = f
            .store
            .withdraws_by_b2_tx_hashes(&["0xb2tx1".to_string()])
            .unwrap();
        assert_eq!(settled[0].status, WithdrawStatus::Success);
        assert!(f.store.withdraw_txs_finalizable().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalise_failed_batch_resets_rows() {
        let f = fixture();
        let batch = seed_batch(&f.store);
        f.store
            .record_broadcast(
                batch.id,
                WithdrawTxStatus::BroadcastFailed,
                None,
                Some("rejected"),
            )
            .unwrap();
        let batch = f.store.withdraw_txs_finalizable().unwrap().remove(0);

        f.broadcaster.finalize_batch(&batch).await.unwrap();

        let updates = f.coordinator.updates.lock().unwrap();
        assert_eq!(updates[0].1, SignerStatus::Failed);
        drop(updates);

        // the rows are pending again, ready for a fresh batch
        assert_eq!(f.store.pending_withdraws().unwrap().len(), 1);
    }

    #[test]
    fn test_decode_signature_sets_drops_garbage() {
        let sets = decode_signature_sets(&[
            "zz-not-hex".to_string(),
            signature_set("aa01"),
            hex::encode(b"not json"),
            signature_set("bb02"),
            signature_set("cc03"),
        ]);

        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0][0].sign, "aa01");
        assert_eq!(sets[1][0].sign, "bb02");
    }
}
