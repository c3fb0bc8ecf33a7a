//! Withdraw tx constructor.
//!
//! Tick-driven batcher: drains every pending Withdraw into one multi-output
//! spend, funds it from the custody provider's UTXO pages, registers the
//! PSBT with the signing coordinator, and commits the batch atomically:
//! the Withdraw rows flip to submitted in the same store transaction that
//! creates the WithdrawTx row.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::coordinator::SigningCoordinator;
use crate::custody::{ListenUtxo, UtxoProvider, UTXO_PAGE_SIZE};
use crate::shutdown::Shutdown;
use crate::storage::Store;

use super::builder::{BuildError, WithdrawalBuilder};

pub struct WithdrawConstructor {
    store: Arc<Store>,
    utxos: Arc<dyn UtxoProvider>,
    coordinator: Arc<dyn SigningCoordinator>,
    builder: WithdrawalBuilder,
    listen_address: String,
    fee: i64,
    tick: Duration,
    shutdown: Shutdown,
}

impl WithdrawConstructor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        utxos: Arc<dyn UtxoProvider>,
        coordinator: Arc<dyn SigningCoordinator>,
        builder: WithdrawalBuilder,
        listen_address: String,
        fee: i64,
        tick: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            utxos,
            coordinator,
            builder,
            listen_address,
            fee,
            tick,
            shutdown,
        }
    }

    pub async fn run(self) {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("withdraw constructor stopping");
                    return;
                }
                _ = sleep(self.tick) => {}
            }

            if let Err(e) = self.construct_batch().await {
                error!(error = %e, "withdraw batch construction failed");
            }
        }
    }

    /// One construction pass. Failures leave every row at its current
    /// status; the next tick retries with fresh chain state.
    pub async fn construct_batch(&self) -> Result<(), ConstructError> {
        let pending = self.store.pending_withdraws()?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(pending.len());
        let mut destinations = Vec::with_capacity(pending.len());
        let mut b2_tx_hashes = Vec::with_capacity(pending.len());
        for withdraw in &pending {
            ids.push(withdraw.id);
            destinations.push((withdraw.btc_to.clone(), withdraw.btc_value));
            b2_tx_hashes.push(withdraw.b2_tx_hash.clone());
        }

        let transfer_total: i64 = pending.iter().map(|w| w.btc_value).sum();
        let utxos = match self.collect_utxos(transfer_total + self.fee).await? {
            Some(utxos) => utxos,
            None => {
                info!("no unspent outputs available, skipping batch");
                return Ok(());
            }
        };

        let hashes_json =
            serde_json::to_string(&b2_tx_hashes).map_err(|e| ConstructError::Encode(e.to_string()))?;
        let built = self
            .builder
            .build(&destinations, &utxos, hashes_json.as_bytes())?;

        // Registration is idempotent on the txid, so it precedes the commit:
        // a crash in between re-registers the identical batch next tick.
        self.coordinator
            .create_withdraw(&built.btc_tx_id, &b2_tx_hashes, &built.psbt)
            .await?;

        self.store
            .submit_withdraw_batch(&ids, &built.btc_tx_id, &built.psbt, &hashes_json)?;

        info!(
            btc_tx_id = %built.btc_tx_id,
            batch = ids.len(),
            total = transfer_total,
            "withdraw batch registered for signing"
        );
        Ok(())
    }

    /// Page through the custody API until the accumulated value covers the
    /// batch. `None` means the address holds no outputs at all.
    async fn collect_utxos(&self, needed: i64) -> Result<Option<Vec<ListenUtxo>>, ConstructError> {
        let first = self.utxos.unspent_page(&self.listen_address, 0).await?;
        let mut utxos = first.utxos;
        if utxos.is_empty() {
            return Ok(None);
        }

        let mut satoshi_total: i64 = utxos.iter().map(|u| u.satoshi).sum();
        if satoshi_total <= needed {
            let pages = first.total / UTXO_PAGE_SIZE;
            for cursor in 1..=pages {
                let page = self.utxos.unspent_page(&self.listen_address, cursor).await?;
                satoshi_total += page.utxos.iter().map(|u| u.satoshi).sum::<i64>();
                utxos.extend(page.utxos);
                if satoshi_total > needed {
                    break;
                }
            }
        }

        Ok(Some(utxos))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConstructError {
    #[error(transparent)]
    Store(#[from] crate::storage::StoreError),

    #[error(transparent)]
    Custody(#[from] crate::custody::CustodyError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Coordinator(#[from] crate::coordinator::CoordinatorError),

    #[error("encode error: {0}")]
    Encode(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown;
    use crate::testutil::{MockCoordinator, MockUtxos};
    use crate::types::{Withdraw, WithdrawStatus, WithdrawTxStatus};
    use bitcoin::Network;

    const LISTEN: &str = "bcrt1qw508d6qejxtdg4y5r3zarvary0c5xw7kygt080";
    const DEST: &str = "bcrt1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qzf4jry";
    const PUBKEY_1: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PUBKEY_2: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn seed_withdraw(store: &Store, log_index: i64, value: i64) {
        store
            .insert_withdraw(&Withdraw {
                id: 0,
                btc_from: LISTEN.to_string(),
                btc_to: DEST.to_string(),
                btc_value: value,
                b2_block_number: 7,
                b2_block_hash: "0xblock".to_string(),
                b2_tx_hash: format!("0xb2tx{log_index}"),
                b2_tx_index: 0,
                b2_log_index: log_index,
                status: WithdrawStatus::Pending,
                created_at: 0,
                updated_at: 0,
            })
            .unwrap();
    }

    fn constructor(
        store: Arc<Store>,
        utxos: Vec<ListenUtxo>,
        coordinator: Arc<MockCoordinator>,
    ) -> WithdrawConstructor {
        let (_handle, observer) = shutdown::channel();
        let builder = WithdrawalBuilder::new(
            Network::Regtest,
            LISTEN.to_string(),
            100,
            vec![PUBKEY_1.to_string(), PUBKEY_2.to_string()],
        );
        WithdrawConstructor::new(
            store,
            Arc::new(MockUtxos { utxos }),
            coordinator,
            builder,
            LISTEN.to_string(),
            100,
            Duration::from_secs(10),
            observer,
        )
    }

    fn utxo(vout: u32, satoshi: i64) -> ListenUtxo {
        ListenUtxo {
            txid: "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
                .to_string(),
            vout,
            satoshi,
            script_pk: String::new(),
        }
    }

    #[tokio::test]
    async fn test_batch_construction_end_to_end() {
        let store = Arc::new(Store::in_memory().unwrap());
        seed_withdraw(&store, 1, 500);
        seed_withdraw(&store, 2, 300);
        seed_withdraw(&store, 3, 200);
        let coordinator = Arc::new(MockCoordinator::default());

        constructor(store.clone(), vec![utxo(0, 2000)], coordinator.clone())
            .construct_batch()
            .await
            .unwrap();

        // every row flipped, one batch registered
        assert!(store.pending_withdraws().unwrap().is_empty());
        let txs = store
            .withdraw_txs_by_status(WithdrawTxStatus::SignaturePending)
            .unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(
            txs[0].settled_hashes().unwrap(),
            vec!["0xb2tx1", "0xb2tx2", "0xb2tx3"]
        );

        let created = coordinator.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, txs[0].btc_tx_id);
        assert_eq!(created[0].2, txs[0].psbt);
    }

    #[tokio::test]
    async fn test_no_pending_rows_is_a_no_op() {
        let store = Arc::new(Store::in_memory().unwrap());
        let coordinator = Arc::new(MockCoordinator::default());

        constructor(store.clone(), vec![utxo(0, 2000)], coordinator.clone())
            .construct_batch()
            .await
            .unwrap();

        assert!(coordinator.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_state_untouched() {
        let store = Arc::new(Store::in_memory().unwrap());
        seed_withdraw(&store, 1, 5000);
        let coordinator = Arc::new(MockCoordinator::default());

        let result = constructor(store.clone(), vec![utxo(0, 2000)], coordinator.clone())
            .construct_batch()
            .await;

        assert!(matches!(
            result,
            Err(ConstructError::Build(BuildError::InsufficientFunds { .. }))
        ));
        assert_eq!(store.pending_withdraws().unwrap().len(), 1);
        assert!(coordinator.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_utxos_skips_batch() {
        let store = Arc::new(Store::in_memory().unwrap());
        seed_withdraw(&store, 1, 500);
        let coordinator = Arc::new(MockCoordinator::default());

        constructor(store.clone(), Vec::new(), coordinator.clone())
            .construct_batch()
            .await
            .unwrap();

        assert_eq!(store.pending_withdraws().unwrap().len(), 1);
        assert!(coordinator.created.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pagination_accumulates_until_covered() {
        let store = Arc::new(Store::in_memory().unwrap());
        seed_withdraw(&store, 1, 20_000);
        let coordinator = Arc::new(MockCoordinator::default());

        // 17 tiny outputs on page 0, one large on page 1
        let mut utxos: Vec<ListenUtxo> = (0..16).map(|i| utxo(i, 100)).collect();
        utxos.push(utxo(100, 25_000));

        constructor(store.clone(), utxos, coordinator.clone())
            .construct_batch()
            .await
            .unwrap();

        assert!(store.pending_withdraws().unwrap().is_empty());
        assert_eq!(coordinator.created.lock().unwrap().len(), 1);
    }
}
