//! Hand-rolled mock clients for worker tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::aa::{AaError, AddressTranslator};
use crate::config::{Config, Network};
use crate::btc_client::{BlockScan, BtcError, BtcRpc};
use crate::coordinator::{CoordinatorError, SignerStatus, SigningCoordinator, WithdrawSignatures};
use crate::custody::{CustodyError, ListenUtxo, UtxoPage, UtxoProvider, UTXO_PAGE_SIZE};
use crate::rollup::{
    RollupBridge, RollupError, SubmittedTx, TxLookup, TxTemplate, WaitMinedError, WithdrawEvent,
};

/// Devnet-grade configuration for worker tests.
pub fn test_config() -> Config {
    Config {
        network: Network::Regtest,
        db_path: ":memory:".to_string(),
        http_port: 0,
        log_level: "info".to_string(),
        log_json: false,
        listen_address: "bc1qlisten".to_string(),
        btc_rpc_url: "http://127.0.0.1:18443".to_string(),
        btc_rpc_user: String::new(),
        btc_rpc_pass: String::new(),
        btc_confirmations: 6,
        rollup_rpc_url: "http://127.0.0.1:8545".to_string(),
        contract_address: "0x0000000000000000000000000000000000000001".to_string(),
        bridge_priv_key: String::new(),
        gas_price_multiple: 2,
        enable_eoa_transfer: false,
        aa_pubkey_api: String::new(),
        aa_account_api: String::new(),
        custody_api: String::new(),
        custody_api_key: String::new(),
        coordinator_api: String::new(),
        withdraw_fee: 100,
        multisig_pubkeys: vec!["02aa".to_string(), "03bb".to_string()],
        batch_limit: 100,
        deposit_tick_secs: 10,
        deposit_pause_secs: 1,
        deposit_backoff_secs: 600,
        wait_mined_timeout_secs: 7200,
        indexer_tick_secs: 60,
        withdraw_tick_secs: 10,
        confirm_tick_secs: 300,
    }
}

/// Scripted L1 node.
#[derive(Default)]
pub struct MockBtc {
    pub height: AtomicI64,
    /// Blocks by height.
    pub blocks: Mutex<HashMap<i64, BlockScan>>,
    /// Confirmations by txid; unknown txids resolve to this default.
    pub confirmations: Mutex<HashMap<String, u64>>,
    pub default_confirmations: u64,
    /// Broadcast tx hexes, in order.
    pub broadcasts: Mutex<Vec<String>>,
    /// When set, broadcasts fail with this message.
    pub broadcast_error: Mutex<Option<String>>,
}

impl MockBtc {
    pub fn with_confirmations(confs: u64) -> Self {
        Self {
            default_confirmations: confs,
            ..Default::default()
        }
    }
}

#[async_trait]
impl BtcRpc for MockBtc {
    async fn latest_height(&self) -> Result<i64, BtcError> {
        Ok(self.height.load(Ordering::SeqCst))
    }

    async fn scan_block(&self, height: i64, from_tx_index: i64) -> Result<BlockScan, BtcError> {
        let blocks = self.blocks.lock().unwrap();
        let scan = blocks.get(&height).ok_or(BtcError::Rpc {
            code: -5,
            message: format!("block {height} not found"),
        })?;
        Ok(BlockScan {
            deposits: scan
                .deposits
                .iter()
                .filter(|d| d.tx_index >= from_tx_index)
                .cloned()
                .collect(),
            block_time: scan.block_time,
        })
    }

    async fn confirmations(&self, txid: &str) -> Result<u64, BtcError> {
        let map = self.confirmations.lock().unwrap();
        Ok(*map.get(txid).unwrap_or(&self.default_confirmations))
    }

    async fn broadcast(&self, tx_hex: &str) -> Result<String, BtcError> {
        if let Some(message) = self.broadcast_error.lock().unwrap().clone() {
            return Err(BtcError::Rpc { code: -26, message });
        }
        self.broadcasts.lock().unwrap().push(tx_hex.to_string());
        Ok("broadcast-txid".to_string())
    }
}

/// Scripted rollup node. Results are consumed front-to-back; an empty queue
/// falls back to success with generated hashes.
#[derive(Default)]
pub struct MockRollup {
    pub deposit_calls: Mutex<Vec<(String, String, i64, Option<u64>)>>,
    pub replace_calls: Mutex<Vec<TxTemplate>>,
    pub transfer_calls: Mutex<Vec<(String, i64)>>,
    pub deposit_results: Mutex<VecDeque<Result<SubmittedTx, RollupError>>>,
    pub wait_results: Mutex<VecDeque<Result<(), WaitMinedError>>>,
    pub receipts: Mutex<HashMap<String, Option<bool>>>,
    pub lookups: Mutex<HashMap<String, TxLookup>>,
    pub latest: AtomicI64,
    pub events: Mutex<HashMap<u64, Vec<WithdrawEvent>>>,
    pub next_nonce: AtomicI64,
}

impl MockRollup {
    pub fn push_deposit_result(&self, result: Result<SubmittedTx, RollupError>) {
        self.deposit_results.lock().unwrap().push_back(result);
    }

    pub fn push_wait_result(&self, result: Result<(), WaitMinedError>) {
        self.wait_results.lock().unwrap().push_back(result);
    }

    fn next_submitted(&self, nonce: Option<u64>, gas_price: u128) -> SubmittedTx {
        let nonce = nonce.unwrap_or_else(|| self.next_nonce.fetch_add(1, Ordering::SeqCst) as u64);
        SubmittedTx {
            tx_hash: format!("0xsub{nonce}"),
            nonce,
            gas_price,
        }
    }
}

#[async_trait]
impl RollupBridge for MockRollup {
    async fn deposit(
        &self,
        l1_tx_hash: &str,
        recipient: &str,
        value_sats: i64,
        nonce: Option<u64>,
    ) -> Result<SubmittedTx, RollupError> {
        self.deposit_calls.lock().unwrap().push((
            l1_tx_hash.to_string(),
            recipient.to_string(),
            value_sats,
            nonce,
        ));
        match self.deposit_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(self.next_submitted(nonce, 1)),
        }
    }

    async fn replace(&self, template: &TxTemplate) -> Result<SubmittedTx, RollupError> {
        self.replace_calls.lock().unwrap().push(template.clone());
        let bumped = (template.gas_price * 2).max(template.gas_price);
        Ok(SubmittedTx {
            tx_hash: format!("0xreplace{}", template.nonce),
            nonce: template.nonce,
            gas_price: bumped,
        })
    }

    async fn transfer(&self, recipient: &str, value_sats: i64) -> Result<SubmittedTx, RollupError> {
        self.transfer_calls
            .lock()
            .unwrap()
            .push((recipient.to_string(), value_sats));
        Ok(self.next_submitted(None, 1))
    }

    async fn wait_mined(&self, _tx_hash: &str, _timeout: Duration) -> Result<(), WaitMinedError> {
        match self.wait_results.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(()),
        }
    }

    async fn receipt_status(&self, tx_hash: &str) -> Result<Option<bool>, RollupError> {
        Ok(self
            .receipts
            .lock()
            .unwrap()
            .get(tx_hash)
            .copied()
            .flatten())
    }

    async fn lookup_transaction(&self, tx_hash: &str) -> Result<TxLookup, RollupError> {
        Ok(self
            .lookups
            .lock()
            .unwrap()
            .get(tx_hash)
            .cloned()
            .unwrap_or(TxLookup::NotFound))
    }

    async fn latest_block(&self) -> Result<u64, RollupError> {
        Ok(self.latest.load(Ordering::SeqCst) as u64)
    }

    async fn withdraw_events(&self, block: u64) -> Result<Vec<WithdrawEvent>, RollupError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .get(&block)
            .cloned()
            .unwrap_or_default())
    }
}

/// Scripted address translator.
#[derive(Default)]
pub struct MockTranslator {
    /// Explicit per-address outcomes; `true` marks not-found.
    pub not_found: Mutex<HashMap<String, bool>>,
    pub account: String,
}

impl MockTranslator {
    pub fn resolving_to(account: &str) -> Self {
        Self {
            not_found: Mutex::new(HashMap::new()),
            account: account.to_string(),
        }
    }

    pub fn set_not_found(&self, address: &str, missing: bool) {
        self.not_found
            .lock()
            .unwrap()
            .insert(address.to_string(), missing);
    }
}

#[async_trait]
impl AddressTranslator for MockTranslator {
    async fn smart_account(&self, btc_address: &str) -> Result<String, AaError> {
        if self
            .not_found
            .lock()
            .unwrap()
            .get(btc_address)
            .copied()
            .unwrap_or(false)
        {
            return Err(AaError::NotFound);
        }
        Ok(self.account.clone())
    }
}

/// Fixed UTXO set served in custody-API pages.
pub struct MockUtxos {
    pub utxos: Vec<ListenUtxo>,
}

#[async_trait]
impl UtxoProvider for MockUtxos {
    async fn unspent_page(&self, _address: &str, cursor: i64) -> Result<UtxoPage, CustodyError> {
        let start = (cursor * UTXO_PAGE_SIZE) as usize;
        let end = (start + UTXO_PAGE_SIZE as usize).min(self.utxos.len());
        let page = if start < self.utxos.len() {
            self.utxos[start..end].to_vec()
        } else {
            Vec::new()
        };
        Ok(UtxoPage {
            total: self.utxos.len() as i64,
            utxos: page,
        })
    }
}

/// Scripted signing coordinator.
#[derive(Default)]
pub struct MockCoordinator {
    pub created: Mutex<Vec<(String, Vec<String>, String)>>,
    pub signatures: Mutex<HashMap<String, Vec<String>>>,
    pub updates: Mutex<Vec<(String, SignerStatus)>>,
    /// Registrations that should report "already registered".
    pub existing: Mutex<Vec<String>>,
}

#[async_trait]
impl SigningCoordinator for MockCoordinator {
    async fn create_withdraw(
        &self,
        btc_tx_id: &str,
        b2_tx_hashes: &[String],
        psbt: &str,
    ) -> Result<(), CoordinatorError> {
        // Re-registering an existing txid is idempotent, mirroring the
        // coordinator's wire behaviour.
        if !self
            .existing
            .lock()
            .unwrap()
            .contains(&btc_tx_id.to_string())
        {
            self.created.lock().unwrap().push((
                btc_tx_id.to_string(),
                b2_tx_hashes.to_vec(),
                psbt.to_string(),
            ));
        }
        Ok(())
    }

    async fn query_withdraw(&self, btc_tx_id: &str) -> Result<WithdrawSignatures, CoordinatorError> {
        let map = self.signatures.lock().unwrap();
        let signatures = map
            .get(btc_tx_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::NotFound(btc_tx_id.to_string()))?;
        Ok(WithdrawSignatures { signatures })
    }

    async fn update_withdraw(
        &self,
        btc_tx_id: &str,
        status: SignerStatus,
    ) -> Result<(), CoordinatorError> {
        self.updates
            .lock()
            .unwrap()
            .push((btc_tx_id.to_string(), status));
        Ok(())
    }
}
