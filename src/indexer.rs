//! L1 indexer loop.
//!
//! Walks L1 blocks from the persisted (block, tx index) cursor and records
//! one Deposit row per transaction paying the listen address. The cursor and
//! the row commit in the same store transaction, so a crash can only leave
//! the cursor at or behind the last committed position; rescanning is
//! idempotent thanks to the tx-hash uniqueness constraint.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::btc_client::BtcRpc;
use crate::shutdown::Shutdown;
use crate::storage::{IndexedDeposit, Store, StoreError};

pub struct Indexer {
    store: Arc<Store>,
    btc: Arc<dyn BtcRpc>,
    listen_address: String,
    tick: Duration,
    shutdown: Shutdown,
}

impl Indexer {
    pub fn new(
        store: Arc<Store>,
        btc: Arc<dyn BtcRpc>,
        listen_address: String,
        tick: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            btc,
            listen_address,
            tick,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), StoreError> {
        // First run starts at the node tip; catching up history is a
        // deliberate operator action via the cursor row.
        let latest = loop {
            match self.btc.latest_height().await {
                Ok(height) => break height,
                Err(e) => {
                    error!(error = %e, "latest height failed, retrying");
                    if self.sleep_or_shutdown().await {
                        return Ok(());
                    }
                }
            }
        };
        let cursor = self.store.load_btc_cursor(latest)?;
        info!(block = cursor.0, tx_index = cursor.1, "indexer cursor loaded");

        loop {
            if self.sleep_or_shutdown().await {
                warn!("indexer stopping");
                return Ok(());
            }

            let latest = match self.btc.latest_height().await {
                Ok(height) => height,
                Err(e) => {
                    error!(error = %e, "latest height failed");
                    continue;
                }
            };

            if let Err(e) = self.catch_up(latest).await {
                error!(error = %e, "indexer pass failed");
            }

            if self.shutdown.is_triggered() {
                warn!("indexer stopping");
                return Ok(());
            }
        }
    }

    /// Advance from the persisted cursor up to `latest`. Any error leaves the
    /// cursor on the unprocessed range so the next tick retries from there.
    pub async fn catch_up(&self, latest: i64) -> Result<(), StoreError> {
        let (cursor_block, cursor_tx) = self.store.load_btc_cursor(latest)?;
        if latest <= cursor_block {
            return Ok(());
        }

        // tx index 0 means the block completed; > 0 means resume inside it.
        let (mut block, mut from_tx_index) = if cursor_tx == 0 {
            (cursor_block + 1, 0)
        } else {
            (cursor_block, cursor_tx + 1)
        };

        while block <= latest {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            let scan = match self.btc.scan_block(block, from_tx_index).await {
                Ok(scan) => scan,
                Err(e) => {
                    error!(error = %e, block, "block scan failed");
                    return Ok(());
                }
            };

            for deposit in &scan.deposits {
                if self.shutdown.is_triggered() {
                    return Ok(());
                }
                let sender = match deposit.froms.first() {
                    Some(sender) => sender.clone(),
                    None => continue,
                };
                // Self-spends from the listen address are change movement,
                // not deposits.
                if sender == self.listen_address {
                    info!(tx_hash = %deposit.tx_hash, "skipping self-spend");
                    continue;
                }

                let froms = serde_json::to_string(&deposit.froms)
                    .unwrap_or_else(|_| "[]".to_string());
                let row = IndexedDeposit {
                    btc_block_number: block,
                    btc_tx_index: deposit.tx_index,
                    btc_tx_hash: deposit.tx_hash.clone(),
                    btc_from: sender,
                    btc_froms: froms,
                    btc_to: deposit.to.clone(),
                    btc_value: deposit.value_sats,
                    btc_block_time: scan.block_time,
                };
                self.store
                    .record_indexed_deposit(&row, (block, deposit.tx_index))?;

                info!(
                    block,
                    tx_index = deposit.tx_index,
                    tx_hash = %deposit.tx_hash,
                    value = deposit.value_sats,
                    "deposit recorded"
                );
            }

            self.store.set_btc_cursor(block, 0)?;
            block += 1;
            from_tx_index = 0;
        }

        Ok(())
    }

    /// Returns true when shutdown fired during the tick sleep.
    async fn sleep_or_shutdown(&self) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.triggered() => true,
            _ = tokio::time::sleep(self.tick) => false,
        }
    }
}
