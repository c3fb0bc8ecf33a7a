//! Withdraw event scanner.
//!
//! Walks L2 blocks from the persisted (block, tx index, log index) cursor
//! and records one Withdraw row per withdraw event on the bridge contract.
//! The cursor advances after each inserted log; rescans are harmless because
//! the (block, tx, log) triple is unique in the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::rollup::{RollupBridge, WithdrawEvent};
use crate::shutdown::Shutdown;
use crate::storage::{Store, StoreError, WithdrawInsert};
use crate::types::{Withdraw, WithdrawStatus};

pub struct WithdrawScanner {
    store: Arc<Store>,
    bridge: Arc<dyn RollupBridge>,
    listen_address: String,
    tick: Duration,
    shutdown: Shutdown,
}

impl WithdrawScanner {
    pub fn new(
        store: Arc<Store>,
        bridge: Arc<dyn RollupBridge>,
        listen_address: String,
        tick: Duration,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            bridge,
            listen_address,
            tick,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<(), StoreError> {
        loop {
            let mut shutdown = self.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("withdraw scanner stopping");
                    return Ok(());
                }
                _ = sleep(self.tick) => {}
            }

            let latest = match self.bridge.latest_block().await {
                Ok(block) => block,
                Err(e) => {
                    error!(error = %e, "rollup latest block failed");
                    continue;
                }
            };

            if let Err(e) = self.catch_up(latest).await {
                error!(error = %e, "withdraw scan pass failed");
            }

            if self.shutdown.is_triggered() {
                warn!("withdraw scanner stopping");
                return Ok(());
            }
        }
    }

    /// Scan from the persisted cursor up to `latest`, inclusive. The cursor
    /// block is rescanned since it may hold logs past the cursor position.
    pub async fn catch_up(&self, latest: u64) -> Result<(), StoreError> {
        let (mut cursor_block, mut cursor_tx, mut cursor_log) =
            self.store.load_withdraw_cursor(latest as i64)?;

        if latest as i64 == cursor_block {
            return Ok(());
        }

        let mut block = cursor_block.max(0) as u64;
        while block <= latest {
            if self.shutdown.is_triggered() {
                return Ok(());
            }

            let events = match self.bridge.withdraw_events(block).await {
                Ok(events) => events,
                Err(e) => {
                    error!(error = %e, block, "withdraw log fetch failed");
                    return Ok(());
                }
            };

            for event in events {
                if !exceeds_cursor(&event, (cursor_block, cursor_tx, cursor_log)) {
                    continue;
                }

                let row = Withdraw {
                    id: 0,
                    btc_from: self.listen_address.clone(),
                    btc_to: event.to.clone(),
                    btc_value: event.amount,
                    b2_block_number: event.block_number as i64,
                    b2_block_hash: event.block_hash.clone(),
                    b2_tx_hash: event.tx_hash.clone(),
                    b2_tx_index: event.tx_index,
                    b2_log_index: event.log_index,
                    status: WithdrawStatus::Pending,
                    created_at: 0,
                    updated_at: 0,
                };

                match self.store.insert_withdraw(&row)? {
                    WithdrawInsert::Created => {
                        info!(
                            block,
                            tx_hash = %event.tx_hash,
                            to = %event.to,
                            amount = event.amount,
                            "withdraw recorded"
                        );
                    }
                    WithdrawInsert::Duplicate => {
                        info!(block, tx_hash = %event.tx_hash, "withdraw log already recorded");
                    }
                }

                cursor_block = event.block_number as i64;
                cursor_tx = event.tx_index;
                cursor_log = event.log_index;
                self.store
                    .set_withdraw_cursor(cursor_block, cursor_tx, cursor_log)?;
            }

            cursor_block = block as i64;
            self.store
                .set_withdraw_cursor(cursor_block, cursor_tx, cursor_log)?;
            block += 1;
        }

        Ok(())
    }
}

/// True when the event lies strictly past the cursor position.
fn exceeds_cursor(event: &WithdrawEvent, cursor: (i64, i64, i64)) -> bool {
    (
        event.block_number as i64,
        event.tx_index,
        event.log_index,
    ) > cursor
}
