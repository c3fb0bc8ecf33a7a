//! Bridge orchestrator between a Bitcoin-style L1 and an EVM rollup.
//!
//! The orchestrator moves value one way (L1 → L2) and materialises L2
//! withdraw events back into multi-signed L1 spends. Everything is driven by
//! a set of independent tick-based workers that coordinate only through the
//! persistent store and a process-wide shutdown broadcast:
//!
//! 1. **Indexer** - walks L1 blocks and records deposits to the listen
//!    address.
//! 2. **Notify ingestor** - second, independent deposit source fed by the
//!    custody provider's callbacks.
//! 3. **Deposit dispatcher / reconciler** - submit the L2 deposit call and
//!    drive every ambiguous submission to a terminal state.
//! 4. **Withdraw scanner / constructor / broadcaster** - batch L2 withdraw
//!    events into one PSBT, collect threshold signatures through the
//!    external coordinator, broadcast and confirm on L1.
//!
//! ## Module Organization
//!
//! - `config` - environment-based configuration
//! - `logging` - tracing setup
//! - `shutdown` - process-wide shutdown broadcast
//! - `types/` - deposit/withdraw records and status machines
//! - `storage/` - pooled SQLite store and cursor rows
//! - `btc_client` - L1 JSON-RPC client
//! - `rollup/` - L2 client (deposit call, wait-mined, log scan)
//! - `aa` - L1-address → smart-account translation clients
//! - `custody` - custody-provider UTXO lookup
//! - `coordinator` - multi-sig signing coordinator client
//! - `indexer`, `notify`, `deposit/`, `withdraw/` - the workers
//! - `api` - notification gateway + health probe
//! - `server` - worker supervision

pub mod aa;
pub mod api;
pub mod btc_client;
pub mod config;
pub mod coordinator;
pub mod custody;
pub mod deposit;
pub mod indexer;
pub mod logging;
pub mod notify;
pub mod rollup;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod types;
pub mod withdraw;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Config, ConfigError, Network};
pub use shutdown::{Shutdown, ShutdownHandle};
pub use storage::Store;

/// Satoshi conversion helpers
pub mod units {
    /// Wei credited on the rollup per satoshi deposited (10^18 / 10^8).
    pub const WEI_PER_SAT: u64 = 10_000_000_000;

    pub const SATS_PER_BTC: u64 = 100_000_000;

    pub fn sats_to_btc(sats: u64) -> f64 {
        sats as f64 / SATS_PER_BTC as f64
    }

    pub fn format_sats(sats: u64) -> String {
        format!("{} sats ({:.8} BTC)", sats, sats_to_btc(sats))
    }
}
