//! Persistent store.
//!
//! All workers coordinate exclusively through this store; rows are
//! partitioned by status set so no in-process lock is needed. Invariants that
//! span tables (notification upsert, withdraw batch submission, batch
//! finalisation) are single SQLite transactions.

mod sqlite;

pub use sqlite::{
    DepositOutcome, IndexedDeposit, NotifiedDeposit, Store, StoreError, WithdrawInsert,
};
