//! Shared data types: deposit and withdraw records plus their status
//! machines. Statuses are persisted as snake_case text and modelled as one
//! enum per column, so the dispatcher and reconciler can match exhaustively.

pub mod deposit;
pub mod withdraw;

pub use deposit::{CallbackStatus, Deposit, DepositStatus, EoaStatus, ListenerStatus};
pub use withdraw::{Withdraw, WithdrawStatus, WithdrawTx, WithdrawTxStatus};
