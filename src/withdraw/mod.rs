//! Withdraw pipeline: scanner, constructor, broadcaster.
//!
//! L2 withdraw events become Withdraw rows (scanner), pending rows are
//! batched into one multi-output PSBT registered with the signing
//! coordinator (constructor), and completed signature sets are assembled
//! into the final witness, broadcast, confirmed and reported back
//! (broadcaster / confirmer / finaliser).

mod broadcaster;
mod builder;
mod constructor;
mod scanner;

pub use broadcaster::WithdrawBroadcaster;
pub use builder::{BuildError, BuiltWithdrawal, WithdrawalBuilder};
pub use constructor::WithdrawConstructor;
pub use scanner::WithdrawScanner;
