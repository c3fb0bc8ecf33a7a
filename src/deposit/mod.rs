//! Deposit pipeline: dispatcher and reconciler.
//!
//! The dispatcher owns rows in the retriable statuses and drives fresh
//! submissions; the reconciler owns rows whose submission is ambiguous
//! (timed out, stuck in the mempool, lost) and re-enters the dispatcher's
//! submit path with the stored nonce or the old transaction as template.

mod dispatcher;
mod reconciler;

pub use dispatcher::{DepositDispatcher, HandleError, SubmitMode};
pub use reconciler::DepositReconciler;
