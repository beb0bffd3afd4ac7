//! Error types for settlement.

use thiserror::Error;

use crate::model::{TransferId, UserId};
use crate::store::StoreError;

/// Error returned by [`Ledger::settle`](super::Ledger::settle) and the other
/// mutating ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("transfer {0}: amount must be positive")]
    InvalidAmount(TransferId),

    #[error("transfer {transfer}: crediting user {user} would overflow the balance")]
    BalanceOverflow { transfer: TransferId, user: UserId },

    #[error("ledger storage failed: {0}")]
    Storage(#[from] StoreError),
}

impl LedgerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}
