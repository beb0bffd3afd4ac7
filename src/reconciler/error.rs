//! Error types for reconciliation cycles.

use thiserror::Error;

use crate::chain::FetchError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Why a reconciliation cycle stopped before advancing the cursor.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("settlement failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("reconciler storage failed: {0}")]
    Store(#[from] StoreError),

    #[error("settlement task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ReconcileError {
    /// Fatal errors need an operator; everything else is retried next cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Fetch(FetchError::Permanent(_)))
    }
}
