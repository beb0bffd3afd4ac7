//! Core domain types shared by the chain reader, the ledger and the reconciler.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Nanoton;

/// Chat platform user identifier.
pub type UserId = u64;

/// Position in the chain's transaction order (TON logical time).
pub type Cursor = u64;

/// Chain-assigned transfer identifier: transaction hash plus logical time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

impl TransferId {
    pub fn new(hash: &str, lt: Cursor) -> Self {
        TransferId(format!("{hash}:{lt}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TransferId {
    fn from(value: String) -> Self {
        TransferId(value)
    }
}

/// An incoming transfer to the deposit address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub id: TransferId,
    pub source: String,
    pub destination: String,
    pub amount: Nanoton,
    /// Raw comment as sent by the depositor, possibly empty.
    pub comment: String,
    /// Chain sequence position, used for cursor ordering.
    pub position: Cursor,
}

/// Proof that a transfer's amount was applied to a user's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    pub user: UserId,
    pub amount: Nanoton,
    pub settled_at: DateTime<Utc>,
}

/// Outcome of a settle call. Both variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// The amount was credited by this call.
    Applied,
    /// A settlement record already existed; nothing changed.
    AlreadySettled,
}
