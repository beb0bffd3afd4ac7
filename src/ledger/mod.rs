//! Settlement ledger.
//!
//! The ledger owns user balances and settlement records. Every mutation is
//! appended to a CSV journal and fsynced before the in-memory state changes,
//! so a balance read never observes a settlement that is not durable, and a
//! restart rebuilds exactly the state that was acknowledged.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::Nanoton;
use crate::model::{Settlement, SettlementRecord, TransferId, UserId};
use crate::store::{Journal, StoreError};

mod state;
use state::Account;

mod error;
pub use error::LedgerError;

/// File name of the ledger journal inside the data directory.
pub const LEDGER_FILE: &str = "ledger.csv";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    User,
    Settlement,
}

/// One journal row. `transfer` and `amount` are only set for settlements.
#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    kind: EntryKind,
    user: UserId,
    transfer: Option<TransferId>,
    amount: Option<Nanoton>,
    at: DateTime<Utc>,
}

struct State {
    accounts: HashMap<UserId, Account>,
    settlements: HashMap<TransferId, SettlementRecord>,
    journal: Journal<Entry>,
}

/// Durable store of user balances and settlement records.
///
/// Writers are serialized by a single lock; readers share it.
pub struct Ledger {
    state: RwLock<State>,
}

/// Public API
impl Ledger {
    /// Open the ledger journaled at `path`, replaying every durable entry.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let (journal, entries) = Journal::<Entry>::open(path)?;
        let mut state = State {
            accounts: HashMap::new(),
            settlements: HashMap::new(),
            journal,
        };
        for entry in entries {
            state.replay(entry);
        }
        info!(
            path = %state.journal.path().display(),
            users = state.accounts.len(),
            settlements = state.settlements.len(),
            "ledger opened"
        );
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Create a zero-balance user if absent. Returns the current balance.
    pub fn ensure_user(&self, user: UserId) -> Result<Nanoton, LedgerError> {
        if let Some(account) = self.read().accounts.get(&user) {
            return Ok(account.balance());
        }

        let mut state = self.write();
        if let Some(account) = state.accounts.get(&user) {
            return Ok(account.balance());
        }
        let at = Utc::now();
        state.journal.append(&Entry {
            kind: EntryKind::User,
            user,
            transfer: None,
            amount: None,
            at,
        })?;
        state.accounts.insert(user, Account::default());
        info!(user = %user, "user created");
        Ok(Nanoton::ZERO)
    }

    /// Current balance of `user`; zero for unknown users, which are not created.
    pub fn balance(&self, user: UserId) -> Nanoton {
        self.read()
            .accounts
            .get(&user)
            .map_or(Nanoton::ZERO, Account::balance)
    }

    pub fn contains_user(&self, user: UserId) -> bool {
        self.read().accounts.contains_key(&user)
    }

    /// The settlement record for `transfer`, if it was credited.
    pub fn settlement(&self, transfer: &TransferId) -> Option<SettlementRecord> {
        self.read().settlements.get(transfer).cloned()
    }

    pub fn settlement_count(&self) -> usize {
        self.read().settlements.len()
    }

    /// Credit `amount` to `user` for `transfer`, exactly once.
    ///
    /// If `transfer` already has a settlement record nothing changes and
    /// [`Settlement::AlreadySettled`] is returned. Otherwise the user is
    /// created if absent, the balance is credited and the record written as
    /// one journal entry.
    pub fn settle(
        &self,
        transfer: &TransferId,
        user: UserId,
        amount: Nanoton,
    ) -> Result<Settlement, LedgerError> {
        if amount.is_zero() {
            return Err(LedgerError::InvalidAmount(transfer.clone()));
        }

        let mut state = self.write();
        if let Some(record) = state.settlements.get(transfer) {
            debug!(
                transfer = %transfer,
                user = %record.user,
                amount = %record.amount,
                "transfer already settled"
            );
            return Ok(Settlement::AlreadySettled);
        }

        let balance = state
            .accounts
            .get(&user)
            .map_or(Nanoton::ZERO, Account::balance);
        if balance.checked_add(amount).is_none() {
            return Err(LedgerError::BalanceOverflow {
                transfer: transfer.clone(),
                user,
            });
        }

        let at = Utc::now();
        state.journal.append(&Entry {
            kind: EntryKind::Settlement,
            user,
            transfer: Some(transfer.clone()),
            amount: Some(amount),
            at,
        })?;
        state.credit(transfer.clone(), user, amount, at);

        info!(
            transfer = %transfer,
            user = %user,
            amount = %amount,
            "settlement applied"
        );
        Ok(Settlement::Applied)
    }
}

/// Private API
impl Ledger {
    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl State {
    fn replay(&mut self, entry: Entry) {
        match (entry.kind, entry.transfer, entry.amount) {
            (EntryKind::User, _, _) => {
                self.accounts.entry(entry.user).or_default();
            }
            (EntryKind::Settlement, Some(transfer), Some(amount)) => {
                if self.settlements.contains_key(&transfer) {
                    warn!(transfer = %transfer, "duplicate settlement in journal ignored");
                    return;
                }
                self.credit(transfer, entry.user, amount, entry.at);
            }
            (EntryKind::Settlement, transfer, amount) => {
                warn!(
                    user = %entry.user,
                    ?transfer,
                    ?amount,
                    "incomplete settlement entry in journal ignored"
                );
            }
        }
    }

    /// Apply a settlement whose overflow check already passed.
    fn credit(&mut self, transfer: TransferId, user: UserId, amount: Nanoton, at: DateTime<Utc>) {
        let account = self.accounts.entry(user).or_default();
        if account.credit(amount).is_none() {
            warn!(transfer = %transfer, user = %user, "balance overflow while crediting");
            return;
        }
        self.settlements.insert(
            transfer,
            SettlementRecord {
                user,
                amount,
                settled_at: at,
            },
        );
    }
}
