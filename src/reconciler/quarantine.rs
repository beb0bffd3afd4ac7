use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Nanoton;
use crate::memo::ParseFailure;
use crate::model::{Cursor, Transfer, TransferId};
use crate::store::{Journal, StoreError};

/// Why a transfer could not be credited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuarantineReason {
    Empty,
    NotNumeric,
    UnknownUser,
    #[serde(rename = "zero-or-negative-amount")]
    ZeroAmount,
    ForeignDestination,
    BalanceOverflow,
}

impl QuarantineReason {
    pub fn as_str(self) -> &'static str {
        match self {
            QuarantineReason::Empty => "empty",
            QuarantineReason::NotNumeric => "not-numeric",
            QuarantineReason::UnknownUser => "unknown-user",
            QuarantineReason::ZeroAmount => "zero-or-negative-amount",
            QuarantineReason::ForeignDestination => "foreign-destination",
            QuarantineReason::BalanceOverflow => "balance-overflow",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ParseFailure> for QuarantineReason {
    fn from(failure: ParseFailure) -> Self {
        match failure {
            ParseFailure::Empty => QuarantineReason::Empty,
            ParseFailure::NotNumeric => QuarantineReason::NotNumeric,
            ParseFailure::UnknownUser => QuarantineReason::UnknownUser,
        }
    }
}

/// A transfer held for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub transfer: TransferId,
    pub reason: QuarantineReason,
    pub source: String,
    pub amount: Nanoton,
    pub comment: String,
    pub position: Cursor,
    pub quarantined_at: DateTime<Utc>,
}

/// Durable record of transfers that reached a terminal state without being
/// credited. Each transfer is recorded at most once.
pub struct Quarantine {
    journal: Journal<QuarantineEntry>,
    entries: Vec<QuarantineEntry>,
    seen: HashSet<TransferId>,
}

impl Quarantine {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let (journal, entries) = Journal::<QuarantineEntry>::open(path)?;
        let seen = entries.iter().map(|e| e.transfer.clone()).collect();
        Ok(Self {
            journal,
            entries,
            seen,
        })
    }

    /// Durably record `transfer`. Returns `false` if it was already recorded.
    pub fn record(
        &mut self,
        transfer: &Transfer,
        reason: QuarantineReason,
    ) -> Result<bool, StoreError> {
        if self.seen.contains(&transfer.id) {
            return Ok(false);
        }
        let entry = QuarantineEntry {
            transfer: transfer.id.clone(),
            reason,
            source: transfer.source.clone(),
            amount: transfer.amount,
            comment: transfer.comment.clone(),
            position: transfer.position,
            quarantined_at: Utc::now(),
        };
        self.journal.append(&entry)?;
        self.seen.insert(entry.transfer.clone());
        self.entries.push(entry);
        Ok(true)
    }

    pub fn contains(&self, transfer: &TransferId) -> bool {
        self.seen.contains(transfer)
    }

    pub fn get(&self, transfer: &TransferId) -> Option<&QuarantineEntry> {
        self.entries.iter().find(|e| &e.transfer == transfer)
    }

    /// Entries in the order they were quarantined.
    pub fn entries(&self) -> &[QuarantineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn transfer(lt: u64, comment: &str) -> Transfer {
        Transfer {
            id: TransferId::new("h", lt),
            source: "EQsender".to_string(),
            destination: "EQdeposit".to_string(),
            amount: Nanoton::from_ton(1),
            comment: comment.to_string(),
            position: lt,
        }
    }

    #[test]
    fn records_once() {
        let dir = TempDir::new().unwrap();
        let mut quarantine = Quarantine::open(dir.path().join("q.csv")).unwrap();
        let t = transfer(1, "hello");

        assert!(quarantine.record(&t, QuarantineReason::NotNumeric).unwrap());
        assert!(!quarantine.record(&t, QuarantineReason::NotNumeric).unwrap());
        assert_eq!(quarantine.len(), 1);
        assert!(quarantine.contains(&t.id));

        let entry = quarantine.get(&t.id).unwrap();
        assert_eq!(entry.reason, QuarantineReason::NotNumeric);
        assert_eq!(entry.comment, "hello");
        assert_eq!(entry.amount, Nanoton::from_ton(1));
    }

    #[test]
    fn survives_reopen_and_stays_deduplicated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("q.csv");
        {
            let mut quarantine = Quarantine::open(&path).unwrap();
            quarantine
                .record(&transfer(1, ""), QuarantineReason::Empty)
                .unwrap();
            quarantine
                .record(&transfer(2, "a,\"b\"\nc"), QuarantineReason::NotNumeric)
                .unwrap();
        }
        let mut quarantine = Quarantine::open(&path).unwrap();
        assert_eq!(quarantine.len(), 2);
        assert_eq!(quarantine.entries()[1].comment, "a,\"b\"\nc");
        assert!(!quarantine
            .record(&transfer(1, ""), QuarantineReason::Empty)
            .unwrap());
    }

    #[test]
    fn reason_tags() {
        assert_eq!(QuarantineReason::ZeroAmount.to_string(), "zero-or-negative-amount");
        assert_eq!(
            QuarantineReason::from(ParseFailure::NotNumeric),
            QuarantineReason::NotNumeric
        );
        assert_eq!(QuarantineReason::ForeignDestination.as_str(), "foreign-destination");
    }
}
