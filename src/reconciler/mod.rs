//! Deposit reconciler.
//!
//! Each cycle fetches the transfers past the persisted cursor, gives every
//! one of them a terminal disposition (settled or quarantined) in chain
//! order, and only then persists the cursor returned by the chain reader.
//! A crash or error anywhere before that point leaves the cursor where it
//! was, and the next cycle re-processes the same batch; settlement
//! idempotence absorbs the repetition.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::chain::ChainReader;
use crate::ledger::{Ledger, LedgerError};
use crate::memo;
use crate::model::{Cursor, Settlement, Transfer, UserId};
use crate::store::{CursorStore, StoreError};

mod error;
pub use error::ReconcileError;

mod quarantine;
pub use quarantine::{Quarantine, QuarantineEntry, QuarantineReason};

pub mod supervisor;

/// File names inside the data directory.
pub const CURSOR_FILE: &str = "cursor.csv";
pub const QUARANTINE_FILE: &str = "quarantine.csv";

/// What to do with a well-formed user id that has no account yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributionPolicy {
    /// Create the account and credit it.
    #[default]
    CreditOnDemand,
    /// Quarantine the transfer as `unknown-user`.
    RequireKnownUser,
}

impl FromStr for AttributionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit-on-demand" => Ok(AttributionPolicy::CreditOnDemand),
            "require-known-user" => Ok(AttributionPolicy::RequireKnownUser),
            other => Err(format!(
                "unknown attribution policy '{other}', expected credit-on-demand or require-known-user"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub deposit_address: String,
    pub poll_interval: Duration,
    pub attribution: AttributionPolicy,
}

/// Where the reconciler is within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Fetching,
    Parsing,
    Settling,
    Advancing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Fetching => "fetching",
            Phase::Parsing => "parsing",
            Phase::Settling => "settling",
            Phase::Advancing => "advancing",
        };
        f.write_str(name)
    }
}

/// Counters for one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    pub cursor_before: Cursor,
    pub cursor_after: Cursor,
    pub fetched: usize,
    pub settled: usize,
    /// Transfers that already had a settlement record.
    pub duplicates: usize,
    pub quarantined: usize,
}

/// Operator-facing view of reconciler progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilerStatus {
    pub phase: Phase,
    pub cursor: Cursor,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl ReconcilerStatus {
    /// Time since the last successful cycle; `None` before the first one.
    pub fn lag(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.last_success.map(|at| now - at)
    }

    /// Whether no cycle succeeded within `threshold`, or none ever did while
    /// cycles keep failing.
    pub fn is_stalled(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match self.lag(now) {
            Some(lag) => lag.to_std().is_ok_and(|lag| lag > threshold),
            None => self.consecutive_failures > 0,
        }
    }
}

enum Disposition {
    Credit(UserId),
    Reject(QuarantineReason),
}

/// Pulls transfers from a [`ChainReader`] and settles them on the [`Ledger`].
pub struct Reconciler<R> {
    reader: R,
    ledger: Arc<Ledger>,
    cursor: CursorStore,
    quarantine: Quarantine,
    settings: ReconcilerSettings,
    status: watch::Sender<ReconcilerStatus>,
}

/// Public API
impl<R: ChainReader> Reconciler<R> {
    /// Build a reconciler whose cursor and quarantine live in `data_dir`.
    pub fn open(
        reader: R,
        ledger: Arc<Ledger>,
        data_dir: impl AsRef<Path>,
        settings: ReconcilerSettings,
    ) -> Result<Self, StoreError> {
        let data_dir = data_dir.as_ref();
        let cursor = CursorStore::new(data_dir.join(CURSOR_FILE));
        let quarantine = Quarantine::open(data_dir.join(QUARANTINE_FILE))?;
        let (status, _) = watch::channel(ReconcilerStatus {
            cursor: cursor.load()?,
            ..ReconcilerStatus::default()
        });
        Ok(Self {
            reader,
            ledger,
            cursor,
            quarantine,
            settings,
            status,
        })
    }

    /// Run cycles every poll interval until `shutdown` flips to `true` or its
    /// sender is dropped.
    ///
    /// Shutdown is only observed between cycles, so an in-flight cycle always
    /// finishes. Transient errors are logged and retried next cycle; a fatal
    /// error is returned.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ReconcileError> {
        info!(
            address = %self.settings.deposit_address,
            interval = ?self.settings.poll_interval,
            "reconciler started"
        );
        while !*shutdown.borrow_and_update() {
            match self.run_cycle().await {
                Ok(report) if report.fetched > 0 => info!(?report, "reconciliation cycle finished"),
                Ok(report) => debug!(?report, "reconciliation cycle finished"),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "reconciler stopped on fatal error");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "reconciliation cycle aborted, retrying next cycle"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
        Ok(())
    }

    /// Run one cycle and publish its outcome on the status channel.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ReconcileError> {
        let result = self.cycle().await;
        self.enter(Phase::Idle);
        self.status.send_modify(|status| match &result {
            Ok(report) => {
                status.cursor = report.cursor_after;
                status.last_success = Some(Utc::now());
                status.last_error = None;
                status.consecutive_failures = 0;
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            }
        });
        result
    }

    pub fn status(&self) -> ReconcilerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconcilerStatus> {
        self.status.subscribe()
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    pub fn cursor(&self) -> Result<Cursor, StoreError> {
        self.cursor.load()
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }
}

/// Private API
impl<R: ChainReader> Reconciler<R> {
    fn enter(&self, phase: Phase) {
        debug!(%phase, "reconciler phase");
        self.status.send_modify(|status| status.phase = phase);
    }

    async fn cycle(&mut self) -> Result<CycleReport, ReconcileError> {
        self.enter(Phase::Fetching);
        let cursor = self.cursor.load()?;
        let batch = self.reader.fetch_since(cursor).await?;

        let mut report = CycleReport {
            cursor_before: cursor,
            cursor_after: cursor,
            fetched: batch.transfers.len(),
            ..CycleReport::default()
        };

        self.enter(Phase::Parsing);
        let planned: Vec<_> = batch
            .transfers
            .into_iter()
            .map(|transfer| {
                let disposition = self.classify(&transfer);
                (transfer, disposition)
            })
            .collect();

        self.enter(Phase::Settling);
        for (transfer, disposition) in planned {
            match disposition {
                Disposition::Credit(user) => self.settle(&transfer, user, &mut report).await?,
                Disposition::Reject(reason) => self.reject(&transfer, reason, &mut report)?,
            }
        }

        self.enter(Phase::Advancing);
        if batch.next_cursor > cursor {
            self.cursor.save(batch.next_cursor)?;
            report.cursor_after = batch.next_cursor;
        }
        Ok(report)
    }

    /// Decide what should happen to a transfer from its own contents.
    fn classify(&self, transfer: &Transfer) -> Disposition {
        if transfer.destination != self.settings.deposit_address {
            return Disposition::Reject(QuarantineReason::ForeignDestination);
        }
        if transfer.amount.is_zero() {
            return Disposition::Reject(QuarantineReason::ZeroAmount);
        }
        match memo::parse(&transfer.comment) {
            Ok(user) => Disposition::Credit(user),
            Err(failure) => Disposition::Reject(failure.into()),
        }
    }

    async fn settle(
        &mut self,
        transfer: &Transfer,
        user: UserId,
        report: &mut CycleReport,
    ) -> Result<(), ReconcileError> {
        // Replayed batches must keep the first terminal disposition, even if
        // the user registered in between
        if self.quarantine.contains(&transfer.id) {
            debug!(transfer = %transfer.id, "transfer already quarantined");
            report.quarantined += 1;
            return Ok(());
        }

        if self.settings.attribution == AttributionPolicy::RequireKnownUser
            && self.ledger.settlement(&transfer.id).is_none()
            && !self.ledger.contains_user(user)
        {
            return self.reject(transfer, QuarantineReason::UnknownUser, report);
        }

        // The journal fsync runs under the ledger write lock; keep it off the
        // runtime workers
        let ledger = Arc::clone(&self.ledger);
        let id = transfer.id.clone();
        let amount = transfer.amount;
        let outcome =
            tokio::task::spawn_blocking(move || ledger.settle(&id, user, amount)).await?;

        match outcome {
            Ok(Settlement::Applied) => report.settled += 1,
            Ok(Settlement::AlreadySettled) => report.duplicates += 1,
            Err(LedgerError::InvalidAmount(_)) => {
                return self.reject(transfer, QuarantineReason::ZeroAmount, report);
            }
            Err(LedgerError::BalanceOverflow { .. }) => {
                return self.reject(transfer, QuarantineReason::BalanceOverflow, report);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn reject(
        &mut self,
        transfer: &Transfer,
        reason: QuarantineReason,
        report: &mut CycleReport,
    ) -> Result<(), ReconcileError> {
        if self.quarantine.record(transfer, reason)? {
            warn!(
                transfer = %transfer.id,
                source = %transfer.source,
                amount = %transfer.amount,
                comment = %transfer.comment,
                %reason,
                "transfer quarantined"
            );
        }
        report.quarantined += 1;
        Ok(())
    }
}
