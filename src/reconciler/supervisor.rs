//! Background supervision of the reconciler loop.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use super::{ReconcileError, Reconciler, ReconcilerStatus};
use crate::chain::ChainReader;

/// Exponential backoff between restarts after fatal errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Consecutive fatal failures tolerated before giving up.
    pub max_restarts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RestartPolicy {
    pub fn new(max_restarts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_restarts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before restart number `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5), Duration::from_secs(300))
    }
}

/// Run `reconciler` on its own task, restarting it after fatal errors.
///
/// The task ends with `Ok` once `shutdown` is signalled, or with the last
/// error once more than `policy.max_restarts` consecutive fatal failures
/// happened without a successful cycle in between.
pub fn spawn<R>(
    reconciler: Reconciler<R>,
    policy: RestartPolicy,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<(), ReconcileError>>
where
    R: ChainReader + 'static,
{
    tokio::spawn(supervise(reconciler, policy, shutdown))
}

async fn supervise<R: ChainReader>(
    mut reconciler: Reconciler<R>,
    policy: RestartPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ReconcileError> {
    let mut failures = 0;
    loop {
        let last_success = reconciler.status().last_success;
        let err = match reconciler.run(shutdown.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if reconciler.status().last_success != last_success {
            failures = 0;
        }
        if failures >= policy.max_restarts {
            error!(
                error = %err,
                failures = failures + 1,
                "reconciler keeps failing, giving up; operator action required"
            );
            return Err(err);
        }

        let delay = policy.delay(failures);
        failures += 1;
        error!(
            error = %err,
            attempt = failures,
            restart_in = ?delay,
            "reconciler failed, restarting"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutdown requested while waiting to restart reconciler");
                    return Ok(());
                }
            }
        }
    }
}

/// Log the reconciler status every `every` until `shutdown` is signalled.
///
/// A status with no successful cycle for longer than `stall_after` is
/// reported at warn level.
pub fn spawn_monitor(
    status: watch::Receiver<ReconcilerStatus>,
    every: Duration,
    stall_after: Duration,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(monitor(status, every, stall_after, shutdown))
}

async fn monitor(
    status: watch::Receiver<ReconcilerStatus>,
    every: Duration,
    stall_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    while !*shutdown.borrow_and_update() {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        }

        let status = status.borrow().clone();
        let now = Utc::now();
        let lag_secs = status.lag(now).map(|lag| lag.num_seconds());
        if status.is_stalled(now, stall_after) {
            warn!(
                cursor = status.cursor,
                ?lag_secs,
                consecutive_failures = status.consecutive_failures,
                last_error = ?status.last_error,
                "reconciler is stalled"
            );
        } else {
            info!(
                cursor = status.cursor,
                ?lag_secs,
                consecutive_failures = status.consecutive_failures,
                "reconciler status"
            );
        }
    }
}
