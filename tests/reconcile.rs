use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;
use tondeposit::chain::FetchError;
use tondeposit::chain::memory::MemoryChain;
use tondeposit::ledger::LEDGER_FILE;
use tondeposit::model::Settlement;
use tondeposit::reconciler::{AttributionPolicy, QuarantineReason, ReconcilerSettings, supervisor};
use tondeposit::{Ledger, Nanoton, Reconciler, TransferId};

const ADDRESS: &str = "EQdeposit";

fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        deposit_address: ADDRESS.to_string(),
        poll_interval: Duration::from_millis(5),
        attribution: AttributionPolicy::CreditOnDemand,
    }
}

fn open_ledger(dir: &Path) -> Arc<Ledger> {
    Arc::new(Ledger::open(dir.join(LEDGER_FILE)).unwrap())
}

fn open(dir: &Path, chain: MemoryChain) -> Reconciler<MemoryChain> {
    Reconciler::open(chain, open_ledger(dir), dir, settings()).unwrap()
}

/// Deposits used by the crash tests, in chain order.
fn seed(chain: &MemoryChain) -> Vec<TransferId> {
    vec![
        chain.deposit(Nanoton::from_ton(1), "1"),
        chain.deposit(Nanoton::from_ton(2), "2"),
        chain.deposit(Nanoton::new(250_000_000), "hello"),
        chain.deposit(Nanoton::from_ton(3), "1"),
        chain.deposit(Nanoton::from_ton(4), " 3 "),
    ]
}

#[tokio::test]
async fn five_ton_to_existing_user() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    let id = chain.deposit(Nanoton::new(5_000_000_000), "42");
    let mut reconciler = open(dir.path(), chain);
    reconciler.ledger().ensure_user(42).unwrap();

    let report = reconciler.run_cycle().await.unwrap();

    let ledger = reconciler.ledger();
    assert_eq!(ledger.balance(42), Nanoton::new(5_000_000_000));
    assert_eq!(ledger.settlement_count(), 1);
    assert_eq!(ledger.settlement(&id).unwrap().user, 42);
    assert!(report.cursor_after > report.cursor_before);
    assert_eq!(reconciler.cursor().unwrap(), report.cursor_after);
}

#[tokio::test]
async fn non_numeric_comment_is_quarantined_and_cursor_advances() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    let id = chain.deposit(Nanoton::from_ton(1), "hello");
    let mut reconciler = open(dir.path(), chain);

    let report = reconciler.run_cycle().await.unwrap();

    let entry = reconciler.quarantine().get(&id).unwrap();
    assert_eq!(entry.reason, QuarantineReason::NotNumeric);
    assert_eq!(reconciler.ledger().settlement_count(), 0);
    assert!(report.cursor_after > 0);
    assert_eq!(reconciler.cursor().unwrap(), report.cursor_after);
}

#[tokio::test]
async fn redelivered_transfer_is_credited_once() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    chain.deposit(Nanoton::from_ton(2), "9");
    let mut reconciler = open(dir.path(), chain);

    reconciler.run_cycle().await.unwrap();
    // Simulate a cursor that was lost before being persisted
    std::fs::remove_file(dir.path().join("cursor.csv")).unwrap();
    let report = reconciler.run_cycle().await.unwrap();

    assert_eq!(report.settled, 0);
    assert_eq!(report.duplicates, 1);
    assert_eq!(reconciler.ledger().balance(9), Nanoton::from_ton(2));
}

#[tokio::test]
async fn transient_error_then_retry_credits_once() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    chain.deposit(Nanoton::from_ton(2), "9");
    chain.fail_next(FetchError::Transient("connection reset".to_string()));
    let mut reconciler = open(dir.path(), chain);

    assert!(reconciler.run_cycle().await.is_err());
    reconciler.run_cycle().await.unwrap();
    reconciler.run_cycle().await.unwrap();

    assert_eq!(reconciler.ledger().balance(9), Nanoton::from_ton(2));
    assert_eq!(reconciler.ledger().settlement_count(), 1);
}

#[tokio::test]
async fn crash_mid_batch_matches_uninterrupted_run() {
    // Uninterrupted reference run
    let reference_dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    seed(&chain);
    let mut reference = open(reference_dir.path(), chain);
    reference.run_cycle().await.unwrap();

    // Interrupted run: the first two transfers were settled, then the process
    // died before the cursor was persisted
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    let ids = seed(&chain);
    {
        let ledger = open_ledger(dir.path());
        assert_eq!(
            ledger.settle(&ids[0], 1, Nanoton::from_ton(1)).unwrap(),
            Settlement::Applied
        );
        assert_eq!(
            ledger.settle(&ids[1], 2, Nanoton::from_ton(2)).unwrap(),
            Settlement::Applied
        );
    }
    let mut restarted = open(dir.path(), chain);
    assert_eq!(restarted.cursor().unwrap(), 0);
    let report = restarted.run_cycle().await.unwrap();
    assert_eq!(report.duplicates, 2);
    assert_eq!(report.settled, 2);
    assert_eq!(report.quarantined, 1);

    for user in [1, 2, 3] {
        assert_eq!(
            restarted.ledger().balance(user),
            reference.ledger().balance(user)
        );
    }
    assert_eq!(restarted.ledger().balance(1), Nanoton::from_ton(4));
    assert_eq!(
        restarted.ledger().settlement_count(),
        reference.ledger().settlement_count()
    );
    assert_eq!(restarted.cursor().unwrap(), reference.cursor().unwrap());
    assert_eq!(restarted.quarantine().len(), 1);
}

#[tokio::test]
async fn state_survives_full_restart() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    seed(&chain);
    let cursor = {
        let mut reconciler = open(dir.path(), chain);
        reconciler.run_cycle().await.unwrap().cursor_after
    };

    let chain = MemoryChain::new(ADDRESS);
    seed(&chain);
    chain.deposit(Nanoton::from_ton(10), "3");
    let mut reconciler = open(dir.path(), chain);
    assert_eq!(reconciler.cursor().unwrap(), cursor);
    assert_eq!(reconciler.quarantine().len(), 1);

    let report = reconciler.run_cycle().await.unwrap();
    assert_eq!(report.fetched, 1);
    assert_eq!(report.settled, 1);
    assert_eq!(reconciler.ledger().balance(3), Nanoton::from_ton(14));
}

#[tokio::test]
async fn quarantine_is_complete_and_never_credited() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS);
    let bad = vec![
        (chain.deposit(Nanoton::from_ton(1), ""), QuarantineReason::Empty),
        (chain.deposit(Nanoton::from_ton(1), "42abc"), QuarantineReason::NotNumeric),
        (chain.deposit(Nanoton::from_ton(1), "-5"), QuarantineReason::NotNumeric),
        (chain.deposit(Nanoton::ZERO, "42"), QuarantineReason::ZeroAmount),
    ];
    chain.deposit(Nanoton::from_ton(1), "42");
    let mut reconciler = open(dir.path(), chain);

    reconciler.run_cycle().await.unwrap();
    // A second pass over the same transfers must not duplicate entries
    std::fs::remove_file(dir.path().join("cursor.csv")).unwrap();
    reconciler.run_cycle().await.unwrap();

    assert_eq!(reconciler.quarantine().len(), bad.len());
    for (id, reason) in &bad {
        assert_eq!(reconciler.quarantine().get(id).unwrap().reason, *reason);
        assert!(reconciler.ledger().settlement(id).is_none());
    }
    assert_eq!(reconciler.ledger().balance(42), Nanoton::from_ton(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn balance_reads_run_alongside_reconciler() {
    let dir = TempDir::new().unwrap();
    let chain = MemoryChain::new(ADDRESS).with_limit(10);
    for _ in 0..50 {
        chain.deposit(Nanoton::from_ton(1), "5");
    }
    let reconciler = open(dir.path(), chain);
    let ledger = Arc::clone(reconciler.ledger());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = supervisor::spawn(reconciler, supervisor::RestartPolicy::default(), shutdown_rx);

    let mut last = Nanoton::ZERO;
    for _ in 0..2_000 {
        let balance = ledger.balance(5);
        // Balances only ever grow, one whole credit at a time
        assert!(balance >= last);
        assert_eq!(balance.get() % Nanoton::PER_TON, 0);
        last = balance;
        if balance == Nanoton::from_ton(50) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(ledger.balance(5), Nanoton::from_ton(50));
    assert_eq!(ledger.settlement_count(), 50);
}
