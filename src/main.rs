use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tondeposit::chain::FetchError;
use tondeposit::chain::toncenter::TonCenterReader;
use tondeposit::config::{Config, ConfigError};
use tondeposit::ledger::LEDGER_FILE;
use tondeposit::reconciler::{ReconcileError, supervisor};
use tondeposit::service::Inbound;
use tondeposit::store::StoreError;
use tondeposit::{CommandService, Ledger, Reconciler};

/// Period of the reconciler status log line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);
/// Poll intervals without a successful cycle before the reconciler is reported stalled.
const STALL_AFTER_POLLS: u32 = 3;

#[derive(Debug, Error)]
enum AppError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("reconciler gave up: {0}")]
    Reconciler(#[from] ReconcileError),

    #[error("reconciler task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let ledger = Arc::new(Ledger::open(config.data_dir.join(LEDGER_FILE))?);
    let reader = TonCenterReader::new(config.deposit_address.clone(), config.toncenter.clone())?;
    let reconciler = Reconciler::open(
        reader,
        Arc::clone(&ledger),
        &config.data_dir,
        config.reconciler_settings(),
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = supervisor::spawn_monitor(
        reconciler.subscribe(),
        STATUS_INTERVAL.max(config.poll_interval),
        config.poll_interval * STALL_AFTER_POLLS,
        shutdown_rx.clone(),
    );
    let mut reconciler_task = supervisor::spawn(reconciler, config.restart.clone(), shutdown_rx);

    // Line-oriented command bus: "<user id> <text>" in, one reply per line out
    let (inbox_tx, inbox_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<Inbound>() {
                    Ok(message) => {
                        if inbox_tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("{e}"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read command bus");
                    break;
                }
            }
        }
    });

    let (outbox_tx, mut outbox_rx) = mpsc::channel(16);
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(outbound) = outbox_rx.recv().await {
            let line = format!("{outbound}\n");
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                warn!(error = %e, "failed to write reply");
                break;
            }
            if let Err(e) = stdout.flush().await {
                warn!(error = %e, "failed to flush reply");
                break;
            }
        }
    });

    let service = CommandService::new(ledger, config.deposit_address.clone());
    tokio::select! {
        _ = service.serve(ReceiverStream::new(inbox_rx), outbox_tx) => {
            info!("command bus closed, shutting down");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        result = &mut reconciler_task => {
            result??;
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);
    let result = reconciler_task.await;
    let _ = monitor.await;
    let _ = writer.await;
    result??;
    info!("stopped");
    Ok(())
}
