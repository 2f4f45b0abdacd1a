use std::env;
use std::error::Error;
use std::io;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use rewards_ledger::csv::{read_commands, write_accounts};
use rewards_ledger::{
    AccountStore, FileAccountStore, FileTransactionLog, InMemoryAccountStore,
    InMemoryTransactionLog, LedgerConfig, LedgerEngine, ReconcileReport, StaticPointCatalog,
    TransactionLog,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let Some(path) = env::args().nth(1) else {
        eprintln!("usage: rewards-ledger <operations.csv>");
        return ExitCode::FAILURE;
    };

    if !path.ends_with(".csv") {
        warn!(path, "input file seems to not be a csv file");
    }

    match run(Path::new(&path)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<LedgerConfig, Box<dyn Error>> {
    let config = match env::var("LEDGER_CONFIG") {
        Ok(path) => LedgerConfig::from_file(path)?.with_env_overrides()?,
        Err(_) => LedgerConfig::from_env()?,
    };
    Ok(config)
}

async fn run(path: &Path) -> Result<(), Box<dyn Error>> {
    let config = load_config()?;
    match (config.store_path.clone(), config.log_path.clone()) {
        (Some(store_path), Some(log_path)) => {
            let store = FileAccountStore::open(store_path).await?;
            let log = FileTransactionLog::open(log_path).await?;
            run_batch(path, config, store, log).await
        }
        (Some(store_path), None) => {
            let store = FileAccountStore::open(store_path).await?;
            run_batch(path, config, store, InMemoryTransactionLog::new()).await
        }
        (None, Some(log_path)) => {
            let log = FileTransactionLog::open(log_path).await?;
            run_batch(path, config, InMemoryAccountStore::new(), log).await
        }
        (None, None) => {
            run_batch(
                path,
                config,
                InMemoryAccountStore::new(),
                InMemoryTransactionLog::new(),
            )
            .await
        }
    }
}

async fn run_batch<S: AccountStore, L: TransactionLog>(
    path: &Path,
    config: LedgerConfig,
    store: S,
    log: L,
) -> Result<(), Box<dyn Error>> {
    let store = Arc::new(store);
    let catalog = Arc::new(StaticPointCatalog::new(config.catalog.clone()));
    let engine = LedgerEngine::new(Arc::clone(&store), Arc::new(log), catalog, &config);

    // operations left over from an earlier run
    report_reconciliation(&engine.reconcile().await?);

    let commands = read_commands(path)?;
    let (cmd_sender, cmd_receiver) = tokio::sync::mpsc::channel(16);

    tokio::spawn(async move {
        for result in commands {
            match result {
                Ok(command) => {
                    if cmd_sender.send(command).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("{e}");
                }
            }
        }
    });

    engine.run(ReceiverStream::new(cmd_receiver)).await;

    report_reconciliation(&engine.reconcile().await?);

    write_accounts(&store.accounts().await?, io::stdout().lock())?;
    Ok(())
}

fn report_reconciliation(report: &ReconcileReport) {
    if !report.completed.is_empty() || !report.compensated.is_empty() {
        info!(
            completed = report.completed.len(),
            compensated = report.compensated.len(),
            "reconciled journaled operations"
        );
    }
    if !report.pending.is_empty() {
        warn!(
            pending = report.pending.len(),
            "operations still awaiting reconciliation"
        );
    }
}
