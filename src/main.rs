use clap::Parser;
use miette::{IntoDiagnostic, Result};
use momo_confirm::application::completion::CompletionDispatcher;
use momo_confirm::application::flow::PaymentFlow;
use momo_confirm::application::orchestrator::ConfirmationOrchestrator;
use momo_confirm::config::ConfirmConfig;
use momo_confirm::domain::ledger::{CoinListing, Withdrawal};
use momo_confirm::domain::operation::{NewOperation, OperationKind};
use momo_confirm::domain::outcome::Outcome;
use momo_confirm::domain::ports::{
    LedgerStoreRef, OperationStoreRef, PushGatewayRef, StatusGatewayRef,
};
use momo_confirm::error::{ConfirmError, Result as ConfirmResult};
use momo_confirm::infrastructure::change_feed::BroadcastChangeFeed;
use momo_confirm::infrastructure::http_gateway::HttpGateway;
use momo_confirm::infrastructure::in_memory::{
    FixedPriceOracle, InMemoryLedger, InMemoryOperationStore,
};
#[cfg(feature = "storage-rocksdb")]
use momo_confirm::infrastructure::rocksdb::RocksDBStore;
use momo_confirm::infrastructure::simulated_gateway::{SimulatedGateway, schedule_webhook};
use momo_confirm::interfaces::csv::outcome_writer::{OutcomeRecord, OutcomeWriter};
use momo_confirm::interfaces::csv::scenario_reader::{ScenarioReader, ScenarioRow};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scenario CSV file, one payment per row
    input: PathBuf,

    /// TOML file with confirmation settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Overrides the confirmation deadline
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Overrides the gateway poll interval
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Base URL of a live gateway. Without it the scripted gateway is used.
    #[arg(long)]
    gateway_url: Option<String>,

    /// Bearer token for the live gateway
    #[arg(long, requires = "gateway_url")]
    gateway_token: Option<String>,
}

fn load_config(cli: &Cli) -> Result<ConfirmConfig> {
    let mut config = match &cli.config {
        Some(path) => ConfirmConfig::from_toml_file(path).into_diagnostic()?,
        None => ConfirmConfig::default(),
    };
    if let Some(deadline_ms) = cli.deadline_ms {
        config.deadline_ms = deadline_ms;
    }
    if let Some(poll_interval_ms) = cli.poll_interval_ms {
        config.poll_interval_ms = poll_interval_ms;
    }
    config.validate().into_diagnostic()?;
    Ok(config)
}

fn open_stores(
    db_path: Option<&Path>,
    feed: &BroadcastChangeFeed,
) -> Result<(OperationStoreRef, LedgerStoreRef)> {
    if let Some(path) = db_path {
        #[cfg(feature = "storage-rocksdb")]
        {
            let store = Arc::new(RocksDBStore::open(path, feed.clone()).into_diagnostic()?);
            let operations: OperationStoreRef = store.clone();
            let ledger: LedgerStoreRef = store;
            return Ok((operations, ledger));
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        warn!(
            path = %path.display(),
            "Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to in-memory storage."
        );
    }
    let operations: OperationStoreRef = Arc::new(InMemoryOperationStore::new(feed.clone()));
    let ledger: LedgerStoreRef = Arc::new(InMemoryLedger::new());
    Ok((operations, ledger))
}

/// Registers the prices, listings and withdrawals the rows refer to.
async fn seed_ledger(
    rows: &[(ScenarioRow, NewOperation)],
    ledger: &LedgerStoreRef,
    prices: &FixedPriceOracle,
) -> Result<()> {
    for (row, _) in rows {
        let Some(subject) = &row.subject else {
            continue;
        };
        match row.kind {
            OperationKind::BuyViaGateway => {
                if let Some(price) = row.price {
                    prices.set_price(subject.clone(), price).await;
                }
            }
            OperationKind::CoinCreationFee => {
                if ledger.listing(subject).await.into_diagnostic()?.is_none() {
                    ledger
                        .register_listing(CoinListing::new(subject.clone(), row.payer.clone()))
                        .await
                        .into_diagnostic()?;
                }
            }
            OperationKind::Payout => {
                if ledger.withdrawal(subject).await.into_diagnostic()?.is_none() {
                    ledger
                        .register_withdrawal(Withdrawal::new(
                            subject.clone(),
                            row.payer.clone(),
                            row.amount,
                        ))
                        .await
                        .into_diagnostic()?;
                }
            }
            OperationKind::Deposit => {}
        }
    }
    Ok(())
}

async fn run_row(
    flow: &PaymentFlow,
    store: OperationStoreRef,
    row: &ScenarioRow,
    request: NewOperation,
) -> ConfirmResult<Outcome> {
    let id = match flow.start(request).await {
        Ok(operation) => operation.id,
        Err(ConfirmError::PushUnconfirmed { operation, .. }) => operation,
        Err(e) => return Err(e),
    };
    if let Some((status, after)) = row.webhook() {
        schedule_webhook(store, id.clone(), status, None, after);
    }

    let confirmation = flow.confirm(&id);
    let Some(cancel_after_ms) = row.cancel_after_ms else {
        return confirmation.await;
    };
    let cancel = async {
        tokio::time::sleep(Duration::from_millis(cancel_after_ms)).await;
        match flow.orchestrator().cancel(&id).await {
            Ok(disposition) => info!(operation = %id, ?disposition, "cancel requested"),
            Err(e) => warn!(operation = %id, error = %e, "cancel failed"),
        }
    };
    let (outcome, ()) = tokio::join!(confirmation, cancel);
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let feed = BroadcastChangeFeed::new(config.feed_capacity);
    let (store, ledger) = open_stores(cli.db_path.as_deref(), &feed)?;
    let prices = Arc::new(FixedPriceOracle::new());

    // Read scenario rows, reporting the ones that cannot be run. The scripted
    // gateway keys its behaviour by payer, so each payer gets one row there.
    let scripted = cli.gateway_url.is_none();
    let mut payers = HashSet::new();
    let file = File::open(&cli.input).into_diagnostic()?;
    let mut rows = Vec::new();
    for row_result in ScenarioReader::new(file).rows() {
        let parsed = row_result.and_then(|row| {
            if scripted {
                row.script()?;
            }
            let request = row.request()?;
            Ok((row, request))
        });
        match parsed {
            Ok((row, _)) if scripted && !payers.insert(row.payer.clone()) => warn!(
                "Error reading scenario row: payer {} already has a row",
                row.payer
            ),
            Ok(row) => rows.push(row),
            Err(e) => warn!("Error reading scenario row: {}", e),
        }
    }
    seed_ledger(&rows, &ledger, &prices).await?;

    let simulated = Arc::new(SimulatedGateway::new());
    let push_gateway: PushGatewayRef;
    let status_gateway: StatusGatewayRef;
    match &cli.gateway_url {
        Some(url) => {
            let http = Arc::new(
                HttpGateway::new(
                    url.as_str(),
                    cli.gateway_token.as_deref(),
                    config.gateway_request_timeout(),
                )
                .into_diagnostic()?,
            );
            push_gateway = http.clone();
            status_gateway = http;
        }
        None => {
            for (row, _) in &rows {
                simulated.script(row.payer.clone(), row.script().into_diagnostic()?);
            }
            push_gateway = simulated.clone();
            status_gateway = simulated.clone();
        }
    }

    let orchestrator = ConfirmationOrchestrator::new(
        store.clone(),
        Arc::new(feed),
        status_gateway,
        &config,
    )
    .with_push_gateway(push_gateway.clone());
    let flow = Arc::new(PaymentFlow::new(
        store.clone(),
        push_gateway,
        Arc::new(orchestrator),
        CompletionDispatcher::new(ledger.clone(), prices),
        config.deadline(),
    ));

    // Every row confirms concurrently; results are reported in input order
    let handles: Vec<_> = rows
        .into_iter()
        .map(|(row, request)| {
            let flow = flow.clone();
            let store = store.clone();
            let task_row = row.clone();
            let handle =
                tokio::spawn(async move { run_row(&flow, store, &task_row, request).await });
            (row, handle)
        })
        .collect();

    let mut records = Vec::with_capacity(handles.len());
    for (row, handle) in handles {
        // A row that crashed is reported; the others still are.
        let result = handle.await.unwrap_or_else(|e| {
            error!(payer = %row.payer, error = %e, "scenario row aborted");
            Err(ConfirmError::InternalError(e.to_string().into()))
        });
        let balance = ledger
            .wallet(&row.payer)
            .await
            .into_diagnostic()?
            .map_or(Decimal::ZERO, |wallet| wallet.balance.0);
        records.push(OutcomeRecord::new(row.payer, row.kind, &result, balance));
    }

    let stdout = io::stdout();
    let mut writer = OutcomeWriter::new(stdout.lock());
    writer.write_outcomes(records).into_diagnostic()?;

    Ok(())
}
