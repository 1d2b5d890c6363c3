// Daily Balance Batch - CLI
//
//   init                                   create the schema
//   import <accounts.csv> <transactions.csv>
//   run [YYYY-MM-DD]                       one run, default yesterday
//   unlock <YYYY-MM-DD>                    drop a stale run lock
//   schedule                               cron trigger until Ctrl-C (default)
//
// Every command accepts --config <path>.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use daily_balance_batch::{
    import_accounts, import_transactions, init_logging, load_accounts_csv, load_transactions_csv,
    release_run_lock, BatchConfig, JobOrchestrator, Scheduler, Store,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let (config_path, args) = split_config_flag(env::args().skip(1).collect())?;

    let config = BatchConfig::load_from(config_path.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging);

    let command = args.first().map(String::as_str).unwrap_or("schedule");
    match command {
        "init" => run_init(&config),
        "import" => run_import(&config, &args[1..]),
        "run" => run_once(&config, args.get(1).map(String::as_str)).await,
        "unlock" => run_unlock(&config, args.get(1).map(String::as_str)),
        "schedule" => run_schedule(&config).await,
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            print_usage();
            bail!("Unknown command '{other}'")
        }
    }
}

fn split_config_flag(args: Vec<String>) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config_path = None;
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config requires a path")?;
            config_path = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config_path = Some(PathBuf::from(path));
        } else {
            rest.push(arg);
        }
    }

    Ok((config_path, rest))
}

fn print_usage() {
    println!("daily-balance-batch {}", daily_balance_batch::VERSION);
    println!();
    println!("USAGE: daily-balance-batch [--config <path>] <command>");
    println!();
    println!("  init                                      Create the database schema");
    println!("  import <accounts.csv> <transactions.csv>  Seed accounts and transactions");
    println!("  run [YYYY-MM-DD]                          Run once (default: yesterday)");
    println!("  unlock <YYYY-MM-DD>                       Release a stale run lock");
    println!("  schedule                                  Run on the configured cron (default)");
}

fn parse_date(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").with_context(|| format!("Invalid date '{raw}', expected YYYY-MM-DD"))
}

fn open_store(config: &BatchConfig) -> Result<Store> {
    Store::open(&config.database)
        .with_context(|| format!("Failed to open database at {}", config.database.path.display()))
}

fn run_init(config: &BatchConfig) -> Result<()> {
    open_store(config)?;
    println!("✓ Database ready: {}", config.database.path.display());
    Ok(())
}

fn run_import(config: &BatchConfig, args: &[String]) -> Result<()> {
    let [accounts_csv, transactions_csv] = args else {
        bail!("Usage: import <accounts.csv> <transactions.csv>");
    };

    let accounts = load_accounts_csv(Path::new(accounts_csv))?;
    let transactions = load_transactions_csv(Path::new(transactions_csv))?;

    let store = open_store(config)?;
    let mut conn = store.conn()?;

    let account_count = import_accounts(&mut conn, &accounts).context("Failed to import accounts")?;
    let transaction_count =
        import_transactions(&mut conn, &transactions).context("Failed to import transactions")?;

    println!("✓ Imported {account_count} accounts and {transaction_count} transactions");
    Ok(())
}

async fn run_once(config: &BatchConfig, date: Option<&str>) -> Result<()> {
    let balance_date = match date {
        Some(raw) => parse_date(raw)?,
        None => {
            let tz = config.schedule.parse_timezone()?;
            let today = Utc::now().with_timezone(&tz).date_naive();
            today.pred_opt().unwrap_or(today)
        }
    };

    let orchestrator = JobOrchestrator::from_config(open_store(config)?, config)?;
    let report = orchestrator.run(balance_date).await?;

    let totals = report.totals();
    println!(
        "Run {} for {}: {}/{} partitions committed, {} daily records, {} balances updated",
        report.context.run_id,
        balance_date,
        report.outcomes.len() - report.failed_count(),
        report.outcomes.len(),
        totals.daily_records_upserted,
        totals.balances_updated,
    );

    for outcome in report.outcomes.iter().filter(|o| !o.is_success()) {
        if let Err(e) = &outcome.result {
            eprintln!("  ✗ {}: {}", outcome.partition, e);
        }
    }

    report.into_result().context("Balance run did not complete")?;
    Ok(())
}

fn run_unlock(config: &BatchConfig, date: Option<&str>) -> Result<()> {
    let Some(raw) = date else {
        bail!("Usage: unlock <YYYY-MM-DD>");
    };
    let balance_date = parse_date(raw)?;

    let store = open_store(config)?;
    let conn = store.conn()?;
    if release_run_lock(&conn, balance_date)? {
        println!("✓ Released run lock for {balance_date}");
    } else {
        println!("No releasable run lock for {balance_date}");
    }
    Ok(())
}

async fn run_schedule(config: &BatchConfig) -> Result<()> {
    let orchestrator = JobOrchestrator::from_config(open_store(config)?, config)?;
    let settings = orchestrator.settings().clone();
    let scheduler = Scheduler::new(Arc::new(orchestrator), &config.schedule)?;

    tracing::info!(
        cron = %config.schedule.cron,
        timezone = %config.schedule.timezone,
        partitions = settings.partition_count,
        workers = settings.workers,
        "Scheduler started (Ctrl-C to stop)"
    );

    scheduler
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await;

    Ok(())
}
