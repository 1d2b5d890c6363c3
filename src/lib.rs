// Daily Balance Batch - Core Library
// Partitioned end-of-day balance computation, used by the CLI, the API server, and tests

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod partition;
pub mod pool;
pub mod run_lock;
pub mod scheduler;
pub mod summary;
pub mod unit_of_work;

#[cfg(feature = "server")]
pub mod api;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{BatchConfig, DatabaseConfig, LoggingConfig, PartitioningConfig, ScheduleConfig};
pub use db::{
    Account, DailyBalanceRecord, Event, Store, Transaction, TransactionStatus,
    get_account, get_daily_balance, get_events_for_entity, import_accounts, import_transactions,
    insert_account, insert_event, insert_transaction, load_accounts_csv, load_transactions_csv,
    setup_database,
};
pub use error::{BatchError, Result};
pub use logging::init_logging;
pub use orchestrator::{BalanceJob, JobOrchestrator, OrchestratorSettings, RunContext, RunReport};
pub use partition::{partition_range, PartitionDescriptor};
pub use pool::{PartitionOutcome, WorkerPool};
pub use run_lock::{get_run, release_run_lock, RunRecord, RunStatus};
pub use scheduler::{Scheduler, SchedulerState};
pub use summary::{get_daily_summary, AccountDailySummary};
pub use unit_of_work::{execute_partition, PartitionCounts};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
