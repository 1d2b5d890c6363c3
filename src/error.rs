// Error taxonomy for the daily balance batch
//
// Configuration errors are fatal at start-up. Partition errors stay scoped
// to one partition's transaction. Run-level errors are what the scheduler
// catches and logs.

use chrono::NaiveDate;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Partition [{min_key}, {max_key}] exceeded its {timeout_ms} ms deadline")]
    Timeout {
        min_key: i64,
        max_key: i64,
        timeout_ms: u128,
    },

    #[error("Worker for partition [{min_key}, {max_key}] aborted: {reason}")]
    WorkerAborted {
        min_key: i64,
        max_key: i64,
        reason: String,
    },

    #[error("A run for {0} is already in progress")]
    RunInProgress(NaiveDate),

    #[error("Balances for {0} were already committed")]
    AlreadyCommitted(NaiveDate),

    #[error("Run {run_id} failed: {failed} of {total} partitions failed")]
    RunFailed {
        run_id: String,
        failed: usize,
        total: usize,
    },

    #[error("Import error: {0}")]
    Import(String),

    #[error("Store task failed: {0}")]
    StoreTask(String),
}

impl From<config::ConfigError> for BatchError {
    fn from(err: config::ConfigError) -> Self {
        BatchError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BatchError>;
