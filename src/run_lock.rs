// Run lock keyed by business date
//
// RUNNING   -> another invocation is mid-flight, reject
// COMPLETED -> every partition committed, reject
// FAILED    -> may be reclaimed; committed partitions are guarded by applied_total

use crate::error::{BatchError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub balance_date: NaiveDate,
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub partitions_total: usize,
    pub partitions_failed: usize,
}

/// Claim the lock for `balance_date`, failing fast if it is held or done
pub fn acquire_run_lock(
    conn: &mut Connection,
    balance_date: NaiveDate,
    run_id: &str,
    started_at: DateTime<Utc>,
) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT status FROM balance_runs WHERE balance_date = ?1",
            [balance_date],
            |row| row.get(0),
        )
        .optional()?;

    match existing.as_deref().and_then(RunStatus::parse) {
        Some(RunStatus::Running) => return Err(BatchError::RunInProgress(balance_date)),
        Some(RunStatus::Completed) => return Err(BatchError::AlreadyCommitted(balance_date)),
        Some(RunStatus::Failed) | None => {}
    }

    tx.execute(
        "INSERT INTO balance_runs (balance_date, run_id, status, started_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (balance_date) DO UPDATE SET
             run_id = excluded.run_id,
             status = excluded.status,
             started_at = excluded.started_at,
             finished_at = NULL,
             partitions_total = 0,
             partitions_failed = 0",
        params![balance_date, run_id, RunStatus::Running.as_str(), started_at],
    )?;

    tx.commit()?;
    Ok(())
}

/// Record the final status of the run that holds the lock
pub fn finish_run(
    conn: &Connection,
    balance_date: NaiveDate,
    run_id: &str,
    status: RunStatus,
    partitions_total: usize,
    partitions_failed: usize,
) -> Result<()> {
    conn.execute(
        "UPDATE balance_runs
         SET status = ?1, finished_at = ?2, partitions_total = ?3, partitions_failed = ?4
         WHERE balance_date = ?5 AND run_id = ?6",
        params![
            status.as_str(),
            Utc::now(),
            partitions_total as i64,
            partitions_failed as i64,
            balance_date,
            run_id,
        ],
    )?;
    Ok(())
}

/// Drop a lock left behind by a crashed process. COMPLETED rows are kept.
pub fn release_run_lock(conn: &Connection, balance_date: NaiveDate) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM balance_runs WHERE balance_date = ?1 AND status <> 'COMPLETED'",
        [balance_date],
    )?;
    Ok(removed > 0)
}

pub fn get_run(conn: &Connection, balance_date: NaiveDate) -> Result<Option<RunRecord>> {
    let record = conn
        .query_row(
            "SELECT balance_date, run_id, status, started_at, finished_at,
                    partitions_total, partitions_failed
             FROM balance_runs WHERE balance_date = ?1",
            [balance_date],
            |row| {
                let status: String = row.get(2)?;
                let total: i64 = row.get(5)?;
                let failed: i64 = row.get(6)?;
                Ok(RunRecord {
                    balance_date: row.get(0)?,
                    run_id: row.get(1)?,
                    status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
                    started_at: row.get(3)?,
                    finished_at: row.get(4)?,
                    partitions_total: total as usize,
                    partitions_failed: failed as usize,
                })
            },
        )
        .optional()?;

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{date, temp_store};

    #[test]
    fn test_lock_lifecycle() {
        let (_dir, store) = temp_store(1);
        let mut conn = store.conn().unwrap();
        let d = date(2024, 5, 1);

        acquire_run_lock(&mut conn, d, "run-a", Utc::now()).unwrap();
        assert!(matches!(
            acquire_run_lock(&mut conn, d, "run-b", Utc::now()),
            Err(BatchError::RunInProgress(_))
        ));

        finish_run(&conn, d, "run-a", RunStatus::Completed, 8, 0).unwrap();
        assert!(matches!(
            acquire_run_lock(&mut conn, d, "run-c", Utc::now()),
            Err(BatchError::AlreadyCommitted(_))
        ));

        let record = get_run(&conn, d).unwrap().unwrap();
        assert_eq!(record.run_id, "run-a");
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.partitions_total, 8);
        assert!(record.finished_at.is_some());

        // another date is independent
        acquire_run_lock(&mut conn, date(2024, 5, 2), "run-d", Utc::now()).unwrap();
    }

    #[test]
    fn test_failed_run_can_be_reclaimed() {
        let (_dir, store) = temp_store(1);
        let mut conn = store.conn().unwrap();
        let d = date(2024, 5, 1);

        acquire_run_lock(&mut conn, d, "run-a", Utc::now()).unwrap();
        finish_run(&conn, d, "run-a", RunStatus::Failed, 8, 3).unwrap();

        acquire_run_lock(&mut conn, d, "run-b", Utc::now()).unwrap();
        let record = get_run(&conn, d).unwrap().unwrap();
        assert_eq!(record.run_id, "run-b");
        assert_eq!(record.status, RunStatus::Running);
        assert_eq!(record.partitions_failed, 0);
        assert!(record.finished_at.is_none());
    }

    #[test]
    fn test_release_stale_lock() {
        let (_dir, store) = temp_store(1);
        let mut conn = store.conn().unwrap();
        let d = date(2024, 5, 1);

        acquire_run_lock(&mut conn, d, "crashed", Utc::now()).unwrap();
        assert!(release_run_lock(&conn, d).unwrap());
        assert!(get_run(&conn, d).unwrap().is_none());

        acquire_run_lock(&mut conn, d, "run-a", Utc::now()).unwrap();
        finish_run(&conn, d, "run-a", RunStatus::Completed, 1, 0).unwrap();
        assert!(!release_run_lock(&conn, d).unwrap());
    }
}
