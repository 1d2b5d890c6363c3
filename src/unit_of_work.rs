// ⚖️ Unit of work - upsert daily totals, then propagate them to balances
//
// One IMMEDIATE transaction per partition:
//   1. upsert   account_daily_balance from VALIDATED transactions (non-zero sums only)
//   2. propagate daily_total - applied_total into accounts.balance
//   3. mark     applied_total = daily_total
// A failure anywhere rolls back all three for that partition only.

use crate::error::{BatchError, Result};
use crate::partition::PartitionDescriptor;
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection, ErrorCode, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// VM instructions between deadline checks
const PROGRESS_CHECK_OPS: i32 = 1_000;

const UPSERT_DAILY_BALANCE: &str = "
    INSERT INTO account_daily_balance (account_id, balance_date, daily_total, processed)
    SELECT t.account_id, ?1, SUM(t.amount), 1
    FROM transactions t
    WHERE t.transaction_date >= ?1
      AND t.transaction_date < ?2
      AND t.status = 'VALIDATED'
      AND t.account_id BETWEEN ?3 AND ?4
    GROUP BY t.account_id
    HAVING SUM(t.amount) <> 0
    ON CONFLICT (account_id, balance_date)
    DO UPDATE SET daily_total = excluded.daily_total,
                  processed = 1";

const PROPAGATE_TO_BALANCE: &str = "
    UPDATE accounts AS a
    SET balance = a.balance + (adb.daily_total - adb.applied_total)
    FROM account_daily_balance AS adb
    WHERE a.id = adb.account_id
      AND adb.balance_date = ?1
      AND adb.daily_total <> 0
      AND adb.daily_total <> adb.applied_total
      AND a.id BETWEEN ?2 AND ?3";

const MARK_APPLIED: &str = "
    UPDATE account_daily_balance
    SET applied_total = daily_total
    WHERE balance_date = ?1
      AND daily_total <> applied_total
      AND account_id BETWEEN ?2 AND ?3";

/// Rows touched by one partition; observability only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionCounts {
    pub daily_records_upserted: usize,
    pub balances_updated: usize,
}

impl PartitionCounts {
    pub fn merge(self, other: PartitionCounts) -> PartitionCounts {
        PartitionCounts {
            daily_records_upserted: self.daily_records_upserted + other.daily_records_upserted,
            balances_updated: self.balances_updated + other.balances_updated,
        }
    }
}

/// Execute the unit of work for one partition.
///
/// With a `timeout`, an SQLite progress handler interrupts the running
/// statement once the deadline passes; the transaction rolls back and the
/// partition is reported as [`BatchError::Timeout`].
pub fn execute_partition(
    conn: &mut Connection,
    partition: &PartitionDescriptor,
    balance_date: NaiveDate,
    timeout: Option<Duration>,
) -> Result<PartitionCounts> {
    if let Some(timeout) = timeout {
        let deadline = Instant::now() + timeout;
        conn.progress_handler(PROGRESS_CHECK_OPS, Some(move || Instant::now() >= deadline));
    }

    let result = apply_partition(conn, partition, balance_date);

    if timeout.is_some() {
        conn.progress_handler(0, None::<fn() -> bool>);
    }

    match result {
        Ok(counts) => {
            tracing::info!(
                partition = partition.index,
                min_key = partition.min_key,
                max_key = partition.max_key,
                %balance_date,
                daily_records_upserted = counts.daily_records_upserted,
                balances_updated = counts.balances_updated,
                "Partition committed"
            );
            Ok(counts)
        }
        Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::OperationInterrupted => {
            Err(BatchError::Timeout {
                min_key: partition.min_key,
                max_key: partition.max_key,
                timeout_ms: timeout.map(|t| t.as_millis()).unwrap_or_default(),
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn apply_partition(
    conn: &mut Connection,
    partition: &PartitionDescriptor,
    balance_date: NaiveDate,
) -> rusqlite::Result<PartitionCounts> {
    // [date, date + 1): also matches timestamps stored as 'YYYY-MM-DD HH:MM:SS'
    let next_date = balance_date
        .checked_add_days(Days::new(1))
        .unwrap_or(NaiveDate::MAX);

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let daily_records_upserted = tx.execute(
        UPSERT_DAILY_BALANCE,
        params![balance_date, next_date, partition.min_key, partition.max_key],
    )?;

    tracing::debug!(
        partition = partition.index,
        daily_records_upserted,
        "account_daily_balance upserted"
    );

    // Guarded by applied_total: a no-op unless a record is still pending
    let balances_updated = tx.execute(
        PROPAGATE_TO_BALANCE,
        params![balance_date, partition.min_key, partition.max_key],
    )?;
    tx.execute(MARK_APPLIED, params![balance_date, partition.min_key, partition.max_key])?;

    tx.commit()?;

    Ok(PartitionCounts {
        daily_records_upserted,
        balances_updated,
    })
}
