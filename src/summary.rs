// Daily summary - per-account view of one business date
//
// Every account appears (paged, ordered by id) whether or not the batch has
// produced a daily record for it yet.

use crate::error::{BatchError, Result};
use chrono::{Days, NaiveDate};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

const SELECT_DAILY_SUMMARY: &str = "
    SELECT
        a.id,
        a.customer_name,
        a.balance,
        COALESCE(adb.balance_date, ?1),
        COALESCE(SUM(t.amount), 0),
        COALESCE(adb.daily_total, 0),
        COALESCE(adb.processed, 0)
    FROM accounts a
    LEFT JOIN account_daily_balance adb
        ON adb.account_id = a.id
       AND adb.balance_date = ?1
    LEFT JOIN transactions t
        ON t.account_id = a.id
       AND t.transaction_date >= ?1
       AND t.transaction_date < ?2
       AND t.status = 'VALIDATED'
    WHERE (?3 IS NULL OR a.id = ?3)
    GROUP BY a.id, a.customer_name, a.balance, adb.balance_date, adb.daily_total, adb.processed
    ORDER BY a.id
    LIMIT ?4 OFFSET ?5";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDailySummary {
    pub account_id: i64,
    pub customer_name: String,
    /// Cents
    pub current_balance: i64,
    pub balance_date: NaiveDate,
    /// Sum of the day's VALIDATED transactions, computed live
    pub total_transactions: i64,
    /// What the batch recorded for the day (0 if not processed yet)
    pub daily_total: i64,
    pub daily_processed: bool,
}

/// One page (1-based) of account summaries for `balance_date`
pub fn get_daily_summary(
    conn: &Connection,
    balance_date: NaiveDate,
    account_id: Option<i64>,
    page: u32,
    size: u32,
) -> Result<Vec<AccountDailySummary>> {
    if page == 0 || size == 0 {
        return Err(BatchError::Config(format!(
            "page and size must be at least 1 (page={page}, size={size})"
        )));
    }

    let next_day = balance_date
        .checked_add_days(Days::new(1))
        .ok_or_else(|| BatchError::Config(format!("date out of range: {balance_date}")))?;
    let offset = i64::from(page - 1) * i64::from(size);

    let mut stmt = conn.prepare(SELECT_DAILY_SUMMARY)?;
    let rows = stmt
        .query_map(
            params![balance_date, next_day, account_id, i64::from(size), offset],
            |row| {
                Ok(AccountDailySummary {
                    account_id: row.get(0)?,
                    customer_name: row.get(1)?,
                    current_balance: row.get(2)?,
                    balance_date: row.get(3)?,
                    total_transactions: row.get(4)?,
                    daily_total: row.get(5)?,
                    daily_processed: row.get(6)?,
                })
            },
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
