// Shared fixtures for the inline test modules

use crate::config::DatabaseConfig;
use crate::db::{insert_account, Account, Store};
use chrono::NaiveDate;
use rusqlite::Connection;
use tempfile::TempDir;

/// File-backed store so pooled connections share one database.
/// Keep the TempDir alive for as long as the store is used.
pub fn temp_store(pool_size: u32) -> (TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        path: dir.path().join("balances.db"),
        pool_size,
        busy_timeout_ms: 10_000,
    };
    let store = Store::open(&config).unwrap();
    (dir, store)
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// Insert (id, opening balance) pairs
pub fn seed_accounts(conn: &Connection, accounts: &[(i64, i64)]) {
    for &(id, balance) in accounts {
        insert_account(
            conn,
            &Account {
                id,
                customer_name: format!("Customer {id}"),
                balance,
            },
        )
        .unwrap();
    }
}
