use crate::config::DatabaseConfig;
use crate::error::{BatchError, Result};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// STORE (shared connection pool)
// ============================================================================

/// Pooled SQLite store shared by every worker of a run
#[derive(Clone)]
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (or create) the database file, enable WAL and create the schema
    pub fn open(config: &DatabaseConfig) -> Result<Self> {
        let busy_timeout = config.busy_timeout();

        let manager = SqliteConnectionManager::file(&config.path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(config.pool_size).build(manager)?;

        {
            let conn = pool.get()?;
            setup_database(&conn)?;
        }

        tracing::debug!(
            path = %config.path.display(),
            pool_size = config.pool_size,
            "Store opened"
        );

        Ok(Self { pool })
    }

    /// Check out a pooled connection (blocks until one is free)
    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run a blocking closure on a pooled connection off the async runtime
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = store.conn()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BatchError::StoreTask(e.to_string()))?
    }

    pub fn max_connections(&self) -> u32 {
        self.pool.max_size()
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode so readers never block the batch writers
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Accounts & Transactions (read-only input, balance is the accumulator)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            id INTEGER PRIMARY KEY,
            customer_name TEXT NOT NULL DEFAULT '',
            balance INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            amount INTEGER NOT NULL,
            transaction_date TEXT NOT NULL,
            status TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Daily balance records (one per account per processed date)
    // applied_total is the propagation marker: what has reached accounts.balance
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS account_daily_balance (
            account_id INTEGER NOT NULL REFERENCES accounts(id),
            balance_date TEXT NOT NULL,
            daily_total INTEGER NOT NULL,
            processed INTEGER NOT NULL DEFAULT 0,
            applied_total INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, balance_date)
        )",
        [],
    )?;

    // ==========================================================================
    // Run lock (one row per business date)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS balance_runs (
            balance_date TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            partitions_total INTEGER NOT NULL DEFAULT 0,
            partitions_failed INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_date_account
         ON transactions(transaction_date, account_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_balance_date
         ON account_daily_balance(balance_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// MODELS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub customer_name: String,
    /// Running balance in cents
    pub balance: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Validated,
    Rejected,
    Cancelled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Validated => "VALIDATED",
            TransactionStatus::Rejected => "REJECTED",
            TransactionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl FromStr for TransactionStatus {
    type Err = BatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(TransactionStatus::Pending),
            "VALIDATED" => Ok(TransactionStatus::Validated),
            "REJECTED" => Ok(TransactionStatus::Rejected),
            "CANCELLED" => Ok(TransactionStatus::Cancelled),
            other => Err(BatchError::Import(format!("unknown transaction status '{other}'"))),
        }
    }
}

/// Immutable once recorded
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub account_id: i64,
    /// Signed amount in cents
    pub amount: i64,
    pub transaction_date: NaiveDate,
    pub status: TransactionStatus,
}

impl Transaction {
    pub fn new(account_id: i64, amount: i64, transaction_date: NaiveDate, status: TransactionStatus) -> Self {
        Self {
            account_id,
            amount,
            transaction_date,
            status,
        }
    }

    pub fn validated(account_id: i64, amount: i64, transaction_date: NaiveDate) -> Self {
        Self::new(account_id, amount, transaction_date, TransactionStatus::Validated)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyBalanceRecord {
    pub account_id: i64,
    pub balance_date: NaiveDate,
    pub daily_total: i64,
    pub processed: bool,
    /// Portion of daily_total already propagated to the account balance
    pub applied_total: i64,
}

pub fn insert_account(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        "INSERT INTO accounts (id, customer_name, balance) VALUES (?1, ?2, ?3)",
        params![account.id, account.customer_name, account.balance],
    )?;
    Ok(())
}

pub fn insert_transaction(conn: &Connection, tx: &Transaction) -> Result<i64> {
    conn.execute(
        "INSERT INTO transactions (account_id, amount, transaction_date, status)
         VALUES (?1, ?2, ?3, ?4)",
        params![tx.account_id, tx.amount, tx.transaction_date, tx.status.as_str()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn get_account(conn: &Connection, id: i64) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT id, customer_name, balance FROM accounts WHERE id = ?1",
            [id],
            |row| {
                Ok(Account {
                    id: row.get(0)?,
                    customer_name: row.get(1)?,
                    balance: row.get(2)?,
                })
            },
        )
        .optional()?;

    Ok(account)
}

pub fn get_daily_balance(
    conn: &Connection,
    account_id: i64,
    balance_date: NaiveDate,
) -> Result<Option<DailyBalanceRecord>> {
    let record = conn
        .query_row(
            "SELECT account_id, balance_date, daily_total, processed, applied_total
             FROM account_daily_balance
             WHERE account_id = ?1 AND balance_date = ?2",
            params![account_id, balance_date],
            |row| {
                Ok(DailyBalanceRecord {
                    account_id: row.get(0)?,
                    balance_date: row.get(1)?,
                    daily_total: row.get(2)?,
                    processed: row.get(3)?,
                    applied_total: row.get(4)?,
                })
            },
        )
        .optional()?;

    Ok(record)
}

// ============================================================================
// EVENTS (audit trail)
// ============================================================================

/// Every run lifecycle change is recorded as an event
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)
        .map_err(|e| BatchError::Import(format!("event payload: {e}")))?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
                    })?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// CSV IMPORT (seeding accounts and transactions)
// ============================================================================

#[derive(Debug, Deserialize)]
struct AccountRow {
    id: i64,
    #[serde(default)]
    customer_name: String,
    #[serde(default)]
    balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TransactionRow {
    account_id: i64,
    amount: String,
    transaction_date: String,
    status: String,
}

/// Parse a decimal amount ("-45.99", "1200", "+3.5") into cents
pub fn parse_amount_cents(raw: &str) -> Result<i64> {
    let cleaned = raw.trim().replace(',', "");
    let invalid = || BatchError::Import(format!("invalid amount '{}'", raw.trim()));

    // ".07" / "-.07"
    let normalized = if let Some(rest) = cleaned.strip_prefix("-.") {
        format!("-0.{rest}")
    } else if let Some(rest) = cleaned.strip_prefix('.') {
        format!("0.{rest}")
    } else {
        cleaned
    };

    let amount = Decimal::from_str(&normalized).map_err(|_| invalid())?;
    if amount.scale() > 2 {
        return Err(invalid());
    }

    amount
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|cents| cents.to_i64())
        .ok_or_else(invalid)
}

pub fn load_accounts_csv(csv_path: &Path) -> anyhow::Result<Vec<Account>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open accounts CSV")?;

    let mut accounts = Vec::new();
    for result in rdr.deserialize() {
        let row: AccountRow = result.context("Failed to deserialize account")?;
        let balance = match row.balance.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_amount_cents(raw)?,
            _ => 0,
        };

        accounts.push(Account {
            id: row.id,
            customer_name: row.customer_name,
            balance,
        });
    }

    Ok(accounts)
}

pub fn load_transactions_csv(csv_path: &Path) -> anyhow::Result<Vec<Transaction>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open transactions CSV")?;

    let mut transactions = Vec::new();
    for (line, result) in rdr.deserialize().enumerate() {
        let row: TransactionRow = result.context("Failed to deserialize transaction")?;

        let transaction_date = NaiveDate::parse_from_str(row.transaction_date.trim(), "%Y-%m-%d")
            .with_context(|| format!("Invalid transaction_date on record {}", line + 1))?;

        transactions.push(Transaction {
            account_id: row.account_id,
            amount: parse_amount_cents(&row.amount)?,
            transaction_date,
            status: row.status.parse()?,
        });
    }

    Ok(transactions)
}

/// Insert accounts in one transaction; returns the number inserted
pub fn import_accounts(conn: &mut Connection, accounts: &[Account]) -> Result<usize> {
    let tx = conn.transaction()?;
    for account in accounts {
        insert_account(&tx, account)?;
    }
    tx.commit()?;

    tracing::info!(count = accounts.len(), "Imported accounts");
    Ok(accounts.len())
}

/// Insert transactions in one transaction; returns the number inserted
pub fn import_transactions(conn: &mut Connection, transactions: &[Transaction]) -> Result<usize> {
    let tx = conn.transaction()?;
    for transaction in transactions {
        insert_transaction(&tx, transaction)?;
    }
    tx.commit()?;

    tracing::info!(count = transactions.len(), "Imported transactions");
    Ok(transactions.len())
}
