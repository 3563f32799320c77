mod balances;
mod transactions;

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::config::LedgerConfig;

pub use balances::*;
pub use transactions::*;

/// SQL migration for initial schema
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// Shared handle to the ledger database.
///
/// Created once by the process entry point and cloned into every component that
/// needs storage. Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Wrap an existing SQLite connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database.
    /// With `create` set, the database file is created if it doesn't exist.
    pub async fn connect(database_url: &str, config: &LedgerConfig, create: bool) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .context("Invalid database URL")?
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.storage.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        Ok(Self::new(pool))
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;
        Ok(())
    }

    /// Initialize a new database (connect + migrate).
    pub async fn init(database_url: &str, config: &LedgerConfig) -> Result<Self> {
        let db = Self::connect(database_url, config, true).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Start a transaction. Dropping it without commit rolls everything back.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .context("Failed to begin transaction")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Transient storage conditions the application layer reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFault {
    /// Another writer holds the lock; retrying later can succeed.
    Contention,
    /// The database cannot be reached or written right now.
    Unavailable,
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;
const SQLITE_READONLY: i32 = 8;
const SQLITE_IOERR: i32 = 10;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;

/// Classify the first sqlx error found in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<StorageFault> {
    let sqlx_err = err.chain().find_map(|e| e.downcast_ref::<sqlx::Error>())?;

    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            // Extended result codes carry the primary code in the low byte.
            let code = db_err.code()?.parse::<i32>().ok()? & 0xff;
            match code {
                SQLITE_BUSY | SQLITE_LOCKED => Some(StorageFault::Contention),
                SQLITE_READONLY | SQLITE_IOERR | SQLITE_FULL | SQLITE_CANTOPEN => {
                    Some(StorageFault::Unavailable)
                }
                _ => None,
            }
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => Some(StorageFault::Unavailable),
        _ => None,
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("Invalid timestamp: {}", value))?
        .with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = earlier + chrono::Duration::microseconds(1500);

        let a = format_timestamp(earlier);
        let b = format_timestamp(later);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_timestamp(&b).unwrap(), later);
    }

    #[test]
    fn test_classify_pool_timeout_as_unavailable() {
        let err = anyhow::Error::new(sqlx::Error::PoolTimedOut).context("Failed to fetch");
        assert_eq!(classify(&err), Some(StorageFault::Unavailable));
    }

    #[test]
    fn test_classify_ignores_non_storage_errors() {
        let err = anyhow::anyhow!("Invalid transaction type: refund");
        assert_eq!(classify(&err), None);
    }
}
