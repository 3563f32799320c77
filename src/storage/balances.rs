use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::domain::{
    AccountBalance, AccountId, AdjustmentError, BalanceChange, Credits, NegativeBalancePolicy,
};

use super::{Database, format_timestamp, parse_timestamp};

const BALANCE_COLUMNS: &str =
    "account_id, balance, lifetime_earned, lifetime_spent, version, updated_at";

/// Result of trying to apply a delta to a locked balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// The new balance was written; the caller still has to commit.
    Applied(BalanceChange),
    /// The policy refused the change. Nothing was written.
    Rejected(AdjustmentError),
    /// The row changed since it was read. Nothing was written.
    Conflict,
}

/// Durable per-account balances plus lifetime totals.
///
/// Reads go straight to the pool. Writes take a connection that is already inside a
/// transaction, so they can only happen as part of an adjustment that also appends
/// to the transaction log.
#[derive(Clone)]
pub struct LedgerStore {
    db: Database,
}

impl LedgerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the balance of an account, or a zero snapshot if it has never transacted.
    pub async fn get_balance(&self, account_id: &AccountId) -> Result<AccountBalance> {
        Ok(self
            .find(account_id)
            .await?
            .unwrap_or_else(|| AccountBalance::zero(account_id.clone(), Utc::now())))
    }

    /// Get the stored balance row of an account, if any.
    pub async fn find(&self, account_id: &AccountId) -> Result<Option<AccountBalance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM account_balances WHERE account_id = ?",
            BALANCE_COLUMNS
        ))
        .bind(account_id.as_str())
        .fetch_optional(self.db.pool())
        .await
        .context("Failed to fetch balance")?;

        row.as_ref().map(Self::row_to_balance).transpose()
    }

    /// Take exclusive ownership of an account for the rest of the transaction.
    ///
    /// Creates the zero row on first use. Being a write, this is what makes SQLite
    /// take its write lock, so it must be the first statement of the transaction.
    pub async fn lock_account(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_balances (account_id, balance, lifetime_earned, lifetime_spent, version, updated_at)
            VALUES (?, 0, 0, 0, 0, ?)
            ON CONFLICT(account_id) DO NOTHING
            "#,
        )
        .bind(account_id.as_str())
        .bind(format_timestamp(Utc::now()))
        .execute(&mut *conn)
        .await
        .context("Failed to lock account")?;
        Ok(())
    }

    /// Read, check and write one delta as a single read-modify-write on `conn`.
    ///
    /// The write only lands if `version` is unchanged since the read.
    pub async fn apply_delta(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        delta: Credits,
        policy: NegativeBalancePolicy,
    ) -> Result<DeltaOutcome> {
        let current = self.read_locked(conn, account_id).await?;

        let change = match current.apply(delta, policy, Utc::now()) {
            Ok(change) => change,
            Err(err) => return Ok(DeltaOutcome::Rejected(err)),
        };

        if self
            .write_versioned(conn, &change.next, current.version)
            .await?
        {
            Ok(DeltaOutcome::Applied(change))
        } else {
            Ok(DeltaOutcome::Conflict)
        }
    }

    async fn read_locked(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
    ) -> Result<AccountBalance> {
        Ok(self
            .find_locked(conn, account_id)
            .await?
            .unwrap_or_else(|| AccountBalance::zero(account_id.clone(), Utc::now())))
    }

    async fn write_versioned(
        &self,
        conn: &mut SqliteConnection,
        next: &AccountBalance,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE account_balances
            SET balance = ?, lifetime_earned = ?, lifetime_spent = ?, version = ?, updated_at = ?
            WHERE account_id = ? AND version = ?
            "#,
        )
        .bind(next.balance)
        .bind(next.lifetime_earned)
        .bind(next.lifetime_spent)
        .bind(next.version)
        .bind(format_timestamp(next.updated_at))
        .bind(next.account_id.as_str())
        .bind(expected_version)
        .execute(&mut *conn)
        .await
        .context("Failed to update balance")?;

        Ok(result.rows_affected() == 1)
    }

    /// Replace a balance row wholesale. Used only to repair skew from the log.
    pub async fn overwrite(
        &self,
        conn: &mut SqliteConnection,
        balance: &AccountBalance,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_balances (account_id, balance, lifetime_earned, lifetime_spent, version, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                balance = excluded.balance,
                lifetime_earned = excluded.lifetime_earned,
                lifetime_spent = excluded.lifetime_spent,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(balance.account_id.as_str())
        .bind(balance.balance)
        .bind(balance.lifetime_earned)
        .bind(balance.lifetime_spent)
        .bind(balance.version)
        .bind(format_timestamp(balance.updated_at))
        .execute(&mut *conn)
        .await
        .context("Failed to overwrite balance")?;
        Ok(())
    }

    /// Read a balance row inside an open transaction.
    pub async fn find_locked(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
    ) -> Result<Option<AccountBalance>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM account_balances WHERE account_id = ?",
            BALANCE_COLUMNS
        ))
        .bind(account_id.as_str())
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to read balance")?;

        row.as_ref().map(Self::row_to_balance).transpose()
    }

    /// List accounts whose balance is strictly below `threshold`, lowest first.
    pub async fn list_below(
        &self,
        threshold: Credits,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AccountBalance>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM account_balances
            WHERE balance < ?
            ORDER BY balance ASC, account_id ASC
            LIMIT ? OFFSET ?
            "#,
            BALANCE_COLUMNS
        ))
        .bind(threshold)
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.pool())
        .await
        .context("Failed to list low balances")?;

        rows.iter().map(Self::row_to_balance).collect()
    }

    /// Count accounts whose balance is strictly below `threshold`.
    pub async fn count_below(&self, threshold: Credits) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM account_balances WHERE balance < ?")
            .bind(threshold)
            .fetch_one(self.db.pool())
            .await
            .context("Failed to count low balances")?;

        Ok(row.get("count"))
    }

    /// List every balance row, ordered by account id.
    pub async fn list_all(&self) -> Result<Vec<AccountBalance>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM account_balances ORDER BY account_id",
            BALANCE_COLUMNS
        ))
        .fetch_all(self.db.pool())
        .await
        .context("Failed to list balances")?;

        rows.iter().map(Self::row_to_balance).collect()
    }

    fn row_to_balance(row: &SqliteRow) -> Result<AccountBalance> {
        let account_id: String = row.get("account_id");
        let updated_at: String = row.get("updated_at");

        Ok(AccountBalance {
            account_id: AccountId::parse(&account_id)
                .with_context(|| format!("Invalid stored account id: {:?}", account_id))?,
            balance: row.get("balance"),
            lifetime_earned: row.get("lifetime_earned"),
            lifetime_spent: row.get("lifetime_spent"),
            version: row.get("version"),
            updated_at: parse_timestamp(&updated_at)?,
        })
    }
}
