use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use uuid::Uuid;

use crate::domain::{
    AccountId, LogSummary, NegativeBalancePolicy, NewTransaction, TransactionId,
    TransactionRecord, TransactionType,
};

use super::{Database, format_timestamp, parse_timestamp};

const RECORD_COLUMNS: &str = "sequence, id, account_id, delta, requested_delta, resulting_balance, transaction_type, policy, description, idempotency_key, created_at";

/// Append-only log of every balance change.
///
/// Records are never updated or deleted; the schema rejects both with triggers.
#[derive(Clone)]
pub struct TransactionLog {
    db: Database,
}

impl TransactionLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a record inside the caller's transaction.
    /// Assigns the id, the sequence number and the timestamp.
    pub async fn append(
        &self,
        conn: &mut SqliteConnection,
        new: NewTransaction,
    ) -> Result<TransactionRecord> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let row = sqlx::query(
            r#"
            INSERT INTO credit_transactions (id, account_id, delta, requested_delta, resulting_balance, transaction_type, policy, description, idempotency_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING sequence
            "#,
        )
        .bind(id.to_string())
        .bind(new.account_id.as_str())
        .bind(new.delta)
        .bind(new.requested_delta)
        .bind(new.resulting_balance)
        .bind(new.transaction_type.as_str())
        .bind(new.policy.as_str())
        .bind(&new.description)
        .bind(new.idempotency_key.as_deref())
        .bind(format_timestamp(created_at))
        .fetch_one(&mut *conn)
        .await
        .context("Failed to append transaction")?;

        Ok(TransactionRecord {
            id,
            sequence: row.get("sequence"),
            account_id: new.account_id,
            delta: new.delta,
            requested_delta: new.requested_delta,
            resulting_balance: new.resulting_balance,
            transaction_type: new.transaction_type,
            policy: new.policy,
            description: new.description,
            idempotency_key: new.idempotency_key,
            // Re-parse so the returned value matches what a later read yields.
            created_at: parse_timestamp(&format_timestamp(created_at))?,
        })
    }

    /// Find the record an idempotency key produced for an account, inside a transaction.
    pub async fn find_by_idempotency_key(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
        key: &str,
    ) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credit_transactions WHERE account_id = ? AND idempotency_key = ?",
            RECORD_COLUMNS
        ))
        .bind(account_id.as_str())
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to look up idempotency key")?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    /// Get a record by ID.
    pub async fn get(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM credit_transactions WHERE id = ?",
            RECORD_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(self.db.pool())
        .await
        .context("Failed to fetch transaction")?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    /// Newest-first history of an account, optionally starting strictly before `before`.
    pub async fn get_history(
        &self,
        account_id: &AccountId,
        limit: i64,
        before: Option<&TransactionRecord>,
    ) -> Result<Vec<TransactionRecord>> {
        let mut query = format!(
            "SELECT {} FROM credit_transactions WHERE account_id = ?",
            RECORD_COLUMNS
        );
        if before.is_some() {
            query.push_str(" AND (created_at, sequence) < (?, ?)");
        }
        query.push_str(" ORDER BY created_at DESC, sequence DESC LIMIT ?");

        let cursor_created_at = before.map(|r| format_timestamp(r.created_at));

        let mut sql_query = sqlx::query(&query).bind(account_id.as_str());
        if let (Some(created_at), Some(record)) = (&cursor_created_at, before) {
            sql_query = sql_query.bind(created_at).bind(record.sequence);
        }

        let rows = sql_query
            .bind(limit)
            .fetch_all(self.db.pool())
            .await
            .context("Failed to fetch transaction history")?;

        rows.iter().map(Self::row_to_record).collect()
    }

    /// One page of an account's history, newest first.
    pub async fn list_for_account(
        &self,
        account_id: &AccountId,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TransactionRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM credit_transactions
            WHERE account_id = ?
            ORDER BY created_at DESC, sequence DESC
            LIMIT ? OFFSET ?
            "#,
            RECORD_COLUMNS
        ))
        .bind(account_id.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.pool())
        .await
        .context("Failed to list transactions")?;

        rows.iter().map(Self::row_to_record).collect()
    }

    /// Count records for an account.
    pub async fn count_for_account(&self, account_id: &AccountId) -> Result<i64> {
        let row =
            sqlx::query("SELECT COUNT(*) as count FROM credit_transactions WHERE account_id = ?")
                .bind(account_id.as_str())
                .fetch_one(self.db.pool())
                .await
                .context("Failed to count transactions")?;

        Ok(row.get("count"))
    }

    /// Per-account totals for every account that has at least one record.
    pub async fn summaries(&self) -> Result<HashMap<AccountId, LogSummary>> {
        let rows = sqlx::query(&Self::summary_query(false))
            .fetch_all(self.db.pool())
            .await
            .context("Failed to summarize transaction log")?;

        rows.iter()
            .map(|row| Self::row_to_summary(row).map(|s| (s.account_id.clone(), s)))
            .collect()
    }

    /// Totals for one account, read inside the caller's transaction.
    pub async fn summary_for(
        &self,
        conn: &mut SqliteConnection,
        account_id: &AccountId,
    ) -> Result<Option<LogSummary>> {
        let row = sqlx::query(&Self::summary_query(true))
            .bind(account_id.as_str())
            .fetch_optional(&mut *conn)
            .await
            .context("Failed to summarize account log")?;

        row.as_ref().map(Self::row_to_summary).transpose()
    }

    fn summary_query(single_account: bool) -> String {
        let mut query = String::from(
            r#"
            SELECT
                t.account_id,
                COUNT(*) as record_count,
                COALESCE(SUM(t.delta), 0) as total_delta,
                COALESCE(SUM(CASE WHEN t.delta > 0 THEN t.delta ELSE 0 END), 0) as total_earned,
                COALESCE(SUM(CASE WHEN t.delta < 0 THEN -t.delta ELSE 0 END), 0) as total_spent,
                latest.resulting_balance as latest_resulting_balance,
                latest.policy as latest_policy
            FROM credit_transactions t
            JOIN credit_transactions latest
              ON latest.sequence = (
                  SELECT MAX(sequence) FROM credit_transactions WHERE account_id = t.account_id
              )
            "#,
        );
        if single_account {
            query.push_str(" WHERE t.account_id = ?");
        }
        query.push_str(" GROUP BY t.account_id");
        query
    }

    fn row_to_summary(row: &SqliteRow) -> Result<LogSummary> {
        let account_id: String = row.get("account_id");
        let policy: String = row.get("latest_policy");

        Ok(LogSummary {
            account_id: AccountId::parse(&account_id)
                .with_context(|| format!("Invalid stored account id: {:?}", account_id))?,
            record_count: row.get("record_count"),
            total_delta: row.get("total_delta"),
            total_earned: row.get("total_earned"),
            total_spent: row.get("total_spent"),
            latest_resulting_balance: row.get("latest_resulting_balance"),
            latest_policy: NegativeBalancePolicy::from_str(&policy)
                .ok_or_else(|| anyhow::anyhow!("Invalid policy: {}", policy))?,
        })
    }

    fn row_to_record(row: &SqliteRow) -> Result<TransactionRecord> {
        let id: String = row.get("id");
        let account_id: String = row.get("account_id");
        let transaction_type: String = row.get("transaction_type");
        let policy: String = row.get("policy");
        let created_at: String = row.get("created_at");

        Ok(TransactionRecord {
            id: Uuid::parse_str(&id).context("Invalid transaction ID")?,
            sequence: row.get("sequence"),
            account_id: AccountId::parse(&account_id)
                .with_context(|| format!("Invalid stored account id: {:?}", account_id))?,
            delta: row.get("delta"),
            requested_delta: row.get("requested_delta"),
            resulting_balance: row.get("resulting_balance"),
            transaction_type: TransactionType::from_str(&transaction_type)
                .ok_or_else(|| anyhow::anyhow!("Invalid transaction type: {}", transaction_type))?,
            policy: NegativeBalancePolicy::from_str(&policy)
                .ok_or_else(|| anyhow::anyhow!("Invalid policy: {}", policy))?,
            description: row.get("description"),
            idempotency_key: row.get("idempotency_key"),
            created_at: parse_timestamp(&created_at)?,
        })
    }
}
