use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    AccountBalance, AccountId, Credits, IntegrityReport, TransactionId, TransactionRecord,
    build_integrity_report,
};
use crate::storage::{Database, LedgerStore, TransactionLog};

use super::{
    AccountDirectory, AccountView, AdjustmentCoordinator, AdjustmentOutcome, AdjustmentRequest,
    BulkAdjuster, BulkAdjustmentReport, BulkAdjustmentRequest, LedgerError, OpenDirectory, Page,
    QueryService, storage_error,
};

/// Application service providing high-level operations for the ledger.
/// This is the primary interface for any client (CLI, tests, embedding services).
#[derive(Clone)]
pub struct CreditLedger {
    db: Database,
    store: LedgerStore,
    log: TransactionLog,
    coordinator: AdjustmentCoordinator,
    bulk: BulkAdjuster,
    queries: QueryService,
    config: Arc<LedgerConfig>,
}

impl CreditLedger {
    /// Wire the ledger components around an open database.
    pub fn new(
        db: Database,
        config: LedgerConfig,
        directory: Arc<dyn AccountDirectory>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        let config = Arc::new(config);

        let store = LedgerStore::new(db.clone());
        let log = TransactionLog::new(db.clone());
        let coordinator = AdjustmentCoordinator::new(
            db.clone(),
            store.clone(),
            log.clone(),
            directory,
            config.clone(),
        );
        let bulk = BulkAdjuster::new(coordinator.clone(), config.clone());
        let queries = QueryService::new(store.clone(), log.clone(), config.clone());

        Ok(Self {
            db,
            store,
            log,
            coordinator,
            bulk,
            queries,
            config,
        })
    }

    /// Initialize a new database at the given path.
    pub async fn init(database_path: &str, config: LedgerConfig) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}", database_path);
        let db = Database::init(&db_url, &config).await?;
        Self::new(db, config, Arc::new(OpenDirectory))
    }

    /// Connect to an existing database.
    pub async fn connect(database_path: &str, config: LedgerConfig) -> Result<Self, LedgerError> {
        let db_url = format!("sqlite:{}", database_path);
        let db = Database::connect(&db_url, &config, false).await?;
        Self::new(db, config, Arc::new(OpenDirectory))
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    // ========================
    // Adjustments
    // ========================

    /// Apply a signed delta to one account.
    pub async fn adjust_balance(
        &self,
        request: AdjustmentRequest,
    ) -> Result<AdjustmentOutcome, LedgerError> {
        self.coordinator.adjust(request).await
    }

    /// Apply the same delta to many accounts, clamping debits at zero.
    pub async fn bulk_adjust(
        &self,
        request: BulkAdjustmentRequest,
    ) -> Result<BulkAdjustmentReport, LedgerError> {
        self.bulk.bulk_adjust(request).await
    }

    // ========================
    // Queries
    // ========================

    pub async fn get_balance(&self, account_id: &str) -> Result<AccountBalance, LedgerError> {
        self.queries.get_balance(account_id).await
    }

    pub async fn list_transactions(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<TransactionRecord>, LedgerError> {
        self.queries
            .list_transactions(account_id, page, page_size)
            .await
    }

    pub async fn get_history(
        &self,
        account_id: &str,
        limit: u32,
        before: Option<TransactionId>,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        self.queries.get_history(account_id, limit, before).await
    }

    pub async fn list_low_balance(
        &self,
        threshold: Credits,
        page: u32,
        page_size: u32,
    ) -> Result<Page<AccountBalance>, LedgerError> {
        self.queries
            .list_low_balance(threshold, page, page_size)
            .await
    }

    pub async fn account_view(&self, account_id: &str) -> Result<AccountView, LedgerError> {
        self.queries.account_view(account_id).await
    }

    // ========================
    // Integrity
    // ========================

    /// Compare every balance row against the transaction log.
    #[instrument(skip(self))]
    pub async fn check_integrity(&self) -> Result<IntegrityReport, LedgerError> {
        let balances = self.store.list_all().await?;
        let summaries = self.log.summaries().await?;
        let report = build_integrity_report(&balances, &summaries);

        if report.is_healthy() {
            info!(
                accounts = report.account_count,
                transactions = report.transaction_count,
                "Ledger is consistent"
            );
        } else {
            warn!(issues = report.issues.len(), "Ledger integrity issues found");
        }
        Ok(report)
    }

    /// Rewrite an account's balance row from its transaction log.
    #[instrument(skip(self))]
    pub async fn repair_account(&self, account_id: &str) -> Result<AccountBalance, LedgerError> {
        let account_id = AccountId::parse(account_id)?;
        let fail = |err: anyhow::Error| storage_error(&account_id, err);

        let mut tx = self.db.begin().await.map_err(fail)?;
        self.store
            .lock_account(&mut *tx, &account_id)
            .await
            .map_err(fail)?;

        let current = self
            .store
            .find_locked(&mut *tx, &account_id)
            .await
            .map_err(fail)?;
        let summary = self
            .log
            .summary_for(&mut *tx, &account_id)
            .await
            .map_err(fail)?;

        // Every committed write bumps the version, so a version 0 row is the one
        // `lock_account` just inserted. Dropping `tx` rolls it back.
        let has_row = current.as_ref().is_some_and(|b| b.version > 0);
        if summary.is_none() && !has_row {
            return Err(LedgerError::Validation(format!(
                "Account {} has no balance row or transaction history",
                account_id
            )));
        }

        let now = Utc::now();
        let repaired = match summary {
            Some(summary) => summary.rebuild_balance(current.as_ref(), now),
            None => {
                let mut zero = AccountBalance::zero(account_id.clone(), now);
                zero.version = current.as_ref().map(|b| b.version + 1).unwrap_or(1);
                zero
            }
        };

        self.store
            .overwrite(&mut *tx, &repaired)
            .await
            .map_err(fail)?;
        tx.commit()
            .await
            .map_err(|e| fail(anyhow::Error::new(e).context("Failed to commit repair")))?;

        if current.as_ref().map(|b| b.balance) != Some(repaired.balance) {
            warn!(
                previous = ?current.as_ref().map(|b| b.balance),
                repaired = repaired.balance,
                "Balance rewritten from the transaction log"
            );
        } else {
            info!(balance = repaired.balance, "Balance row rebuilt");
        }
        Ok(repaired)
    }
}
