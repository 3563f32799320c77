use std::sync::Arc;

use serde::Serialize;

use crate::config::LedgerConfig;
use crate::domain::{AccountBalance, AccountId, Credits, TransactionId, TransactionRecord};
use crate::storage::{LedgerStore, TransactionLog};

use super::LedgerError;

/// One page of a numbered listing. Pages start at 1.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        self.total.div_ceil(u64::from(self.page_size))
    }

    pub fn has_next(&self) -> bool {
        u64::from(self.page) < self.total_pages()
    }
}

/// Balance plus the most recent transactions of one account.
#[derive(Debug, Clone, Serialize)]
pub struct AccountView {
    pub balance: AccountBalance,
    pub recent: Vec<TransactionRecord>,
}

/// Read-only lookups over balances and the transaction log.
#[derive(Clone)]
pub struct QueryService {
    store: LedgerStore,
    log: TransactionLog,
    config: Arc<LedgerConfig>,
}

impl QueryService {
    pub fn new(store: LedgerStore, log: TransactionLog, config: Arc<LedgerConfig>) -> Self {
        Self { store, log, config }
    }

    /// Get the balance of an account (zero if it has never transacted).
    pub async fn get_balance(&self, account_id: &str) -> Result<AccountBalance, LedgerError> {
        let account_id = AccountId::parse(account_id)?;
        Ok(self.store.get_balance(&account_id).await?)
    }

    /// List an account's transactions, newest first.
    pub async fn list_transactions(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Page<TransactionRecord>, LedgerError> {
        let account_id = AccountId::parse(account_id)?;
        let (limit, offset) = self.page_window(page, page_size)?;

        let items = self.log.list_for_account(&account_id, limit, offset).await?;
        let total = self.log.count_for_account(&account_id).await?;

        Ok(Page {
            items,
            page,
            page_size,
            total: total as u64,
        })
    }

    /// Cursor-based history: up to `limit` records strictly older than `before`, newest first.
    pub async fn get_history(
        &self,
        account_id: &str,
        limit: u32,
        before: Option<TransactionId>,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let account_id = AccountId::parse(account_id)?;
        self.check_page_size(limit)?;

        let cursor = match before {
            Some(id) => match self.log.get(id).await? {
                Some(record) if record.account_id == account_id => Some(record),
                _ => {
                    return Err(LedgerError::Validation(format!(
                        "Transaction {} does not belong to account {}",
                        id, account_id
                    )));
                }
            },
            None => None,
        };

        Ok(self
            .log
            .get_history(&account_id, i64::from(limit), cursor.as_ref())
            .await?)
    }

    /// Accounts whose balance is strictly below `threshold`, lowest balance first.
    pub async fn list_low_balance(
        &self,
        threshold: Credits,
        page: u32,
        page_size: u32,
    ) -> Result<Page<AccountBalance>, LedgerError> {
        let (limit, offset) = self.page_window(page, page_size)?;

        let items = self.store.list_below(threshold, limit, offset).await?;
        let total = self.store.count_below(threshold).await?;

        Ok(Page {
            items,
            page,
            page_size,
            total: total as u64,
        })
    }

    /// Balance and recent activity of one account.
    pub async fn account_view(&self, account_id: &str) -> Result<AccountView, LedgerError> {
        let account_id = AccountId::parse(account_id)?;
        let balance = self.store.get_balance(&account_id).await?;
        let recent = self
            .log
            .get_history(
                &account_id,
                i64::from(self.config.query.recent_transactions),
                None,
            )
            .await?;

        Ok(AccountView { balance, recent })
    }

    fn check_page_size(&self, page_size: u32) -> Result<(), LedgerError> {
        let max = self.config.query.max_page_size;
        if page_size == 0 || page_size > max {
            return Err(LedgerError::Validation(format!(
                "Page size must be between 1 and {}",
                max
            )));
        }
        Ok(())
    }

    fn page_window(&self, page: u32, page_size: u32) -> Result<(i64, i64), LedgerError> {
        if page == 0 {
            return Err(LedgerError::Validation("Pages start at 1".into()));
        }
        self.check_page_size(page_size)?;
        let offset = (i64::from(page) - 1) * i64::from(page_size);
        Ok((i64::from(page_size), offset))
    }
}
