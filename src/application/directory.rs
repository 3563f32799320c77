use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::AccountId;

/// External source of truth for which accounts exist.
///
/// The ledger asks it before the first write to an account; it never stores
/// account metadata itself.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account_exists(&self, account_id: &AccountId) -> Result<bool>;
}

/// Accepts every well-formed account id.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenDirectory;

#[async_trait]
impl AccountDirectory for OpenDirectory {
    async fn account_exists(&self, _account_id: &AccountId) -> Result<bool> {
        Ok(true)
    }
}

/// Fixed allow-list of accounts.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    accounts: HashSet<AccountId>,
}

impl StaticDirectory {
    pub fn new(accounts: impl IntoIterator<Item = AccountId>) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn account_exists(&self, account_id: &AccountId) -> Result<bool> {
        Ok(self.accounts.contains(account_id))
    }
}
