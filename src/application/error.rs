use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InvalidConfig;
use crate::domain::{AccountId, Credits, InvalidAccountId};
use crate::storage::{StorageFault, classify};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient balance in account {account_id}: balance {balance}, requested {requested}")]
    InsufficientBalance {
        account_id: AccountId,
        balance: Credits,
        requested: Credits,
    },

    #[error("Concurrent modification of account {0}")]
    ConcurrentModification(AccountId),

    #[error("Account {account_id} still contended after {attempts} attempts")]
    RetryExhausted { account_id: AccountId, attempts: u32 },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Database error: {0:#}")]
    Database(anyhow::Error),
}

/// Coarse classification of a [`LedgerError`], stable enough to put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InsufficientBalance,
    ConcurrentModification,
    RetryExhausted,
    StorageUnavailable,
    TimedOut,
    Internal,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::InsufficientBalance { .. } => ErrorKind::InsufficientBalance,
            LedgerError::ConcurrentModification(_) => ErrorKind::ConcurrentModification,
            LedgerError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            LedgerError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            LedgerError::TimedOut(_) => ErrorKind::TimedOut,
            LedgerError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed if sent again later.
    /// Retrying an adjustment is only safe when it carries an idempotency key.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConcurrentModification
                | ErrorKind::RetryExhausted
                | ErrorKind::StorageUnavailable
                | ErrorKind::TimedOut
        )
    }
}

impl From<anyhow::Error> for LedgerError {
    fn from(err: anyhow::Error) -> Self {
        match classify(&err) {
            Some(StorageFault::Contention) | Some(StorageFault::Unavailable) => {
                LedgerError::StorageUnavailable(format!("{:#}", err))
            }
            None => LedgerError::Database(err),
        }
    }
}

impl From<InvalidAccountId> for LedgerError {
    fn from(err: InvalidAccountId) -> Self {
        LedgerError::Validation(err.to_string())
    }
}

impl From<InvalidConfig> for LedgerError {
    fn from(err: InvalidConfig) -> Self {
        LedgerError::Validation(err.to_string())
    }
}

/// Map a storage failure hit while holding an account, keeping lock contention retryable.
pub(crate) fn storage_error(account_id: &AccountId, err: anyhow::Error) -> LedgerError {
    match classify(&err) {
        Some(StorageFault::Contention) => LedgerError::ConcurrentModification(account_id.clone()),
        _ => LedgerError::from(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let account_id = AccountId::parse("acct").unwrap();
        assert!(LedgerError::StorageUnavailable("down".into()).is_transient());
        assert!(LedgerError::TimedOut(Duration::from_secs(1)).is_transient());
        assert!(!LedgerError::Validation("bad".into()).is_transient());
        assert!(
            !LedgerError::InsufficientBalance {
                account_id,
                balance: 1,
                requested: -2
            }
            .is_transient()
        );
    }

    #[test]
    fn test_pool_timeout_becomes_unavailable() {
        let err: LedgerError = anyhow::Error::new(sqlx::Error::PoolTimedOut).into();
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
    }

    #[test]
    fn test_unclassified_errors_are_internal() {
        let err: LedgerError = anyhow::anyhow!("Invalid policy: lenient").into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
