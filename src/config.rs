use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid configuration: {0}")]
pub struct InvalidConfig(pub String);

/// Tunables for the ledger. Every section has a working default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub bulk: BulkConfig,
    pub query: QueryConfig,
    /// Default deadline for one adjustment, retries included
    pub operation_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            bulk: BulkConfig::default(),
            query: QueryConfig::default(),
            operation_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub max_connections: u32,
    /// How long SQLite waits on a locked database before reporting busy
    pub busy_timeout_ms: u64,
    /// How long a caller waits for a pooled connection
    pub acquire_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout_ms: 5_000,
            acquire_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per adjustment before giving up with `RetryExhausted`
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff before retry number `attempt` (1-based), capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkConfig {
    /// Accounts adjusted in parallel
    pub concurrency: usize,
    pub max_accounts: usize,
    /// Deadline for each account's adjustment
    pub item_timeout_ms: u64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_accounts: 10_000,
            item_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_page_size: u32,
    /// Transactions shown in an account view
    pub recent_transactions: u32,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_page_size: 500,
            recent_transactions: 10,
        }
    }
}

impl LedgerConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.busy_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.acquire_timeout_ms)
    }

    pub fn bulk_item_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk.item_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.storage.max_connections == 0 {
            return Err(InvalidConfig("storage.max_connections must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(InvalidConfig("retry.max_attempts must be at least 1".into()));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(InvalidConfig(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.bulk.concurrency == 0 {
            return Err(InvalidConfig("bulk.concurrency must be at least 1".into()));
        }
        if self.bulk.max_accounts == 0 {
            return Err(InvalidConfig("bulk.max_accounts must be at least 1".into()));
        }
        if self.query.max_page_size == 0 {
            return Err(InvalidConfig("query.max_page_size must be at least 1".into()));
        }
        if self.operation_timeout_ms == 0 || self.bulk.item_timeout_ms == 0 {
            return Err(InvalidConfig("timeouts must be greater than zero".into()));
        }
        Ok(())
    }
}
