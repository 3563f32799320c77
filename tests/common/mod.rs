// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use tessera::application::{
    AccountDirectory, AdjustmentOutcome, AdjustmentRequest, CreditLedger, StaticDirectory,
};
use tessera::config::LedgerConfig;
use tessera::domain::{AccountId, Credits, TransactionType};
use tessera::storage::Database;

/// Helper to create a test ledger with a temporary database
pub async fn test_ledger() -> Result<(CreditLedger, TempDir)> {
    test_ledger_with_config(LedgerConfig::default()).await
}

pub async fn test_ledger_with_config(config: LedgerConfig) -> Result<(CreditLedger, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let ledger = CreditLedger::init(db_path.to_str().unwrap(), config).await?;
    Ok((ledger, temp_dir))
}

/// Helper to create a test ledger that only knows the given accounts
pub async fn test_ledger_with_accounts(accounts: &[&str]) -> Result<(CreditLedger, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let config = LedgerConfig::default();
    let db = Database::init(&format!("sqlite:{}", db_path.display()), &config).await?;

    let directory: Arc<dyn AccountDirectory> = Arc::new(StaticDirectory::new(
        accounts.iter().map(|a| AccountId::parse(a).unwrap()),
    ));
    let ledger = CreditLedger::new(db, config, directory)?;
    Ok((ledger, temp_dir))
}

/// Grant credits to an account with an admin adjustment
pub async fn fund(ledger: &CreditLedger, account: &str, amount: Credits) -> Result<AdjustmentOutcome> {
    Ok(ledger
        .adjust_balance(AdjustmentRequest::new(
            account,
            amount,
            TransactionType::AdminAdjustment,
        ))
        .await?)
}

/// Number of log records for an account
pub async fn record_count(ledger: &CreditLedger, account: &str) -> Result<u64> {
    Ok(ledger.list_transactions(account, 1, 1).await?.total)
}
