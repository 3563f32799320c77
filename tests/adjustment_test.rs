mod common;

use std::time::Duration;

use anyhow::Result;
use common::{fund, record_count, test_ledger, test_ledger_with_config};
use tessera::application::{AdjustmentRequest, ErrorKind, LedgerError};
use tessera::config::LedgerConfig;
use tessera::domain::{NegativeBalancePolicy, TransactionType};

#[tokio::test]
async fn test_purchase_credits_account_and_logs_record() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "alice", 200).await?;

    let outcome = ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", 50, TransactionType::Purchase)
                .with_description("Starter pack"),
        )
        .await?;

    assert_eq!(outcome.previous_balance, 200);
    assert_eq!(outcome.new_balance, 250);
    assert_eq!(outcome.applied_delta, 50);
    assert_eq!(ledger.get_balance("alice").await?.balance, 250);

    let history = ledger.get_history("alice", 10, None).await?;
    assert_eq!(history.len(), 2);
    let latest = &history[0];
    assert_eq!(latest.id, outcome.transaction_id);
    assert_eq!(latest.delta, 50);
    assert_eq!(latest.resulting_balance, 250);
    assert_eq!(latest.transaction_type, TransactionType::Purchase);
    assert_eq!(latest.description, "Starter pack");

    Ok(())
}

#[tokio::test]
async fn test_overdraft_is_rejected_without_side_effects() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "alice", 50).await?;
    let before = ledger.get_balance("alice").await?;

    let result = ledger
        .adjust_balance(AdjustmentRequest::new(
            "alice",
            -100,
            TransactionType::AdminAdjustment,
        ))
        .await;

    match result {
        Err(LedgerError::InsufficientBalance {
            balance, requested, ..
        }) => {
            assert_eq!(balance, 50);
            assert_eq!(requested, -100);
        }
        other => panic!("expected insufficient balance, got {:?}", other),
    }

    let after = ledger.get_balance("alice").await?;
    assert_eq!(after.balance, 50);
    assert_eq!(after.version, before.version);
    assert_eq!(record_count(&ledger, "alice").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_consumption_down_to_exactly_zero() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "alice", 30).await?;

    let outcome = ledger
        .adjust_balance(AdjustmentRequest::new(
            "alice",
            -30,
            TransactionType::Consumption,
        ))
        .await?;
    assert_eq!(outcome.new_balance, 0);

    let balance = ledger.get_balance("alice").await?;
    assert_eq!(balance.lifetime_earned, 30);
    assert_eq!(balance.lifetime_spent, 30);

    Ok(())
}

#[tokio::test]
async fn test_clamp_policy_on_single_adjustment() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "alice", 5).await?;

    let outcome = ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", -20, TransactionType::AdminAdjustment)
                .with_policy(NegativeBalancePolicy::Clamp),
        )
        .await?;

    assert_eq!(outcome.applied_delta, -5);
    assert_eq!(outcome.new_balance, 0);

    let latest = &ledger.get_history("alice", 1, None).await?[0];
    assert_eq!(latest.requested_delta, -20);
    assert_eq!(latest.delta, -5);
    assert!(latest.was_clamped());

    Ok(())
}

#[tokio::test]
async fn test_override_allows_negative_balance() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "alice", 10).await?;

    let outcome = ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", -25, TransactionType::AdminAdjustment)
                .with_policy(NegativeBalancePolicy::Override),
        )
        .await?;
    assert_eq!(outcome.new_balance, -15);

    let latest = &ledger.get_history("alice", 1, None).await?[0];
    assert_eq!(latest.policy, NegativeBalancePolicy::Override);

    // Overridden negatives are legitimate and do not show up as integrity issues.
    assert!(ledger.check_integrity().await?.is_healthy());

    Ok(())
}

#[tokio::test]
async fn test_idempotency_key_applies_once() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;

    let request = AdjustmentRequest::new("alice", 100, TransactionType::Purchase)
        .with_idempotency_key("order-42");
    let first = ledger.adjust_balance(request.clone()).await?;
    let second = ledger.adjust_balance(request).await?;

    assert_eq!(first, second);
    assert_eq!(ledger.get_balance("alice").await?.balance, 100);
    assert_eq!(record_count(&ledger, "alice").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_reused_idempotency_key_returns_stored_result() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;

    let first = ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", 100, TransactionType::Purchase)
                .with_idempotency_key("order-42"),
        )
        .await?;
    let replay = ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", 999, TransactionType::Purchase)
                .with_idempotency_key("order-42"),
        )
        .await?;

    assert_eq!(replay, first);
    assert_eq!(ledger.get_balance("alice").await?.balance, 100);

    Ok(())
}

#[tokio::test]
async fn test_idempotency_keys_are_scoped_per_account() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;

    for account in ["alice", "bob"] {
        ledger
            .adjust_balance(
                AdjustmentRequest::new(account, 10, TransactionType::Purchase)
                    .with_idempotency_key("promo"),
            )
            .await?;
    }

    assert_eq!(ledger.get_balance("alice").await?.balance, 10);
    assert_eq!(ledger.get_balance("bob").await?.balance, 10);

    Ok(())
}

#[tokio::test]
async fn test_validation_errors() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;

    let cases = vec![
        AdjustmentRequest::new("alice", 0, TransactionType::AdminAdjustment),
        AdjustmentRequest::new("", 10, TransactionType::Purchase),
        AdjustmentRequest::new("alice", -10, TransactionType::Purchase),
        AdjustmentRequest::new("alice", 10, TransactionType::Consumption),
        AdjustmentRequest::new("alice", -10, TransactionType::BulkAdminAdjustment),
        AdjustmentRequest::new("alice", 10, TransactionType::Purchase)
            .with_timeout(Duration::ZERO),
    ];

    for request in cases {
        let err = ledger.adjust_balance(request.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "request {:?}", request);
        assert!(!err.is_transient());
    }

    assert_eq!(record_count(&ledger, "alice").await?, 0);

    Ok(())
}

#[tokio::test]
async fn test_balance_equals_sum_of_logged_deltas() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;

    let deltas = [500, -120, 40, -420, 7, -3];
    for delta in deltas {
        fund(&ledger, "alice", delta).await?;
    }
    // Rejected and clamped adjustments must keep the sum intact too.
    assert!(fund(&ledger, "alice", -1_000).await.is_err());
    ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", -1_000, TransactionType::AdminAdjustment)
                .with_policy(NegativeBalancePolicy::Clamp),
        )
        .await?;

    let page = ledger.list_transactions("alice", 1, 100).await?;
    let sum: i64 = page.items.iter().map(|r| r.delta).sum();
    let balance = ledger.get_balance("alice").await?;

    assert_eq!(balance.balance, sum);
    assert_eq!(balance.balance, 0);
    assert_eq!(page.total, deltas.len() as u64 + 1);
    assert!(ledger.check_integrity().await?.is_healthy());

    Ok(())
}

#[tokio::test]
async fn test_unknown_account_reads_as_zero() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;

    let balance = ledger.get_balance("nobody").await?;
    assert_eq!(balance.balance, 0);
    assert_eq!(balance.version, 0);
    assert!(ledger.get_history("nobody", 10, None).await?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_times_out_while_account_is_locked_elsewhere() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "alice", 10).await?;

    // Hold the database write lock on a separate connection.
    let mut blocker = ledger.database().pool().acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *blocker).await?;

    let result = ledger
        .adjust_balance(
            AdjustmentRequest::new("alice", 5, TransactionType::Purchase)
                .with_timeout(Duration::from_millis(200)),
        )
        .await;

    sqlx::query("ROLLBACK").execute(&mut *blocker).await?;
    drop(blocker);

    let err = result.unwrap_err();
    assert!(matches!(err, LedgerError::TimedOut(_)), "got {:?}", err);
    assert!(err.is_transient());

    assert_eq!(ledger.get_balance("alice").await?.balance, 10);
    assert_eq!(record_count(&ledger, "alice").await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_contention_exhausts_retries() -> Result<()> {
    let mut config = LedgerConfig::default();
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.storage.busy_timeout_ms = 50;
    config.operation_timeout_ms = 5_000;
    let (ledger, _temp) = test_ledger_with_config(config).await?;
    fund(&ledger, "alice", 10).await?;

    let mut blocker = ledger.database().pool().acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *blocker).await?;

    let result = ledger
        .adjust_balance(AdjustmentRequest::new("alice", 5, TransactionType::Purchase))
        .await;

    sqlx::query("ROLLBACK").execute(&mut *blocker).await?;
    drop(blocker);

    let err = result.unwrap_err();
    match &err {
        LedgerError::RetryExhausted {
            account_id,
            attempts,
        } => {
            assert_eq!(account_id.as_str(), "alice");
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected retry exhaustion, got {:?}", other),
    }
    assert_eq!(err.kind(), ErrorKind::RetryExhausted);

    assert_eq!(ledger.get_balance("alice").await?.balance, 10);
    assert_eq!(record_count(&ledger, "alice").await?, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_commits_once_contention_clears_before_deadline() -> Result<()> {
    let mut config = LedgerConfig::default();
    config.retry.max_attempts = 50;
    config.retry.base_delay_ms = 5;
    config.retry.max_delay_ms = 20;
    config.storage.busy_timeout_ms = 20;
    let (ledger, _temp) = test_ledger_with_config(config).await?;
    fund(&ledger, "alice", 10).await?;

    let mut blocker = ledger.database().pool().acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *blocker).await?;

    let contender = ledger.clone();
    let handle = tokio::spawn(async move {
        contender
            .adjust_balance(
                AdjustmentRequest::new("alice", 5, TransactionType::Purchase)
                    .with_timeout(Duration::from_secs(5)),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(150)).await;
    sqlx::query("ROLLBACK").execute(&mut *blocker).await?;
    drop(blocker);

    let outcome = handle.await??;
    assert_eq!(outcome.previous_balance, 10);
    assert_eq!(outcome.new_balance, 15);

    // The reported outcome is exactly what was committed.
    let latest = &ledger.get_history("alice", 1, None).await?[0];
    assert_eq!(latest.id, outcome.transaction_id);
    assert_eq!(ledger.get_balance("alice").await?.balance, 15);
    assert_eq!(record_count(&ledger, "alice").await?, 2);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_credits_on_one_account() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    let n = 20;

    let handles: Vec<_> = (0..n)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .adjust_balance(AdjustmentRequest::new(
                        "shared",
                        1,
                        TransactionType::AdminAdjustment,
                    ))
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await??;
    }

    let balance = ledger.get_balance("shared").await?;
    assert_eq!(balance.balance, n);
    assert_eq!(balance.version, n);
    assert_eq!(record_count(&ledger, "shared").await?, n as u64);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_never_overdraw() -> Result<()> {
    let (ledger, _temp) = test_ledger().await?;
    fund(&ledger, "shared", 10).await?;

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .adjust_balance(AdjustmentRequest::new(
                        "shared",
                        -1,
                        TransactionType::Consumption,
                    ))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientBalance { .. }) => rejected += 1,
            Err(err) => return Err(err.into()),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(rejected, 10);
    assert_eq!(ledger.get_balance("shared").await?.balance, 0);
    assert_eq!(record_count(&ledger, "shared").await?, 11);

    Ok(())
}
