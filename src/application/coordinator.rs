use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, instrument, warn};

use crate::config::LedgerConfig;
use crate::domain::{
    AccountId, AdjustmentError, BalanceChange, Credits, NegativeBalancePolicy, NewTransaction,
    TransactionId, TransactionRecord, TransactionType,
};
use crate::storage::{Database, DeltaOutcome, LedgerStore, TransactionLog};

use super::{AccountDirectory, LedgerError, storage_error};

/// Longest description stored with a transaction.
pub const MAX_DESCRIPTION_LEN: usize = 512;

/// Longest idempotency key accepted.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// A request to change one account's balance, as received from a caller.
#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub account_id: String,
    pub delta: Credits,
    pub transaction_type: TransactionType,
    pub description: Option<String>,
    pub policy: NegativeBalancePolicy,
    pub idempotency_key: Option<String>,
    /// Overrides the configured operation timeout
    pub timeout: Option<Duration>,
}

impl AdjustmentRequest {
    pub fn new(
        account_id: impl Into<String>,
        delta: Credits,
        transaction_type: TransactionType,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            delta,
            transaction_type,
            description: None,
            policy: NegativeBalancePolicy::Strict,
            idempotency_key: None,
            timeout: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_policy(mut self, policy: NegativeBalancePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a successful (or replayed) adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdjustmentOutcome {
    pub account_id: AccountId,
    pub previous_balance: Credits,
    pub new_balance: Credits,
    /// Delta actually applied; smaller in magnitude than requested when clamped
    pub applied_delta: Credits,
    pub transaction_id: TransactionId,
}

impl AdjustmentOutcome {
    fn from_record(record: &TransactionRecord) -> Self {
        Self {
            account_id: record.account_id.clone(),
            previous_balance: record.previous_balance(),
            new_balance: record.resulting_balance,
            applied_delta: record.delta,
            transaction_id: record.id,
        }
    }
}

/// Who is submitting an adjustment. Bulk legs get their own transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestOrigin {
    Single,
    Bulk,
}

/// A request that passed boundary validation.
#[derive(Debug, Clone)]
struct Adjustment {
    account_id: AccountId,
    delta: Credits,
    transaction_type: TransactionType,
    policy: NegativeBalancePolicy,
    description: String,
    idempotency_key: Option<String>,
    timeout: Duration,
}

impl Adjustment {
    fn from_request(
        request: AdjustmentRequest,
        origin: RequestOrigin,
        default_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let account_id = AccountId::parse(&request.account_id)?;
        let tt = request.transaction_type;

        if request.delta == 0 {
            return Err(LedgerError::Validation("Delta must not be zero".into()));
        }
        match (origin, tt) {
            (RequestOrigin::Single, TransactionType::BulkAdminAdjustment) => {
                return Err(LedgerError::Validation(
                    "bulk_admin_adjustment is reserved for bulk adjustments".into(),
                ));
            }
            (RequestOrigin::Bulk, t) if t != TransactionType::BulkAdminAdjustment => {
                return Err(LedgerError::Validation(format!(
                    "Bulk adjustments must use bulk_admin_adjustment, got {}",
                    t
                )));
            }
            _ => {}
        }
        if tt == TransactionType::Purchase && request.delta < 0 {
            return Err(LedgerError::Validation(
                "A purchase must have a positive delta".into(),
            ));
        }
        if tt == TransactionType::Consumption && request.delta > 0 {
            return Err(LedgerError::Validation(
                "A consumption must have a negative delta".into(),
            ));
        }

        let description = match request.description.as_deref().map(str::trim) {
            Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => {
                return Err(LedgerError::Validation(format!(
                    "Description is longer than {} characters",
                    MAX_DESCRIPTION_LEN
                )));
            }
            Some(d) if !d.is_empty() => d.to_string(),
            _ => tt.default_description().to_string(),
        };

        let idempotency_key = request
            .idempotency_key
            .map(|key| validate_idempotency_key(&key))
            .transpose()?;

        let timeout = request.timeout.unwrap_or(default_timeout);
        if timeout.is_zero() {
            return Err(LedgerError::Validation("Timeout must be greater than zero".into()));
        }

        Ok(Self {
            account_id,
            delta: request.delta,
            transaction_type: tt,
            policy: request.policy,
            description,
            idempotency_key,
            timeout,
        })
    }
}

/// Where an attempt stands once everything but the commit has run.
enum Prepared {
    /// The idempotency key was already used; nothing was written
    Replay(AdjustmentOutcome),
    /// Balance row and log record are written and wait for `COMMIT`
    Pending {
        tx: Transaction<'static, Sqlite>,
        record: TransactionRecord,
        change: BalanceChange,
    },
}

pub(crate) fn validate_idempotency_key(key: &str) -> Result<String, LedgerError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(LedgerError::Validation(
            "Idempotency key must not be empty".into(),
        ));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(LedgerError::Validation(format!(
            "Idempotency key is longer than {} bytes",
            MAX_IDEMPOTENCY_KEY_LEN
        )));
    }
    Ok(key.to_string())
}

/// Applies one signed delta to one account as a single atomic unit.
///
/// Each attempt runs in one SQLite transaction: lock the account, replay a known
/// idempotency key or apply the delta, append the log record, commit. Lock contention
/// is retried with exponential backoff; everything else is returned to the caller.
///
/// The operation timeout covers everything up to `COMMIT`. Once the commit has been
/// issued its result is always reported, so `TimedOut` means nothing was written.
#[derive(Clone)]
pub struct AdjustmentCoordinator {
    db: Database,
    store: LedgerStore,
    log: TransactionLog,
    directory: Arc<dyn AccountDirectory>,
    config: Arc<LedgerConfig>,
}

impl AdjustmentCoordinator {
    pub fn new(
        db: Database,
        store: LedgerStore,
        log: TransactionLog,
        directory: Arc<dyn AccountDirectory>,
        config: Arc<LedgerConfig>,
    ) -> Self {
        Self {
            db,
            store,
            log,
            directory,
            config,
        }
    }

    /// Validate and apply a single adjustment.
    pub async fn adjust(&self, request: AdjustmentRequest) -> Result<AdjustmentOutcome, LedgerError> {
        self.submit(request, RequestOrigin::Single).await
    }

    pub(crate) async fn submit(
        &self,
        request: AdjustmentRequest,
        origin: RequestOrigin,
    ) -> Result<AdjustmentOutcome, LedgerError> {
        let adjustment =
            Adjustment::from_request(request, origin, self.config.operation_timeout())?;

        if !self.directory.account_exists(&adjustment.account_id).await? {
            return Err(LedgerError::Validation(format!(
                "Unknown account: {}",
                adjustment.account_id
            )));
        }

        self.execute(adjustment).await
    }

    #[instrument(
        skip(self, adjustment),
        fields(
            account = %adjustment.account_id,
            delta = adjustment.delta,
            kind = %adjustment.transaction_type,
            policy = %adjustment.policy,
        )
    )]
    async fn execute(&self, adjustment: Adjustment) -> Result<AdjustmentOutcome, LedgerError> {
        let deadline = adjustment.timeout;
        let prepared = match tokio::time::timeout(deadline, self.run_with_retry(&adjustment)).await
        {
            Ok(prepared) => prepared?,
            Err(_) => {
                warn!(?deadline, "Adjustment timed out before commit");
                return Err(LedgerError::TimedOut(deadline));
            }
        };

        match prepared {
            Prepared::Replay(outcome) => Ok(outcome),
            Prepared::Pending { tx, record, change } => {
                tx.commit().await.map_err(|e| {
                    storage_error(
                        &adjustment.account_id,
                        anyhow::Error::new(e).context("Failed to commit adjustment"),
                    )
                })?;

                if change.was_clamped() {
                    info!(
                        requested = change.requested_delta,
                        applied = change.applied_delta,
                        "Adjustment clamped at zero"
                    );
                }
                info!(
                    transaction = %record.id,
                    previous = change.previous_balance,
                    new = change.next.balance,
                    "Adjustment committed"
                );

                Ok(AdjustmentOutcome::from_record(&record))
            }
        }
    }

    async fn run_with_retry(&self, adjustment: &Adjustment) -> Result<Prepared, LedgerError> {
        let max_attempts = self.config.retry.max_attempts;
        let mut attempt = 1;

        loop {
            match self.attempt(adjustment).await {
                Err(LedgerError::ConcurrentModification(_)) if attempt < max_attempts => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(attempt, max_attempts, ?delay, "Account contended, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(LedgerError::ConcurrentModification(account_id)) => {
                    warn!(attempts = attempt, "Giving up on contended account");
                    return Err(LedgerError::RetryExhausted {
                        account_id,
                        attempts: attempt,
                    });
                }
                result => return result,
            }
        }
    }

    async fn attempt(&self, adjustment: &Adjustment) -> Result<Prepared, LedgerError> {
        let account_id = &adjustment.account_id;
        let fail = |err: anyhow::Error| storage_error(account_id, err);

        let mut tx = self.db.begin().await.map_err(fail)?;
        self.store
            .lock_account(&mut *tx, account_id)
            .await
            .map_err(fail)?;

        if let Some(key) = &adjustment.idempotency_key {
            let prior = self
                .log
                .find_by_idempotency_key(&mut *tx, account_id, key)
                .await
                .map_err(fail)?;
            if let Some(record) = prior {
                if record.requested_delta != adjustment.delta
                    || record.transaction_type != adjustment.transaction_type
                {
                    warn!(
                        key = %key,
                        stored_delta = record.requested_delta,
                        "Idempotency key reused with different parameters; returning stored result"
                    );
                } else {
                    debug!(key = %key, transaction = %record.id, "Replaying idempotent adjustment");
                }
                // Nothing was written; dropping the transaction rolls back the lock row.
                return Ok(Prepared::Replay(AdjustmentOutcome::from_record(&record)));
            }
        }

        let outcome = self
            .store
            .apply_delta(&mut *tx, account_id, adjustment.delta, adjustment.policy)
            .await
            .map_err(fail)?;

        let change = match outcome {
            DeltaOutcome::Applied(change) => change,
            DeltaOutcome::Rejected(AdjustmentError::InsufficientBalance { balance, requested }) => {
                info!(balance, requested, "Adjustment rejected: insufficient balance");
                return Err(LedgerError::InsufficientBalance {
                    account_id: account_id.clone(),
                    balance,
                    requested,
                });
            }
            DeltaOutcome::Rejected(AdjustmentError::Overflow) => {
                return Err(LedgerError::Validation(
                    "Adjustment overflows the credit range".into(),
                ));
            }
            DeltaOutcome::Conflict => {
                debug!("Balance version changed underneath us");
                return Err(LedgerError::ConcurrentModification(account_id.clone()));
            }
        };

        let record = self
            .log
            .append(
                &mut *tx,
                NewTransaction {
                    account_id: account_id.clone(),
                    delta: change.applied_delta,
                    requested_delta: change.requested_delta,
                    resulting_balance: change.next.balance,
                    transaction_type: adjustment.transaction_type,
                    policy: adjustment.policy,
                    description: adjustment.description.clone(),
                    idempotency_key: adjustment.idempotency_key.clone(),
                },
            )
            .await
            .map_err(fail)?;

        Ok(Prepared::Pending { tx, record, change })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(request: AdjustmentRequest) -> Result<Adjustment, LedgerError> {
        Adjustment::from_request(request, RequestOrigin::Single, Duration::from_secs(5))
    }

    #[test]
    fn test_defaults_description_by_type() {
        let adjustment =
            validate(AdjustmentRequest::new("acct", 10, TransactionType::Purchase)).unwrap();
        assert_eq!(adjustment.description, "Credit purchase");
        assert_eq!(adjustment.policy, NegativeBalancePolicy::Strict);
        assert_eq!(adjustment.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_zero_delta() {
        let result = validate(AdjustmentRequest::new("acct", 0, TransactionType::AdminAdjustment));
        assert!(matches!(result, Err(LedgerError::Validation(_))));
    }

    #[test]
    fn test_rejects_sign_mismatch_for_type() {
        assert!(validate(AdjustmentRequest::new("acct", -5, TransactionType::Purchase)).is_err());
        assert!(validate(AdjustmentRequest::new("acct", 5, TransactionType::Consumption)).is_err());
        assert!(validate(AdjustmentRequest::new("acct", -5, TransactionType::AdminAdjustment)).is_ok());
    }

    #[test]
    fn test_bulk_type_is_reserved() {
        let request = AdjustmentRequest::new("acct", -5, TransactionType::BulkAdminAdjustment);
        assert!(validate(request.clone()).is_err());
        assert!(
            Adjustment::from_request(request, RequestOrigin::Bulk, Duration::from_secs(1)).is_ok()
        );
    }

    #[test]
    fn test_rejects_malformed_account_and_key() {
        assert!(validate(AdjustmentRequest::new(" ", 1, TransactionType::Purchase)).is_err());
        assert!(
            validate(
                AdjustmentRequest::new("acct", 1, TransactionType::Purchase)
                    .with_idempotency_key("   ")
            )
            .is_err()
        );
    }

    #[test]
    fn test_rejects_overlong_description() {
        let request = AdjustmentRequest::new("acct", 1, TransactionType::Purchase)
            .with_description("x".repeat(MAX_DESCRIPTION_LEN + 1));
        assert!(validate(request).is_err());
    }
}
