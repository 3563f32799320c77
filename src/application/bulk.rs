use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::LedgerConfig;
use crate::domain::{Credits, NegativeBalancePolicy, TransactionId, TransactionType};

use super::coordinator::{
    AdjustmentCoordinator, AdjustmentOutcome, AdjustmentRequest, MAX_DESCRIPTION_LEN,
    RequestOrigin, validate_idempotency_key,
};
use super::{ErrorKind, LedgerError};

/// Apply the same delta to many accounts.
#[derive(Debug, Clone)]
pub struct BulkAdjustmentRequest {
    pub account_ids: Vec<String>,
    pub delta: Credits,
    pub description: Option<String>,
    /// When set, each account's leg is deduplicated with key `"{batch_key}:{account_id}"`
    pub batch_key: Option<String>,
}

impl BulkAdjustmentRequest {
    pub fn new(account_ids: Vec<String>, delta: Credits) -> Self {
        Self {
            account_ids,
            delta,
            description: None,
            batch_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_batch_key(mut self, batch_key: impl Into<String>) -> Self {
        self.batch_key = Some(batch_key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome for one account of a bulk adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkItemResult {
    pub account_id: String,
    pub new_balance: Option<Credits>,
    pub applied_delta: Option<Credits>,
    pub transaction_id: Option<TransactionId>,
    pub error: Option<BulkItemError>,
}

impl BulkItemResult {
    fn from_result(account_id: String, result: Result<AdjustmentOutcome, LedgerError>) -> Self {
        match result {
            Ok(outcome) => Self {
                account_id,
                new_balance: Some(outcome.new_balance),
                applied_delta: Some(outcome.applied_delta),
                transaction_id: Some(outcome.transaction_id),
                error: None,
            },
            Err(err) => Self {
                account_id,
                new_balance: None,
                applied_delta: None,
                transaction_id: None,
                error: Some(BulkItemError {
                    kind: err.kind(),
                    message: err.to_string(),
                }),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkAdjustmentReport {
    /// One entry per distinct account, in request order
    pub items: Vec<BulkItemResult>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkAdjustmentReport {
    pub fn is_partial_failure(&self) -> bool {
        self.failed > 0 && self.succeeded > 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &BulkItemResult> {
        self.items.iter().filter(|item| !item.is_success())
    }
}

/// Fans one delta out over many accounts with the clamp-at-zero policy.
///
/// Each account goes through the coordinator as its own adjustment on its own task with
/// its own timeout, so one slow or failing account never holds back or fails the rest.
#[derive(Clone)]
pub struct BulkAdjuster {
    coordinator: AdjustmentCoordinator,
    config: Arc<LedgerConfig>,
}

impl BulkAdjuster {
    pub fn new(coordinator: AdjustmentCoordinator, config: Arc<LedgerConfig>) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Apply `request.delta` to every distinct account and report each leg.
    ///
    /// Legs run on detached tasks. If the returned future is dropped, legs that already
    /// started still commit, but their results are not reported anywhere. Submit with a
    /// `batch_key` when the caller may be cancelled: resubmitting the same request then
    /// replays the committed legs and applies only the missing ones.
    #[instrument(skip_all, fields(accounts = request.account_ids.len(), delta = request.delta))]
    pub async fn bulk_adjust(
        &self,
        request: BulkAdjustmentRequest,
    ) -> Result<BulkAdjustmentReport, LedgerError> {
        if request.delta == 0 {
            return Err(LedgerError::Validation("Delta must not be zero".into()));
        }
        let description_len = request
            .description
            .as_deref()
            .map(|d| d.trim().chars().count())
            .unwrap_or(0);
        if description_len > MAX_DESCRIPTION_LEN {
            return Err(LedgerError::Validation(format!(
                "Description is longer than {} characters",
                MAX_DESCRIPTION_LEN
            )));
        }
        let batch_key = request
            .batch_key
            .as_deref()
            .map(validate_idempotency_key)
            .transpose()?;

        let account_ids = dedupe(request.account_ids);
        if account_ids.len() > self.config.bulk.max_accounts {
            return Err(LedgerError::Validation(format!(
                "Bulk adjustment of {} accounts exceeds the limit of {}",
                account_ids.len(),
                self.config.bulk.max_accounts
            )));
        }

        let item_timeout = self.config.bulk_item_timeout();
        let items: Vec<BulkItemResult> = stream::iter(account_ids)
            .map(|account_id| {
                let coordinator = self.coordinator.clone();
                let mut leg = AdjustmentRequest::new(
                    account_id.clone(),
                    request.delta,
                    TransactionType::BulkAdminAdjustment,
                )
                .with_policy(NegativeBalancePolicy::Clamp)
                .with_timeout(item_timeout);
                if let Some(description) = &request.description {
                    leg = leg.with_description(description.clone());
                }
                if let Some(batch_key) = &batch_key {
                    leg = leg.with_idempotency_key(format!("{}:{}", batch_key, account_id.trim()));
                }

                async move {
                    let task = tokio::spawn(async move {
                        coordinator.submit(leg, RequestOrigin::Bulk).await
                    });
                    let result = match task.await {
                        Ok(result) => result,
                        Err(join_err) => Err(LedgerError::Database(
                            anyhow::Error::new(join_err).context("Adjustment task failed"),
                        )),
                    };
                    if let Err(err) = &result {
                        warn!(account = %account_id, error = %err, "Bulk adjustment leg failed");
                    }
                    BulkItemResult::from_result(account_id, result)
                }
            })
            .buffered(self.config.bulk.concurrency)
            .collect::<Vec<_>>()
            .await;

        let succeeded = items.iter().filter(|item| item.is_success()).count();
        let failed = items.len() - succeeded;
        info!(succeeded, failed, "Bulk adjustment finished");

        Ok(BulkAdjustmentReport {
            items,
            succeeded,
            failed,
        })
    }
}

/// Drop repeated account ids, keeping the first occurrence and the request order.
fn dedupe(account_ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    account_ids
        .into_iter()
        .filter(|id| seen.insert(id.trim().to_string()))
        .collect()
}
