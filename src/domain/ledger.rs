use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{AccountBalance, AccountId, Credits, NegativeBalancePolicy, TransactionRecord};

/// Compute a balance by replaying transaction records.
/// Balance = sum of applied deltas
pub fn compute_balance(records: &[TransactionRecord]) -> Credits {
    records.iter().map(|r| r.delta).sum()
}

/// Aggregated view of one account's log, as needed to reconcile its balance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSummary {
    pub account_id: AccountId,
    pub record_count: i64,
    pub total_delta: Credits,
    pub total_earned: Credits,
    pub total_spent: Credits,
    /// `resulting_balance` of the most recently appended record
    pub latest_resulting_balance: Credits,
    pub latest_policy: NegativeBalancePolicy,
}

impl LogSummary {
    /// Summarize records given in append order. Returns `None` for an empty slice.
    pub fn from_records(records: &[TransactionRecord]) -> Option<Self> {
        let latest = records.last()?;
        let total_earned = records.iter().filter(|r| r.delta > 0).map(|r| r.delta).sum();
        let total_spent = records.iter().filter(|r| r.delta < 0).map(|r| -r.delta).sum();

        Some(Self {
            account_id: latest.account_id.clone(),
            record_count: records.len() as i64,
            total_delta: compute_balance(records),
            total_earned,
            total_spent,
            latest_resulting_balance: latest.resulting_balance,
            latest_policy: latest.policy,
        })
    }

    /// The balance row the log justifies, replacing `current` (if any).
    pub fn rebuild_balance(
        &self,
        current: Option<&AccountBalance>,
        now: DateTime<Utc>,
    ) -> AccountBalance {
        AccountBalance {
            account_id: self.account_id.clone(),
            balance: self.total_delta,
            lifetime_earned: self.total_earned,
            lifetime_spent: self.total_spent,
            version: current.map(|b| b.version + 1).unwrap_or(1),
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Stored balance differs from the sum of logged deltas
    BalanceMismatch {
        account_id: AccountId,
        stored: Credits,
        logged: Credits,
    },
    /// Lifetime totals disagree with the log or with the balance itself
    LifetimeMismatch {
        account_id: AccountId,
        earned: Credits,
        spent: Credits,
        logged_earned: Credits,
        logged_spent: Credits,
    },
    /// The last record's resulting balance is not the stored balance
    ResultingBalanceMismatch {
        account_id: AccountId,
        stored: Credits,
        latest_resulting: Credits,
    },
    /// Negative balance not produced by an override
    UnauthorizedNegative {
        account_id: AccountId,
        balance: Credits,
        latest_policy: NegativeBalancePolicy,
    },
    /// A balance row exists with a non-zero balance but no log entries
    MissingHistory { account_id: AccountId, stored: Credits },
    /// Log entries exist for an account with no balance row
    MissingBalance { account_id: AccountId, logged: Credits },
}

impl IntegrityIssue {
    pub fn account_id(&self) -> &AccountId {
        match self {
            IntegrityIssue::BalanceMismatch { account_id, .. }
            | IntegrityIssue::LifetimeMismatch { account_id, .. }
            | IntegrityIssue::ResultingBalanceMismatch { account_id, .. }
            | IntegrityIssue::UnauthorizedNegative { account_id, .. }
            | IntegrityIssue::MissingHistory { account_id, .. }
            | IntegrityIssue::MissingBalance { account_id, .. } => account_id,
        }
    }

    /// True when re-deriving the balance row from the log fixes the issue.
    pub fn is_repairable(&self) -> bool {
        !matches!(self, IntegrityIssue::UnauthorizedNegative { .. })
    }
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::BalanceMismatch {
                account_id,
                stored,
                logged,
            } => write!(
                f,
                "{}: stored balance {} but log sums to {}",
                account_id, stored, logged
            ),
            IntegrityIssue::LifetimeMismatch {
                account_id,
                earned,
                spent,
                logged_earned,
                logged_spent,
            } => write!(
                f,
                "{}: lifetime totals {}/{} but log shows {}/{}",
                account_id, earned, spent, logged_earned, logged_spent
            ),
            IntegrityIssue::ResultingBalanceMismatch {
                account_id,
                stored,
                latest_resulting,
            } => write!(
                f,
                "{}: stored balance {} but latest record left {}",
                account_id, stored, latest_resulting
            ),
            IntegrityIssue::UnauthorizedNegative {
                account_id,
                balance,
                latest_policy,
            } => write!(
                f,
                "{}: balance {} is negative but latest record was applied under '{}'",
                account_id, balance, latest_policy
            ),
            IntegrityIssue::MissingHistory { account_id, stored } => {
                write!(f, "{}: balance {} has no transaction history", account_id, stored)
            }
            IntegrityIssue::MissingBalance { account_id, logged } => write!(
                f,
                "{}: log sums to {} but no balance row exists",
                account_id, logged
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub account_count: usize,
    pub transaction_count: i64,
    pub total_balance: Credits,
    pub issues: Vec<IntegrityIssue>,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Reconcile every balance row against the summary of its log.
pub fn build_integrity_report(
    balances: &[AccountBalance],
    summaries: &HashMap<AccountId, LogSummary>,
) -> IntegrityReport {
    let mut issues = Vec::new();

    for balance in balances {
        let account_id = &balance.account_id;
        match summaries.get(account_id) {
            Some(summary) => {
                if balance.balance != summary.total_delta {
                    issues.push(IntegrityIssue::BalanceMismatch {
                        account_id: account_id.clone(),
                        stored: balance.balance,
                        logged: summary.total_delta,
                    });
                }
                if !balance.is_consistent()
                    || balance.lifetime_earned != summary.total_earned
                    || balance.lifetime_spent != summary.total_spent
                {
                    issues.push(IntegrityIssue::LifetimeMismatch {
                        account_id: account_id.clone(),
                        earned: balance.lifetime_earned,
                        spent: balance.lifetime_spent,
                        logged_earned: summary.total_earned,
                        logged_spent: summary.total_spent,
                    });
                }
                if balance.balance != summary.latest_resulting_balance {
                    issues.push(IntegrityIssue::ResultingBalanceMismatch {
                        account_id: account_id.clone(),
                        stored: balance.balance,
                        latest_resulting: summary.latest_resulting_balance,
                    });
                }
                if balance.balance < 0 && summary.latest_policy != NegativeBalancePolicy::Override
                {
                    issues.push(IntegrityIssue::UnauthorizedNegative {
                        account_id: account_id.clone(),
                        balance: balance.balance,
                        latest_policy: summary.latest_policy,
                    });
                }
            }
            None if balance.balance != 0 => issues.push(IntegrityIssue::MissingHistory {
                account_id: account_id.clone(),
                stored: balance.balance,
            }),
            None => {}
        }
    }

    let mut orphaned: Vec<&LogSummary> = summaries
        .values()
        .filter(|s| !balances.iter().any(|b| b.account_id == s.account_id))
        .collect();
    orphaned.sort_by(|a, b| a.account_id.cmp(&b.account_id));
    for summary in orphaned {
        issues.push(IntegrityIssue::MissingBalance {
            account_id: summary.account_id.clone(),
            logged: summary.total_delta,
        });
    }

    IntegrityReport {
        account_count: balances.len(),
        transaction_count: summaries.values().map(|s| s.record_count).sum(),
        total_balance: balances.iter().map(|b| b.balance).sum(),
        issues,
    }
}
