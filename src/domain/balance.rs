use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, Credits};

/// How an adjustment treats a result that would fall below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegativeBalancePolicy {
    /// Reject the adjustment with `InsufficientBalance`.
    #[default]
    Strict,
    /// Reduce a debit so the balance lands exactly on zero.
    Clamp,
    /// Explicitly allow the balance to go negative.
    Override,
}

impl NegativeBalancePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegativeBalancePolicy::Strict => "strict",
            NegativeBalancePolicy::Clamp => "clamp",
            NegativeBalancePolicy::Override => "override",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Some(NegativeBalancePolicy::Strict),
            "clamp" => Some(NegativeBalancePolicy::Clamp),
            "override" => Some(NegativeBalancePolicy::Override),
            _ => None,
        }
    }
}

impl fmt::Display for NegativeBalancePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current balance of one account plus the lifetime totals that justify it.
///
/// `balance == lifetime_earned - lifetime_spent` holds for every snapshot produced
/// by [`AccountBalance::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub balance: Credits,
    pub lifetime_earned: Credits,
    pub lifetime_spent: Credits,
    /// Incremented on every write; used for optimistic concurrency checks.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// The planned effect of one delta on one balance snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceChange {
    pub previous_balance: Credits,
    pub requested_delta: Credits,
    pub applied_delta: Credits,
    pub next: AccountBalance,
}

impl BalanceChange {
    pub fn was_clamped(&self) -> bool {
        self.applied_delta != self.requested_delta
    }
}

impl AccountBalance {
    /// The implicit snapshot of an account that has never transacted.
    pub fn zero(account_id: AccountId, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            balance: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
            version: 0,
            updated_at: now,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.lifetime_earned.checked_sub(self.lifetime_spent) == Some(self.balance)
    }

    /// Plan the application of `delta` under `policy`.
    ///
    /// Returns the snapshot that should replace `self`, with `version` bumped by one.
    pub fn apply(
        &self,
        delta: Credits,
        policy: NegativeBalancePolicy,
        now: DateTime<Utc>,
    ) -> Result<BalanceChange, AdjustmentError> {
        let candidate = self
            .balance
            .checked_add(delta)
            .ok_or(AdjustmentError::Overflow)?;

        let applied_delta = if candidate >= 0 {
            delta
        } else {
            match policy {
                NegativeBalancePolicy::Strict => {
                    return Err(AdjustmentError::InsufficientBalance {
                        balance: self.balance,
                        requested: delta,
                    });
                }
                NegativeBalancePolicy::Override => delta,
                // Clamping only ever lands on zero. An overridden negative balance cannot be
                // clamped back up, so it is rejected the same way strict mode rejects it.
                NegativeBalancePolicy::Clamp if delta < 0 && self.balance >= 0 => -self.balance,
                NegativeBalancePolicy::Clamp => {
                    return Err(AdjustmentError::InsufficientBalance {
                        balance: self.balance,
                        requested: delta,
                    });
                }
            }
        };

        let (earned, spent) = if applied_delta >= 0 {
            (applied_delta, 0)
        } else {
            (0, applied_delta.checked_neg().ok_or(AdjustmentError::Overflow)?)
        };

        let next = AccountBalance {
            account_id: self.account_id.clone(),
            balance: self
                .balance
                .checked_add(applied_delta)
                .ok_or(AdjustmentError::Overflow)?,
            lifetime_earned: self
                .lifetime_earned
                .checked_add(earned)
                .ok_or(AdjustmentError::Overflow)?,
            lifetime_spent: self
                .lifetime_spent
                .checked_add(spent)
                .ok_or(AdjustmentError::Overflow)?,
            version: self.version + 1,
            updated_at: now,
        };

        Ok(BalanceChange {
            previous_balance: self.balance,
            requested_delta: delta,
            applied_delta,
            next,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdjustmentError {
    InsufficientBalance { balance: Credits, requested: Credits },
    Overflow,
}

impl fmt::Display for AdjustmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustmentError::InsufficientBalance { balance, requested } => write!(
                f,
                "applying {} to a balance of {} would make it negative",
                requested, balance
            ),
            AdjustmentError::Overflow => write!(f, "adjustment overflows the credit range"),
        }
    }
}

impl std::error::Error for AdjustmentError {}
