use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountId, Credits, NegativeBalancePolicy};

pub type TransactionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits bought by the account holder
    Purchase,
    /// Credits used up by an automated caller
    Consumption,
    /// Manual correction by an administrator
    AdminAdjustment,
    /// One leg of an administrator's bulk adjustment
    BulkAdminAdjustment,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Consumption => "consumption",
            TransactionType::AdminAdjustment => "admin_adjustment",
            TransactionType::BulkAdminAdjustment => "bulk_admin_adjustment",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "purchase" => Some(TransactionType::Purchase),
            "consumption" => Some(TransactionType::Consumption),
            "admin_adjustment" | "admin" => Some(TransactionType::AdminAdjustment),
            "bulk_admin_adjustment" => Some(TransactionType::BulkAdminAdjustment),
            _ => None,
        }
    }

    /// Description used when the caller does not provide one.
    pub fn default_description(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "Credit purchase",
            TransactionType::Consumption => "Credit consumption",
            TransactionType::AdminAdjustment => "Administrative adjustment",
            TransactionType::BulkAdminAdjustment => "Bulk administrative adjustment",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An immutable audit entry for one successful balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    /// Position in the log; strictly increasing in append order
    pub sequence: i64,
    pub account_id: AccountId,
    /// Amount actually applied to the balance
    pub delta: Credits,
    /// Amount the caller asked for (differs from `delta` only when clamped)
    pub requested_delta: Credits,
    pub resulting_balance: Credits,
    pub transaction_type: TransactionType,
    /// Negative-balance policy the change was applied under
    pub policy: NegativeBalancePolicy,
    pub description: String,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Balance the account held right before this record was applied.
    pub fn previous_balance(&self) -> Credits {
        self.resulting_balance - self.delta
    }

    pub fn was_clamped(&self) -> bool {
        self.delta != self.requested_delta
    }
}

/// A record about to be appended. Id, sequence and timestamp are assigned by the log.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: AccountId,
    pub delta: Credits,
    pub requested_delta: Credits,
    pub resulting_balance: Credits,
    pub transaction_type: TransactionType,
    pub policy: NegativeBalancePolicy,
    pub description: String,
    pub idempotency_key: Option<String>,
}
