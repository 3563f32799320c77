use std::fmt;

use serde::{Deserialize, Serialize};

/// Credits are whole units of the internal currency. There are no fractional sub-units.
pub type Credits = i64;

/// Maximum length accepted for an account identifier.
pub const MAX_ACCOUNT_ID_LEN: usize = 128;

/// Identifier of an account as issued by the external account directory.
///
/// The ledger never invents account ids; it only checks that they are well-formed
/// before letting them reach storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Parse and validate an account id.
    pub fn parse(input: &str) -> Result<Self, InvalidAccountId> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(InvalidAccountId::Empty);
        }
        if trimmed.len() > MAX_ACCOUNT_ID_LEN {
            return Err(InvalidAccountId::TooLong(trimmed.len()));
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(InvalidAccountId::InvalidCharacter(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidAccountId {
    Empty,
    TooLong(usize),
    InvalidCharacter(String),
}

impl fmt::Display for InvalidAccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidAccountId::Empty => write!(f, "account id must not be empty"),
            InvalidAccountId::TooLong(len) => write!(
                f,
                "account id is {} characters long (max {})",
                len, MAX_ACCOUNT_ID_LEN
            ),
            InvalidAccountId::InvalidCharacter(id) => {
                write!(f, "account id '{}' contains whitespace or control characters", id.escape_debug())
            }
        }
    }
}

impl std::error::Error for InvalidAccountId {}
