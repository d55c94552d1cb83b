//! Business limits applied before any transaction is opened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grantledger_core::{DomainError, DomainResult, Money};

use crate::subsidy::CreateSubsidy;

pub const DEFAULT_MAX_SUBSIDY_AMOUNT: Money = Money::from_major(100_000);
pub const DEFAULT_MAX_REASON_LEN: usize = 500;
pub const DEFAULT_MAX_ADMIN_NOTES_LEN: usize = 1000;

/// Configurable limits for subsidy creation and lifecycle actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerPolicy {
    /// Upper bound (inclusive) for `approved_amount`.
    pub max_subsidy_amount: Money,
    pub max_reason_len: usize,
    pub max_admin_notes_len: usize,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            max_subsidy_amount: DEFAULT_MAX_SUBSIDY_AMOUNT,
            max_reason_len: DEFAULT_MAX_REASON_LEN,
            max_admin_notes_len: DEFAULT_MAX_ADMIN_NOTES_LEN,
        }
    }
}

impl LedgerPolicy {
    pub fn with_max_subsidy_amount(mut self, max: Money) -> Self {
        self.max_subsidy_amount = max;
        self
    }

    pub fn validate_create(&self, cmd: &CreateSubsidy, now: DateTime<Utc>) -> DomainResult<()> {
        if !cmd.approved_amount.is_positive() {
            return Err(DomainError::validation("approved amount must be positive"));
        }
        if cmd.approved_amount > self.max_subsidy_amount {
            return Err(DomainError::validation(format!(
                "approved amount exceeds maximum limit ({})",
                self.max_subsidy_amount
            )));
        }

        self.validate_reason(&cmd.reason, "subsidy creation")?;

        if let Some(notes) = &cmd.admin_notes {
            if notes.chars().count() > self.max_admin_notes_len {
                return Err(DomainError::validation(format!(
                    "admin notes must be at most {} characters",
                    self.max_admin_notes_len
                )));
            }
        }

        if let Some(valid_until) = cmd.valid_until {
            if valid_until <= now {
                return Err(DomainError::validation("valid_until must be in the future"));
            }
        }

        Ok(())
    }

    /// Free-text justification required for creation and deactivation.
    pub fn validate_reason(&self, reason: &str, action: &str) -> DomainResult<()> {
        if reason.trim().is_empty() {
            return Err(DomainError::validation(format!("reason is required for {action}")));
        }
        if reason.chars().count() > self.max_reason_len {
            return Err(DomainError::validation(format!(
                "reason must be at most {} characters",
                self.max_reason_len
            )));
        }
        Ok(())
    }
}
