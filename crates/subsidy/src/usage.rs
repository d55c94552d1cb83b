use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grantledger_core::{CustomerId, DomainError, DomainResult, Entity, Money, SubsidyId, UsageTransactionId};

/// Opaque identifiers in external billing systems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRefs {
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub plan_id: Option<String>,
}

/// Command: record consumption of a subsidy against one charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordUsage {
    pub subsidy_id: SubsidyId,
    pub customer_id: CustomerId,
    pub transaction_type: String,
    pub original_amount: Money,
    pub subsidy_applied: Money,
    pub customer_paid: Money,
    pub external_refs: ExternalRefs,
    pub description: Option<String>,
}

impl RecordUsage {
    /// Stateless checks, run before any transaction is opened.
    pub fn validate(&self) -> DomainResult<()> {
        if self.transaction_type.trim().is_empty() {
            return Err(DomainError::validation("transaction type is required"));
        }
        if self.original_amount.is_negative() {
            return Err(DomainError::validation("original amount cannot be negative"));
        }
        if self.subsidy_applied.is_negative() {
            return Err(DomainError::validation("subsidy applied cannot be negative"));
        }
        if self.customer_paid.is_negative() {
            return Err(DomainError::validation("customer paid cannot be negative"));
        }
        if self.subsidy_applied > self.original_amount {
            return Err(DomainError::validation(
                "subsidy applied cannot exceed original amount",
            ));
        }
        Ok(())
    }
}

/// One consumption event. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTransaction {
    pub id: UsageTransactionId,
    pub subsidy_id: SubsidyId,
    pub customer_id: CustomerId,
    pub transaction_type: String,
    pub original_amount: Money,
    pub subsidy_applied: Money,
    pub customer_paid: Money,
    pub external_refs: ExternalRefs,
    pub description: Option<String>,
    pub applied_at: DateTime<Utc>,
}

impl UsageTransaction {
    pub fn from_command(id: UsageTransactionId, cmd: &RecordUsage, applied_at: DateTime<Utc>) -> Self {
        Self {
            id,
            subsidy_id: cmd.subsidy_id,
            customer_id: cmd.customer_id,
            transaction_type: cmd.transaction_type.trim().to_string(),
            original_amount: cmd.original_amount,
            subsidy_applied: cmd.subsidy_applied,
            customer_paid: cmd.customer_paid,
            external_refs: cmd.external_refs.clone(),
            description: cmd.description.clone(),
            applied_at,
        }
    }
}

impl Entity for UsageTransaction {
    type Id = UsageTransactionId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(original: i64, applied: i64, paid: i64) -> RecordUsage {
        RecordUsage {
            subsidy_id: SubsidyId::new(),
            customer_id: CustomerId::new(),
            transaction_type: "subscription".to_string(),
            original_amount: Money::from_cents(original),
            subsidy_applied: Money::from_cents(applied),
            customer_paid: Money::from_cents(paid),
            external_refs: ExternalRefs::default(),
            description: None,
        }
    }

    #[test]
    fn accepts_well_formed_usage() {
        assert!(cmd(10_000, 4_000, 6_000).validate().is_ok());
        assert!(cmd(0, 0, 0).validate().is_ok());
    }

    #[test]
    fn rejects_negative_amounts() {
        assert!(cmd(-1, 0, 0).validate().is_err());
        assert!(cmd(100, -1, 0).validate().is_err());
        assert!(cmd(100, 0, -1).validate().is_err());
    }

    #[test]
    fn applied_cannot_exceed_original() {
        let err = cmd(100, 101, 0).validate().unwrap_err();
        assert_eq!(
            err,
            DomainError::validation("subsidy applied cannot exceed original amount")
        );
    }

    #[test]
    fn transaction_type_is_required() {
        let mut c = cmd(100, 10, 90);
        c.transaction_type = "  ".to_string();
        assert!(c.validate().is_err());
    }
}
