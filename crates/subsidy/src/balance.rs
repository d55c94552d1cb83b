//! Balance projections and the charge-coverage rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grantledger_core::{Money, SubsidyId};

/// Anything that can report how much of a subsidy is left.
pub trait RemainingBalance {
    fn remaining_balance(&self) -> Money;
}

/// How much of `charge` a subsidy covers.
///
/// No subsidy, or one with nothing left, covers nothing. Negative charges
/// cover nothing. Otherwise the subsidy covers `min(charge, remaining)`.
pub fn calculate_subsidy_amount(subsidy: Option<&dyn RemainingBalance>, charge: Money) -> Money {
    let Some(subsidy) = subsidy else {
        return Money::ZERO;
    };
    let remaining = subsidy.remaining_balance();
    if !remaining.is_positive() || !charge.is_positive() {
        return Money::ZERO;
    }
    charge.min(remaining)
}

/// Customer-facing balance summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerBalance {
    pub has_active_subsidy: bool,
    pub provider_name: Option<String>,
    pub remaining_balance: Money,
    pub valid_until: Option<DateTime<Utc>>,
}

impl CustomerBalance {
    pub fn none() -> Self {
        Self {
            has_active_subsidy: false,
            provider_name: None,
            remaining_balance: Money::ZERO,
            valid_until: None,
        }
    }
}

/// Split of a prospective charge between the subsidy and the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeQuote {
    pub subsidy_id: Option<SubsidyId>,
    pub charge_amount: Money,
    pub subsidy_applied: Money,
    pub customer_pays: Money,
}

impl ChargeQuote {
    pub fn new(subsidy_id: Option<SubsidyId>, charge_amount: Money, subsidy_applied: Money) -> Self {
        let customer_pays = if charge_amount.is_positive() {
            Money::from_cents(charge_amount.cents() - subsidy_applied.cents())
        } else {
            Money::ZERO
        };
        Self {
            subsidy_id,
            charge_amount,
            subsidy_applied,
            customer_pays,
        }
    }
}
