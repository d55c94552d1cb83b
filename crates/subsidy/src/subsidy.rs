use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grantledger_core::{CustomerId, DomainError, DomainResult, Entity, Money, ProviderId, StaffId, SubsidyId};

use crate::balance::RemainingBalance;

/// Lifecycle status of a subsidy.
///
/// Transitions are one-directional: `Active -> Depleted` (balance reached zero)
/// or `Active -> Expired` (deactivated or past `valid_until`). Both end states
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubsidyStatus {
    Active,
    Depleted,
    Expired,
}

impl SubsidyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubsidyStatus::Active => "active",
            SubsidyStatus::Depleted => "depleted",
            SubsidyStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SubsidyStatus::Active)
    }
}

impl core::fmt::Display for SubsidyStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubsidyStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // Older rows carry "approved" for staff-approved grants that are in use.
            "active" | "approved" => Ok(SubsidyStatus::Active),
            "depleted" => Ok(SubsidyStatus::Depleted),
            "expired" => Ok(SubsidyStatus::Expired),
            other => Err(DomainError::validation(format!("unknown subsidy status: {other}"))),
        }
    }
}

/// Already-authenticated staff identity performing an administrative action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub staff_id: StaffId,
    /// Originating IP, recorded for audit purposes only.
    pub ip_address: Option<String>,
}

impl Actor {
    pub fn new(staff_id: StaffId) -> Self {
        Self {
            staff_id,
            ip_address: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }
}

/// Command: grant a new subsidy to a customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSubsidy {
    pub customer_id: CustomerId,
    pub provider_id: ProviderId,
    pub approved_amount: Money,
    pub reason: String,
    pub valid_until: Option<DateTime<Utc>>,
    pub admin_notes: Option<String>,
}

/// A capped, provider-funded credit grant to one customer.
///
/// `remaining_balance` is always derived as `approved_amount - total_amount_used`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subsidy {
    pub id: SubsidyId,
    pub customer_id: CustomerId,
    pub provider_id: ProviderId,
    pub approved_amount: Money,
    pub total_amount_used: Money,
    pub status: SubsidyStatus,
    pub valid_from: DateTime<Utc>,
    pub valid_until: Option<DateTime<Utc>>,
    pub reason: String,
    pub admin_notes: Option<String>,
    pub approved_by: Option<StaffId>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Effect of applying a usage to a subsidy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageOutcome {
    pub remaining_balance: Money,
    pub total_amount_used: Money,
    /// The usage drove the balance to zero and the subsidy is now `Depleted`.
    pub depleted: bool,
}

/// Effect of an administrative deactivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeactivationOutcome {
    pub previous_status: SubsidyStatus,
    /// Balance forfeited by the deactivation.
    pub remaining_balance: Money,
}

impl Subsidy {
    /// Build a freshly approved, active subsidy. Validation happens in `LedgerPolicy`.
    pub fn approve(id: SubsidyId, cmd: &CreateSubsidy, approved_by: StaffId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            customer_id: cmd.customer_id,
            provider_id: cmd.provider_id,
            approved_amount: cmd.approved_amount,
            total_amount_used: Money::ZERO,
            status: SubsidyStatus::Active,
            valid_from: now,
            valid_until: cmd.valid_until,
            reason: cmd.reason.trim().to_string(),
            admin_notes: cmd.admin_notes.clone().filter(|n| !n.trim().is_empty()),
            approved_by: Some(approved_by),
            approved_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_balance(&self) -> Money {
        // Both operands are bounded by `approved_amount`, so this cannot overflow.
        Money::from_cents(self.approved_amount.cents() - self.total_amount_used.cents())
    }

    pub fn is_active(&self) -> bool {
        self.status == SubsidyStatus::Active
    }

    /// Active with a `valid_until` strictly before `now`.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.valid_until.is_some_and(|until| until < now)
    }

    pub fn ensure_owned_by(&self, customer_id: CustomerId) -> DomainResult<()> {
        if self.customer_id != customer_id {
            return Err(DomainError::forbidden("subsidy does not belong to this customer"));
        }
        Ok(())
    }

    pub fn ensure_active(&self) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::state(format!(
                "subsidy is not active (status: {})",
                self.status
            )));
        }
        Ok(())
    }

    /// Consume `applied` from the balance, transitioning to `Depleted` at zero.
    ///
    /// Must be called on the row as read inside the same transaction that
    /// persists the result.
    pub fn apply_usage(&mut self, applied: Money, now: DateTime<Utc>) -> DomainResult<UsageOutcome> {
        self.ensure_active()?;

        if applied.is_negative() {
            return Err(DomainError::validation("subsidy applied cannot be negative"));
        }

        let remaining = self.remaining_balance();
        if applied > remaining {
            return Err(DomainError::validation(format!(
                "insufficient balance: requested {applied}, available {remaining}"
            )));
        }

        self.total_amount_used = self
            .total_amount_used
            .checked_add(applied)
            .ok_or_else(|| DomainError::validation("usage amount overflow"))?;
        self.updated_at = now;

        let remaining = self.remaining_balance();
        let depleted = remaining.is_zero();
        if depleted {
            self.status = SubsidyStatus::Depleted;
        }

        Ok(UsageOutcome {
            remaining_balance: remaining,
            total_amount_used: self.total_amount_used,
            depleted,
        })
    }

    /// Administrative revocation: `Active -> Expired`.
    pub fn deactivate(&mut self, now: DateTime<Utc>) -> DomainResult<DeactivationOutcome> {
        match self.status {
            SubsidyStatus::Depleted => Err(DomainError::state("subsidy is already depleted")),
            SubsidyStatus::Expired => Err(DomainError::state("subsidy is already expired")),
            SubsidyStatus::Active => {
                let previous_status = self.status;
                self.status = SubsidyStatus::Expired;
                self.updated_at = now;
                Ok(DeactivationOutcome {
                    previous_status,
                    remaining_balance: self.remaining_balance(),
                })
            }
        }
    }

    /// Scheduled expiry once `valid_until` has passed.
    pub fn expire_overdue(&mut self, now: DateTime<Utc>) -> DomainResult<Money> {
        if !self.is_overdue(now) {
            return Err(DomainError::state(format!(
                "subsidy is not overdue (status: {})",
                self.status
            )));
        }
        self.status = SubsidyStatus::Expired;
        self.updated_at = now;
        Ok(self.remaining_balance())
    }
}

impl Entity for Subsidy {
    type Id = SubsidyId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl RemainingBalance for Subsidy {
    fn remaining_balance(&self) -> Money {
        Subsidy::remaining_balance(self)
    }
}

/// Read projection: a subsidy joined with its provider's display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyView {
    pub subsidy: Subsidy,
    pub provider_name: String,
}

impl RemainingBalance for SubsidyView {
    fn remaining_balance(&self) -> Money {
        self.subsidy.remaining_balance()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn active_subsidy(approved: Money) -> Subsidy {
        let cmd = CreateSubsidy {
            customer_id: CustomerId::new(),
            provider_id: ProviderId::new(),
            approved_amount: approved,
            reason: "school grant".to_string(),
            valid_until: None,
            admin_notes: None,
        };
        Subsidy::approve(SubsidyId::new(), &cmd, StaffId::new(), test_time())
    }

    #[test]
    fn usage_accumulates_and_depletes_at_zero() {
        let mut s = active_subsidy(Money::from_major(100));

        let first = s.apply_usage(Money::from_major(30), test_time()).unwrap();
        assert_eq!(first.remaining_balance, Money::from_major(70));
        assert!(!first.depleted);
        assert_eq!(s.status, SubsidyStatus::Active);

        let second = s.apply_usage(Money::from_major(70), test_time()).unwrap();
        assert_eq!(second.remaining_balance, Money::ZERO);
        assert!(second.depleted);
        assert_eq!(s.status, SubsidyStatus::Depleted);
    }

    #[test]
    fn overspend_is_rejected_without_mutation() {
        let mut s = active_subsidy(Money::from_major(100));
        let before = s.clone();

        let err = s.apply_usage(Money::from_cents(10_001), test_time()).unwrap_err();
        match err {
            DomainError::Validation(msg) => assert!(msg.contains("insufficient balance")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(s, before);
    }

    #[test]
    fn depleted_subsidy_rejects_further_usage() {
        let mut s = active_subsidy(Money::from_major(10));
        s.apply_usage(Money::from_major(10), test_time()).unwrap();

        let err = s.apply_usage(Money::ZERO, test_time()).unwrap_err();
        match err {
            DomainError::State(msg) => assert!(msg.contains("depleted")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deactivation_is_only_allowed_from_active() {
        let mut s = active_subsidy(Money::from_major(100));
        s.apply_usage(Money::from_major(75), test_time()).unwrap();

        let outcome = s.deactivate(test_time()).unwrap();
        assert_eq!(outcome.previous_status, SubsidyStatus::Active);
        assert_eq!(outcome.remaining_balance, Money::from_major(25));
        assert_eq!(s.status, SubsidyStatus::Expired);

        assert_eq!(
            s.deactivate(test_time()).unwrap_err(),
            DomainError::state("subsidy is already expired")
        );

        let mut depleted = active_subsidy(Money::from_major(5));
        depleted.apply_usage(Money::from_major(5), test_time()).unwrap();
        assert_eq!(
            depleted.deactivate(test_time()).unwrap_err(),
            DomainError::state("subsidy is already depleted")
        );
    }

    #[test]
    fn ownership_is_checked() {
        let s = active_subsidy(Money::from_major(5));
        assert!(s.ensure_owned_by(s.customer_id).is_ok());
        assert!(matches!(
            s.ensure_owned_by(CustomerId::new()),
            Err(DomainError::Forbidden(_))
        ));
    }

    #[test]
    fn expiry_requires_valid_until_in_the_past() {
        let now = test_time();
        let mut s = active_subsidy(Money::from_major(5));
        assert!(s.expire_overdue(now).is_err());

        s.valid_until = Some(now - Duration::minutes(1));
        assert_eq!(s.expire_overdue(now).unwrap(), Money::from_major(5));
        assert_eq!(s.status, SubsidyStatus::Expired);
    }

    #[test]
    fn legacy_approved_status_reads_as_active() {
        assert_eq!("approved".parse::<SubsidyStatus>().unwrap(), SubsidyStatus::Active);
        assert!("pending".parse::<SubsidyStatus>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence of usage requests arrives, the remaining
        /// balance stays within [0, approved] and only a zero balance depletes.
        #[test]
        fn balance_stays_within_bounds(
            approved in 1i64..1_000_000i64,
            requests in prop::collection::vec(0i64..400_000i64, 1..20)
        ) {
            let mut s = active_subsidy(Money::from_cents(approved));

            for req in requests {
                let _ = s.apply_usage(Money::from_cents(req), test_time());

                let remaining = s.remaining_balance();
                prop_assert!(remaining >= Money::ZERO);
                prop_assert!(remaining <= s.approved_amount);
                prop_assert_eq!(s.status == SubsidyStatus::Depleted, remaining.is_zero());
            }
        }
    }
}
