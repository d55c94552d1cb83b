//! Append-only audit history for subsidy lifecycle changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grantledger_core::{AuditEntryId, Money, StaffId, SubsidyId};

use crate::subsidy::{Actor, SubsidyStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Created,
    Deactivated,
    Depleted,
    AutoExpired,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Created => "created",
            AuditAction::Deactivated => "deactivated",
            AuditAction::Depleted => "depleted",
            AuditAction::AutoExpired => "auto_expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(AuditAction::Created),
            "deactivated" => Some(AuditAction::Deactivated),
            "depleted" => Some(AuditAction::Depleted),
            "auto_expired" => Some(AuditAction::AutoExpired),
            _ => None,
        }
    }
}

impl core::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit row. `performed_by` is `None` for system actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: AuditEntryId,
    pub subsidy_id: Option<SubsidyId>,
    pub action: AuditAction,
    pub performed_by: Option<StaffId>,
    pub previous_status: Option<SubsidyStatus>,
    pub new_status: Option<SubsidyStatus>,
    pub amount_changed: Option<Money>,
    pub notes: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn created(
        subsidy_id: SubsidyId,
        actor: &Actor,
        amount: Money,
        provider_name: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditEntryId::new(),
            subsidy_id: Some(subsidy_id),
            action: AuditAction::Created,
            performed_by: Some(actor.staff_id),
            previous_status: None,
            new_status: Some(SubsidyStatus::Active),
            amount_changed: Some(amount),
            notes: Some(format!(
                "Subsidy of {amount} approved for provider {provider_name}. Reason: {reason}"
            )),
            ip_address: actor.ip_address.clone(),
            created_at: now,
        }
    }

    pub fn deactivated(
        subsidy_id: SubsidyId,
        actor: &Actor,
        previous_status: SubsidyStatus,
        remaining: Money,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: AuditEntryId::new(),
            subsidy_id: Some(subsidy_id),
            action: AuditAction::Deactivated,
            performed_by: Some(actor.staff_id),
            previous_status: Some(previous_status),
            new_status: Some(SubsidyStatus::Expired),
            amount_changed: Some(remaining),
            notes: Some(format!(
                "Subsidy deactivated with {remaining} remaining. Reason: {reason}"
            )),
            ip_address: actor.ip_address.clone(),
            created_at: now,
        }
    }

    /// System-performed: the balance reached zero during a usage write.
    pub fn depleted(subsidy_id: SubsidyId, total_used: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: AuditEntryId::new(),
            subsidy_id: Some(subsidy_id),
            action: AuditAction::Depleted,
            performed_by: None,
            previous_status: Some(SubsidyStatus::Active),
            new_status: Some(SubsidyStatus::Depleted),
            amount_changed: Some(total_used),
            notes: Some(format!("Subsidy fully used. Total used: {total_used}")),
            ip_address: None,
            created_at: now,
        }
    }

    /// System-performed: `valid_until` passed while the subsidy was still active.
    pub fn auto_expired(
        subsidy_id: SubsidyId,
        remaining: Money,
        valid_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let notes = match valid_until {
            Some(until) => format!(
                "Subsidy expired automatically (valid until {}) with {remaining} remaining",
                until.to_rfc3339()
            ),
            None => format!("Subsidy expired automatically with {remaining} remaining"),
        };
        Self {
            id: AuditEntryId::new(),
            subsidy_id: Some(subsidy_id),
            action: AuditAction::AutoExpired,
            performed_by: None,
            previous_status: Some(SubsidyStatus::Active),
            new_status: Some(SubsidyStatus::Expired),
            amount_changed: Some(remaining),
            notes: Some(notes),
            ip_address: None,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_names_round_trip_through_storage_form() {
        for action in [
            AuditAction::Created,
            AuditAction::Deactivated,
            AuditAction::Depleted,
            AuditAction::AutoExpired,
        ] {
            assert_eq!(AuditAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(AuditAction::parse("updated"), None);
    }

    #[test]
    fn deactivation_entry_carries_actor_and_remaining_balance() {
        let actor = Actor::new(StaffId::new()).with_ip("10.0.0.7");
        let entry = AuditLogEntry::deactivated(
            SubsidyId::new(),
            &actor,
            SubsidyStatus::Active,
            Money::from_major(25),
            "fraud suspected",
            Utc::now(),
        );

        assert_eq!(entry.performed_by, Some(actor.staff_id));
        assert_eq!(entry.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(entry.amount_changed, Some(Money::from_major(25)));
        let notes = entry.notes.unwrap_or_default();
        assert!(notes.contains("$25.00"));
        assert!(notes.contains("fraud suspected"));
    }

    #[test]
    fn system_entries_have_no_actor() {
        let entry = AuditLogEntry::depleted(SubsidyId::new(), Money::from_major(100), Utc::now());
        assert_eq!(entry.performed_by, None);
        assert_eq!(entry.previous_status, Some(SubsidyStatus::Active));
        assert_eq!(entry.new_status, Some(SubsidyStatus::Depleted));
    }
}
