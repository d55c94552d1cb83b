//! Facts emitted by the ledger after a transaction commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use grantledger_core::{CustomerId, Money, ProviderId, StaffId, SubsidyId};
use grantledger_events::{Event, EventEnvelope};

use crate::subsidy::SubsidyStatus;
use crate::usage::UsageTransaction;

pub const AGGREGATE_TYPE: &str = "subsidy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyCreated {
    pub subsidy_id: SubsidyId,
    pub customer_id: CustomerId,
    pub provider_id: ProviderId,
    pub provider_name: String,
    pub approved_amount: Money,
    pub valid_until: Option<DateTime<Utc>>,
    pub approved_by: StaffId,
    pub ip_address: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyDeactivated {
    pub subsidy_id: SubsidyId,
    pub customer_id: CustomerId,
    pub previous_status: SubsidyStatus,
    pub remaining_balance: Money,
    pub reason: String,
    pub deactivated_by: StaffId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyExpired {
    pub subsidy_id: SubsidyId,
    pub customer_id: CustomerId,
    pub remaining_balance: Money,
    pub valid_until: Option<DateTime<Utc>>,
    pub occurred_at: DateTime<Utc>,
}

/// A committed usage row plus the balance state it left behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecorded {
    pub usage: UsageTransaction,
    pub remaining_balance: Money,
    pub total_amount_used: Money,
    pub depleted: bool,
    /// Creation time of the subsidy, for rapid-depletion detection.
    pub subsidy_created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LedgerEvent {
    SubsidyCreated(SubsidyCreated),
    SubsidyDeactivated(SubsidyDeactivated),
    SubsidyExpired(SubsidyExpired),
    UsageRecorded(UsageRecorded),
}

impl LedgerEvent {
    pub fn subsidy_id(&self) -> SubsidyId {
        match self {
            LedgerEvent::SubsidyCreated(e) => e.subsidy_id,
            LedgerEvent::SubsidyDeactivated(e) => e.subsidy_id,
            LedgerEvent::SubsidyExpired(e) => e.subsidy_id,
            LedgerEvent::UsageRecorded(e) => e.usage.subsidy_id,
        }
    }

    pub fn customer_id(&self) -> CustomerId {
        match self {
            LedgerEvent::SubsidyCreated(e) => e.customer_id,
            LedgerEvent::SubsidyDeactivated(e) => e.customer_id,
            LedgerEvent::SubsidyExpired(e) => e.customer_id,
            LedgerEvent::UsageRecorded(e) => e.usage.customer_id,
        }
    }

    /// Wrap into an outbox envelope keyed by the subsidy id.
    pub fn into_envelope(self) -> EventEnvelope<LedgerEvent> {
        let aggregate_id = *self.subsidy_id().as_uuid();
        EventEnvelope::wrap(aggregate_id, AGGREGATE_TYPE, self)
    }
}

impl Event for LedgerEvent {
    fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::SubsidyCreated(_) => "subsidy.created",
            LedgerEvent::SubsidyDeactivated(_) => "subsidy.deactivated",
            LedgerEvent::SubsidyExpired(_) => "subsidy.expired",
            LedgerEvent::UsageRecorded(_) => "subsidy.usage_recorded",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEvent::SubsidyCreated(e) => e.occurred_at,
            LedgerEvent::SubsidyDeactivated(e) => e.occurred_at,
            LedgerEvent::SubsidyExpired(e) => e.occurred_at,
            LedgerEvent::UsageRecorded(e) => e.usage.applied_at,
        }
    }
}
