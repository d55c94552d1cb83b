//! Subsidy ledger domain (capped, single-direction consumption grants).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns. The
//! transactional orchestration around these types lives in `grantledger-infra`.

pub mod audit;
pub mod balance;
pub mod events;
pub mod policy;
pub mod provider;
pub mod subsidy;
pub mod usage;

pub use audit::{AuditAction, AuditLogEntry};
pub use balance::{ChargeQuote, CustomerBalance, RemainingBalance, calculate_subsidy_amount};
pub use events::{LedgerEvent, SubsidyCreated, SubsidyDeactivated, SubsidyExpired, UsageRecorded};
pub use policy::LedgerPolicy;
pub use provider::Provider;
pub use subsidy::{
    Actor, CreateSubsidy, DeactivationOutcome, Subsidy, SubsidyStatus, SubsidyView, UsageOutcome,
};
pub use usage::{ExternalRefs, RecordUsage, UsageTransaction};
