use async_trait::async_trait;
use chrono::{DateTime, Utc};

use grantledger_core::{CustomerId, ProviderId, SubsidyId, UsageTransactionId};
use grantledger_subsidy::{AuditLogEntry, Provider, Subsidy, SubsidyView, UsageTransaction};

use super::query::{Page, PageRequest, SubsidyFilter, SubsidySummary};
use crate::error::StoreError;

/// One serializable unit of work against the ledger.
///
/// Reads made through a transaction observe a consistent snapshot, and rows
/// returned by `lock_*` stay locked until the transaction ends. Nothing is
/// visible to others until `commit`. Dropping a transaction without committing
/// rolls it back.
#[async_trait]
pub trait LedgerTx: Send {
    async fn provider(&mut self, id: ProviderId) -> Result<Option<Provider>, StoreError>;

    /// Serialize all subsidy creation for one customer until this transaction ends.
    async fn lock_customer(&mut self, customer_id: CustomerId) -> Result<(), StoreError>;

    /// The customer's non-terminal subsidy, if any.
    async fn find_open_subsidy_for_customer(
        &mut self,
        customer_id: CustomerId,
    ) -> Result<Option<Subsidy>, StoreError>;

    /// Read the subsidy row and hold a write lock on it.
    async fn lock_subsidy(&mut self, id: SubsidyId) -> Result<Option<Subsidy>, StoreError>;

    /// Fails with `StoreError::Conflict` when the customer already has an active subsidy.
    async fn insert_subsidy(&mut self, subsidy: &Subsidy) -> Result<(), StoreError>;

    async fn update_subsidy(&mut self, subsidy: &Subsidy) -> Result<(), StoreError>;

    async fn insert_usage(&mut self, usage: &UsageTransaction) -> Result<(), StoreError>;

    async fn find_usage(&mut self, id: UsageTransactionId) -> Result<Option<UsageTransaction>, StoreError>;

    /// Append an audit row. A failure here leaves the rest of the
    /// transaction intact and committable.
    async fn append_audit(&mut self, entry: &AuditLogEntry) -> Result<(), StoreError>;

    /// `StoreError::Transient` only when the transaction is known not to have
    /// been applied. A failure with an unknown outcome is `Backend`.
    async fn commit(self) -> Result<(), StoreError>;
}

/// Ledger persistence: transactional writes plus weakly-isolated reads.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    type Tx: LedgerTx + 'static;

    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    async fn find_subsidy(&self, id: SubsidyId) -> Result<Option<SubsidyView>, StoreError>;

    async fn find_active_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<SubsidyView>, StoreError>;

    /// Newest first.
    async fn list_subsidies(
        &self,
        filter: &SubsidyFilter,
        page: PageRequest,
    ) -> Result<Page<SubsidyView>, StoreError>;

    /// Oldest first.
    async fn usage_for_subsidy(&self, id: SubsidyId) -> Result<Vec<UsageTransaction>, StoreError>;

    /// Newest first.
    async fn usage_for_customer(
        &self,
        customer_id: CustomerId,
        page: PageRequest,
    ) -> Result<Page<UsageTransaction>, StoreError>;

    /// Oldest first.
    async fn audit_for_subsidy(&self, id: SubsidyId) -> Result<Vec<AuditLogEntry>, StoreError>;

    async fn summary(&self) -> Result<SubsidySummary, StoreError>;

    /// Active subsidies with `valid_until < now`, oldest deadline first.
    async fn find_overdue(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SubsidyId>, StoreError>;
}
