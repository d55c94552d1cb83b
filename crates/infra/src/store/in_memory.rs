use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use grantledger_core::{CustomerId, Money, ProviderId, SubsidyId, UsageTransactionId};
use grantledger_subsidy::{
    AuditLogEntry, Provider, Subsidy, SubsidyStatus, SubsidyView, UsageTransaction,
};

use super::query::{Page, PageRequest, SubsidyFilter, SubsidySummary};
use super::r#trait::{LedgerStore, LedgerTx};
use crate::error::StoreError;

#[derive(Debug, Default, Clone)]
struct LedgerState {
    providers: HashMap<ProviderId, Provider>,
    subsidies: HashMap<SubsidyId, Subsidy>,
    usage: Vec<UsageTransaction>,
    audit: Vec<AuditLogEntry>,
}

impl LedgerState {
    fn view(&self, subsidy: &Subsidy) -> SubsidyView {
        let provider_name = self
            .providers
            .get(&subsidy.provider_id)
            .map(|p| p.name.clone())
            .unwrap_or_default();
        SubsidyView {
            subsidy: subsidy.clone(),
            provider_name,
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: AtomicU32,
    lost_commit_acks: AtomicU32,
    failing_audits: AtomicU32,
}

impl Faults {
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Transactions are fully serialized: `begin` takes
/// one async mutex for the whole transaction and works on a private copy of
/// the state, which replaces the shared state only on `commit`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<Mutex<LedgerState>>,
    faults: Arc<Faults>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_provider(&self, provider: Provider) {
        self.state.lock().await.providers.insert(provider.id, provider);
    }

    /// Make the next `n` commits fail as serialization failures.
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.failing_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` commits apply their writes and then report a
    /// transient failure, as when the connection drops after `COMMIT`.
    pub fn lose_next_commit_acks(&self, n: u32) {
        self.faults.lost_commit_acks.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` audit appends fail.
    pub fn fail_next_audits(&self, n: u32) {
        self.faults.failing_audits.store(n, Ordering::SeqCst);
    }

    pub async fn usage_count(&self) -> usize {
        self.state.lock().await.usage.len()
    }
}

/// Transaction handle for `InMemoryLedgerStore`.
pub struct InMemoryLedgerTx {
    guard: OwnedMutexGuard<LedgerState>,
    staged: LedgerState,
    faults: Arc<Faults>,
}

#[async_trait]
impl LedgerTx for InMemoryLedgerTx {
    async fn provider(&mut self, id: ProviderId) -> Result<Option<Provider>, StoreError> {
        Ok(self.staged.providers.get(&id).cloned())
    }

    async fn lock_customer(&mut self, _customer_id: CustomerId) -> Result<(), StoreError> {
        // The store-wide mutex already serializes every transaction.
        Ok(())
    }

    async fn find_open_subsidy_for_customer(
        &mut self,
        customer_id: CustomerId,
    ) -> Result<Option<Subsidy>, StoreError> {
        Ok(self
            .staged
            .subsidies
            .values()
            .find(|s| s.customer_id == customer_id && !s.status.is_terminal())
            .cloned())
    }

    async fn lock_subsidy(&mut self, id: SubsidyId) -> Result<Option<Subsidy>, StoreError> {
        Ok(self.staged.subsidies.get(&id).cloned())
    }

    async fn insert_subsidy(&mut self, subsidy: &Subsidy) -> Result<(), StoreError> {
        if self.staged.subsidies.contains_key(&subsidy.id) {
            return Err(StoreError::Conflict(format!("subsidy {} already exists", subsidy.id)));
        }
        let duplicate_active = subsidy.is_active()
            && self
                .staged
                .subsidies
                .values()
                .any(|s| s.customer_id == subsidy.customer_id && s.is_active());
        if duplicate_active {
            return Err(StoreError::Conflict(format!(
                "customer {} already has an active subsidy",
                subsidy.customer_id
            )));
        }
        self.staged.subsidies.insert(subsidy.id, subsidy.clone());
        Ok(())
    }

    async fn update_subsidy(&mut self, subsidy: &Subsidy) -> Result<(), StoreError> {
        match self.staged.subsidies.get_mut(&subsidy.id) {
            Some(row) => {
                *row = subsidy.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("subsidy {} does not exist", subsidy.id))),
        }
    }

    async fn insert_usage(&mut self, usage: &UsageTransaction) -> Result<(), StoreError> {
        if !self.staged.subsidies.contains_key(&usage.subsidy_id) {
            return Err(StoreError::Backend(format!(
                "usage references unknown subsidy {}",
                usage.subsidy_id
            )));
        }
        self.staged.usage.push(usage.clone());
        Ok(())
    }

    async fn find_usage(&mut self, id: UsageTransactionId) -> Result<Option<UsageTransaction>, StoreError> {
        Ok(self.staged.usage.iter().find(|u| u.id == id).cloned())
    }

    async fn append_audit(&mut self, entry: &AuditLogEntry) -> Result<(), StoreError> {
        if Faults::take(&self.faults.failing_audits) {
            return Err(StoreError::Backend("audit write failed (injected)".to_string()));
        }
        self.staged.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if Faults::take(&self.faults.failing_commits) {
            return Err(StoreError::Transient(
                "could not serialize access due to concurrent update (injected)".to_string(),
            ));
        }
        *self.guard = std::mem::take(&mut self.staged);
        if Faults::take(&self.faults.lost_commit_acks) {
            return Err(StoreError::Transient("connection lost after commit (injected)".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Tx = InMemoryLedgerTx;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(InMemoryLedgerTx {
            guard,
            staged,
            faults: self.faults.clone(),
        })
    }

    async fn find_subsidy(&self, id: SubsidyId) -> Result<Option<SubsidyView>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.subsidies.get(&id).map(|s| state.view(s)))
    }

    async fn find_active_for_customer(
        &self,
        customer_id: CustomerId,
    ) -> Result<Option<SubsidyView>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .subsidies
            .values()
            .find(|s| s.customer_id == customer_id && s.is_active())
            .map(|s| state.view(s)))
    }

    async fn list_subsidies(
        &self,
        filter: &SubsidyFilter,
        page: PageRequest,
    ) -> Result<Page<SubsidyView>, StoreError> {
        let state = self.state.lock().await;
        let mut matching: Vec<&Subsidy> = state
            .subsidies
            .values()
            .filter(|s| filter.customer_id.is_none_or(|c| s.customer_id == c))
            .filter(|s| filter.provider_id.is_none_or(|p| s.provider_id == p))
            .filter(|s| filter.status.is_none_or(|st| s.status == st))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .map(|s| state.view(s))
            .collect();
        Ok(Page::new(items, total, page))
    }

    async fn usage_for_subsidy(&self, id: SubsidyId) -> Result<Vec<UsageTransaction>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<UsageTransaction> =
            state.usage.iter().filter(|u| u.subsidy_id == id).cloned().collect();
        rows.sort_by(|a, b| a.applied_at.cmp(&b.applied_at).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn usage_for_customer(
        &self,
        customer_id: CustomerId,
        page: PageRequest,
    ) -> Result<Page<UsageTransaction>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<&UsageTransaction> =
            state.usage.iter().filter(|u| u.customer_id == customer_id).collect();
        rows.sort_by(|a, b| b.applied_at.cmp(&a.applied_at).then(b.id.cmp(&a.id)));

        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, page))
    }

    async fn audit_for_subsidy(&self, id: SubsidyId) -> Result<Vec<AuditLogEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .filter(|e| e.subsidy_id == Some(id))
            .cloned()
            .collect())
    }

    async fn summary(&self) -> Result<SubsidySummary, StoreError> {
        let state = self.state.lock().await;
        let mut summary = SubsidySummary::default();
        let mut approved = 0i64;
        let mut used = 0i64;
        for s in state.subsidies.values() {
            match s.status {
                SubsidyStatus::Active => summary.active_count += 1,
                SubsidyStatus::Depleted => summary.depleted_count += 1,
                SubsidyStatus::Expired => summary.expired_count += 1,
            }
            approved += s.approved_amount.cents();
            used += s.total_amount_used.cents();
        }
        summary.total_approved = Money::from_cents(approved);
        summary.total_used = Money::from_cents(used);
        summary.total_remaining = Money::from_cents(approved - used);
        Ok(summary)
    }

    async fn find_overdue(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<SubsidyId>, StoreError> {
        let state = self.state.lock().await;
        let mut overdue: Vec<&Subsidy> = state.subsidies.values().filter(|s| s.is_overdue(now)).collect();
        overdue.sort_by_key(|s| (s.valid_until, s.id));
        Ok(overdue.into_iter().take(limit as usize).map(|s| s.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantledger_core::StaffId;
    use grantledger_subsidy::CreateSubsidy;

    fn subsidy(customer_id: CustomerId, provider_id: ProviderId) -> Subsidy {
        let cmd = CreateSubsidy {
            customer_id,
            provider_id,
            approved_amount: Money::from_major(100),
            reason: "grant".to_string(),
            valid_until: None,
            admin_notes: None,
        };
        Subsidy::approve(SubsidyId::new(), &cmd, StaffId::new(), Utc::now())
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = InMemoryLedgerStore::new();
        let s = subsidy(CustomerId::new(), ProviderId::new());

        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_subsidy(&s).await.unwrap();
        }

        assert!(store.find_subsidy(s.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn committed_writes_become_visible() {
        let store = InMemoryLedgerStore::new();
        let provider = Provider::new(ProviderId::new(), "Acme Fund");
        store.insert_provider(provider.clone()).await;
        let s = subsidy(CustomerId::new(), provider.id);

        let mut tx = store.begin().await.unwrap();
        tx.insert_subsidy(&s).await.unwrap();
        tx.commit().await.unwrap();

        let view = store.find_subsidy(s.id).await.unwrap().unwrap();
        assert_eq!(view.provider_name, "Acme Fund");
    }

    #[tokio::test]
    async fn second_active_subsidy_for_customer_is_rejected() {
        let store = InMemoryLedgerStore::new();
        let customer = CustomerId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_subsidy(&subsidy(customer, ProviderId::new())).await.unwrap();
        let err = tx.insert_subsidy(&subsidy(customer, ProviderId::new())).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn injected_commit_failure_is_transient_and_discards_writes() {
        let store = InMemoryLedgerStore::new();
        store.fail_next_commits(1);
        let s = subsidy(CustomerId::new(), ProviderId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_subsidy(&s).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_transient());
        assert!(store.find_subsidy(s.id).await.unwrap().is_none());

        let mut tx = store.begin().await.unwrap();
        tx.insert_subsidy(&s).await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.find_subsidy(s.id).await.unwrap().is_some());
    }
}
