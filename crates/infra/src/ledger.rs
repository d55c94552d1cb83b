//! The subsidy ledger service.
//!
//! Every mutating operation runs as one serializable store transaction that
//! re-reads and locks the rows it decides on. Transient store failures re-run
//! the whole transaction under `RetryPolicy`. Side effects are enqueued on the
//! outbox only after commit.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use grantledger_core::{Clock, CustomerId, Money, SubsidyId, SystemClock, UsageTransactionId};
use grantledger_observability::{MetricsSink, NoopMetrics};
use grantledger_subsidy::{
    Actor, AuditLogEntry, ChargeQuote, CreateSubsidy, CustomerBalance, LedgerEvent, LedgerPolicy,
    RecordUsage, RemainingBalance, Subsidy, SubsidyCreated, SubsidyDeactivated, SubsidyExpired,
    SubsidyStatus, SubsidyView, UsageRecorded, UsageTransaction, calculate_subsidy_amount,
};

use crate::error::{ErrorKind, LedgerError};
use crate::outbox::Outbox;
use crate::retry::RetryPolicy;
use crate::store::{LedgerStore, LedgerTx, Page, PageRequest, SubsidyFilter, SubsidySummary};

/// A subsidy together with its full history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsidyDetail {
    pub view: SubsidyView,
    /// Oldest first.
    pub usage: Vec<UsageTransaction>,
    /// Oldest first.
    pub audit: Vec<AuditLogEntry>,
}

/// Outcome of one expiration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationReport {
    /// Candidates returned by the overdue query.
    pub scanned: usize,
    pub expired: usize,
    /// No longer overdue when re-read under lock.
    pub skipped: usize,
    pub failed: usize,
}

pub struct SubsidyLedger<S: LedgerStore, O: Outbox> {
    store: S,
    outbox: Arc<O>,
    clock: Arc<dyn Clock>,
    policy: LedgerPolicy,
    retry: RetryPolicy,
    metrics: Arc<dyn MetricsSink>,
}

impl<S: LedgerStore, O: Outbox> SubsidyLedger<S, O> {
    pub fn new(store: S, outbox: Arc<O>) -> Self {
        Self {
            store,
            outbox,
            clock: Arc::new(SystemClock),
            policy: LedgerPolicy::default(),
            retry: RetryPolicy::default(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: LedgerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn outbox(&self) -> &Arc<O> {
        &self.outbox
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    // ---------------------------------------------------------------------
    // Mutations
    // ---------------------------------------------------------------------

    /// Approve a new active subsidy for a customer that has none.
    #[instrument(
        skip_all,
        fields(customer_id = %cmd.customer_id, provider_id = %cmd.provider_id, staff_id = %actor.staff_id)
    )]
    pub async fn create_subsidy(&self, cmd: CreateSubsidy, actor: &Actor) -> Result<Subsidy, LedgerError> {
        const OP: &str = "create_subsidy";

        let now = self.clock.now();
        self.policy
            .validate_create(&cmd, now)
            .map_err(|e| self.rejected(OP, e.into()))?;

        let (subsidy, provider_name) = self.with_retry(OP, || self.try_create(&cmd, actor)).await?;

        info!(
            subsidy_id = %subsidy.id,
            amount = %subsidy.approved_amount,
            "subsidy created"
        );
        self.metrics.incr("subsidy.created", &[]);
        self.publish(LedgerEvent::SubsidyCreated(SubsidyCreated {
            subsidy_id: subsidy.id,
            customer_id: subsidy.customer_id,
            provider_id: subsidy.provider_id,
            provider_name,
            approved_amount: subsidy.approved_amount,
            valid_until: subsidy.valid_until,
            approved_by: actor.staff_id,
            ip_address: actor.ip_address.clone(),
            occurred_at: subsidy.created_at,
        }));

        Ok(subsidy)
    }

    /// Administratively revoke an active subsidy (`Active -> Expired`).
    #[instrument(skip_all, fields(subsidy_id = %subsidy_id, staff_id = %actor.staff_id))]
    pub async fn deactivate_subsidy(
        &self,
        subsidy_id: SubsidyId,
        actor: &Actor,
        reason: &str,
    ) -> Result<(), LedgerError> {
        const OP: &str = "deactivate_subsidy";

        self.policy
            .validate_reason(reason, "deactivation")
            .map_err(|e| self.rejected(OP, e.into()))?;
        let reason = reason.trim();

        let event = self
            .with_retry(OP, || self.try_deactivate(subsidy_id, actor, reason))
            .await?;

        info!(
            remaining = %event.remaining_balance,
            previous_status = %event.previous_status,
            "subsidy deactivated"
        );
        self.metrics.incr("subsidy.deactivated", &[]);
        self.publish(LedgerEvent::SubsidyDeactivated(event));
        Ok(())
    }

    /// Consume part of a subsidy's balance for one charge.
    #[instrument(
        skip_all,
        fields(subsidy_id = %cmd.subsidy_id, customer_id = %cmd.customer_id, applied = %cmd.subsidy_applied)
    )]
    pub async fn record_usage(&self, cmd: RecordUsage) -> Result<UsageTransaction, LedgerError> {
        const OP: &str = "record_usage";

        cmd.validate().map_err(|e| self.rejected(OP, e.into()))?;

        // One id for every attempt, so a retry after an unacknowledged commit
        // finds the row instead of charging twice.
        let usage_id = UsageTransactionId::new();
        let recorded = self
            .with_retry(OP, || self.try_record_usage(&cmd, usage_id))
            .await?;

        info!(
            usage_id = %recorded.usage.id,
            remaining = %recorded.remaining_balance,
            depleted = recorded.depleted,
            "usage recorded"
        );
        self.metrics.incr(
            "subsidy.usage_recorded",
            &[("transaction_type", recorded.usage.transaction_type.as_str())],
        );
        if recorded.depleted {
            self.metrics.incr("subsidy.depleted", &[]);
        }

        let usage = recorded.usage.clone();
        self.publish(LedgerEvent::UsageRecorded(recorded));
        Ok(usage)
    }

    /// Expire up to `limit` active subsidies whose `valid_until` has passed.
    ///
    /// Each subsidy gets its own transaction; one failure does not stop the
    /// sweep.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, limit: u32) -> Result<ExpirationReport, LedgerError> {
        const OP: &str = "expire_subsidy";

        let now = self.clock.now();
        let candidates = self.store.find_overdue(now, limit).await?;

        let mut report = ExpirationReport {
            scanned: candidates.len(),
            ..ExpirationReport::default()
        };

        for subsidy_id in candidates {
            match self.with_retry(OP, || self.try_expire(subsidy_id, now)).await {
                Ok(Some(event)) => {
                    report.expired += 1;
                    info!(subsidy_id = %subsidy_id, remaining = %event.remaining_balance, "subsidy expired");
                    self.metrics.incr("subsidy.expired", &[]);
                    self.publish(LedgerEvent::SubsidyExpired(event));
                }
                Ok(None) => {
                    report.skipped += 1;
                    debug!(subsidy_id = %subsidy_id, "subsidy no longer overdue, skipped");
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(subsidy_id = %subsidy_id, error = %err, "failed to expire subsidy");
                }
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                "expiration sweep finished"
            );
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn customer_balance(&self, customer_id: CustomerId) -> Result<CustomerBalance, LedgerError> {
        let balance = match self.store.find_active_for_customer(customer_id).await? {
            Some(view) => CustomerBalance {
                has_active_subsidy: true,
                remaining_balance: view.subsidy.remaining_balance(),
                valid_until: view.subsidy.valid_until,
                provider_name: Some(view.provider_name),
            },
            None => CustomerBalance::none(),
        };
        Ok(balance)
    }

    pub async fn active_subsidy(&self, customer_id: CustomerId) -> Result<Option<SubsidyView>, LedgerError> {
        Ok(self.store.find_active_for_customer(customer_id).await?)
    }

    /// How much of `charge` the customer's active subsidy would cover right now.
    ///
    /// Advisory only: the amount is re-checked under lock by `record_usage`.
    pub async fn quote_charge(&self, customer_id: CustomerId, charge: Money) -> Result<ChargeQuote, LedgerError> {
        let active = self.store.find_active_for_customer(customer_id).await?;
        let applied = calculate_subsidy_amount(
            active.as_ref().map(|v| &v.subsidy as &dyn RemainingBalance),
            charge,
        );
        Ok(ChargeQuote::new(active.map(|v| v.subsidy.id), charge, applied))
    }

    pub async fn subsidy_detail(&self, subsidy_id: SubsidyId) -> Result<SubsidyDetail, LedgerError> {
        let view = self
            .store
            .find_subsidy(subsidy_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("subsidy".to_string()))?;
        let usage = self.store.usage_for_subsidy(subsidy_id).await?;
        let audit = self.store.audit_for_subsidy(subsidy_id).await?;
        Ok(SubsidyDetail { view, usage, audit })
    }

    pub async fn list_subsidies(
        &self,
        filter: &SubsidyFilter,
        page: PageRequest,
    ) -> Result<Page<SubsidyView>, LedgerError> {
        Ok(self.store.list_subsidies(filter, page).await?)
    }

    pub async fn customer_usage_history(
        &self,
        customer_id: CustomerId,
        page: PageRequest,
    ) -> Result<Page<UsageTransaction>, LedgerError> {
        Ok(self.store.usage_for_customer(customer_id, page).await?)
    }

    pub async fn summary(&self) -> Result<SubsidySummary, LedgerError> {
        Ok(self.store.summary().await?)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    async fn try_create(&self, cmd: &CreateSubsidy, actor: &Actor) -> Result<(Subsidy, String), LedgerError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let provider = tx
            .provider(cmd.provider_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("provider".to_string()))?;
        if !provider.is_active {
            return Err(LedgerError::Validation(format!(
                "provider {} is not active",
                provider.name
            )));
        }

        tx.lock_customer(cmd.customer_id).await?;
        if let Some(existing) = tx.find_open_subsidy_for_customer(cmd.customer_id).await? {
            return Err(LedgerError::Conflict(format!(
                "customer already has an active subsidy ({}) with {} remaining",
                existing.id,
                existing.remaining_balance()
            )));
        }

        let subsidy = Subsidy::approve(SubsidyId::new(), cmd, actor.staff_id, now);
        tx.insert_subsidy(&subsidy).await?;

        let entry = AuditLogEntry::created(
            subsidy.id,
            actor,
            subsidy.approved_amount,
            &provider.name,
            &subsidy.reason,
            now,
        );
        self.audit(&mut tx, entry).await;

        tx.commit().await?;
        Ok((subsidy, provider.name))
    }

    async fn try_deactivate(
        &self,
        subsidy_id: SubsidyId,
        actor: &Actor,
        reason: &str,
    ) -> Result<SubsidyDeactivated, LedgerError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut subsidy = tx
            .lock_subsidy(subsidy_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("subsidy".to_string()))?;
        let outcome = subsidy.deactivate(now)?;
        tx.update_subsidy(&subsidy).await?;

        let entry = AuditLogEntry::deactivated(
            subsidy.id,
            actor,
            outcome.previous_status,
            outcome.remaining_balance,
            reason,
            now,
        );
        self.audit(&mut tx, entry).await;

        tx.commit().await?;
        Ok(SubsidyDeactivated {
            subsidy_id: subsidy.id,
            customer_id: subsidy.customer_id,
            previous_status: outcome.previous_status,
            remaining_balance: outcome.remaining_balance,
            reason: reason.to_string(),
            deactivated_by: actor.staff_id,
            occurred_at: now,
        })
    }

    async fn try_record_usage(
        &self,
        cmd: &RecordUsage,
        usage_id: UsageTransactionId,
    ) -> Result<UsageRecorded, LedgerError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;

        let mut subsidy = tx
            .lock_subsidy(cmd.subsidy_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound("subsidy".to_string()))?;
        subsidy.ensure_owned_by(cmd.customer_id)?;

        if let Some(usage) = tx.find_usage(usage_id).await? {
            debug!(usage_id = %usage_id, "usage already committed by an earlier attempt");
            // Nothing else can touch a depleted subsidy, so an unchanged
            // `updated_at` means this usage was the one that depleted it.
            let depleted =
                subsidy.status == SubsidyStatus::Depleted && subsidy.updated_at == usage.applied_at;
            return Ok(UsageRecorded {
                usage,
                remaining_balance: subsidy.remaining_balance(),
                total_amount_used: subsidy.total_amount_used,
                depleted,
                subsidy_created_at: subsidy.created_at,
            });
        }

        let outcome = subsidy.apply_usage(cmd.subsidy_applied, now)?;

        let usage = UsageTransaction::from_command(usage_id, cmd, now);
        tx.insert_usage(&usage).await?;
        tx.update_subsidy(&subsidy).await?;

        if outcome.depleted {
            let entry = AuditLogEntry::depleted(subsidy.id, outcome.total_amount_used, now);
            self.audit(&mut tx, entry).await;
        }

        tx.commit().await?;
        Ok(UsageRecorded {
            usage,
            remaining_balance: outcome.remaining_balance,
            total_amount_used: outcome.total_amount_used,
            depleted: outcome.depleted,
            subsidy_created_at: subsidy.created_at,
        })
    }

    /// `Ok(None)` when the subsidy vanished or stopped being overdue.
    async fn try_expire(
        &self,
        subsidy_id: SubsidyId,
        now: DateTime<Utc>,
    ) -> Result<Option<SubsidyExpired>, LedgerError> {
        let mut tx = self.store.begin().await?;

        let Some(mut subsidy) = tx.lock_subsidy(subsidy_id).await? else {
            return Ok(None);
        };
        if !subsidy.is_overdue(now) {
            return Ok(None);
        }

        let remaining = subsidy.expire_overdue(now)?;
        tx.update_subsidy(&subsidy).await?;
        let entry = AuditLogEntry::auto_expired(subsidy.id, remaining, subsidy.valid_until, now);
        self.audit(&mut tx, entry).await;

        tx.commit().await?;
        Ok(Some(SubsidyExpired {
            subsidy_id: subsidy.id,
            customer_id: subsidy.customer_id,
            remaining_balance: remaining,
            valid_until: subsidy.valid_until,
            occurred_at: now,
        }))
    }

    // ---------------------------------------------------------------------
    // Plumbing
    // ---------------------------------------------------------------------

    /// Audit rows are best-effort: a failed append is logged and the
    /// surrounding change still commits.
    async fn audit(&self, tx: &mut S::Tx, entry: AuditLogEntry) {
        if let Err(err) = tx.append_audit(&entry).await {
            warn!(
                action = entry.action.as_str(),
                subsidy_id = ?entry.subsidy_id,
                error = %err,
                "failed to write audit log entry"
            );
        }
    }

    fn publish(&self, event: LedgerEvent) {
        self.outbox.enqueue(event.into_envelope());
    }

    /// Re-run `attempt` while it fails transiently and the policy allows.
    async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T, LedgerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LedgerError>>,
    {
        // Per-call seed so callers that hit the same conflict back off apart.
        let seed = Uuid::now_v7().as_u64_pair().1;
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && self.retry.should_retry(attempts) => {
                    self.metrics.incr("ledger.transient_retry", &[("operation", operation)]);
                    warn!(operation, attempt = attempts, error = %err, "transient failure, retrying");
                    tokio::time::sleep(self.retry.delay_with_seed(attempts, seed)).await;
                }
                Err(err) => return Err(self.rejected(operation, err)),
            }
        }
    }

    fn rejected(&self, operation: &'static str, err: LedgerError) -> LedgerError {
        let kind = err.kind();
        self.metrics.incr(
            "ledger.rejected",
            &[("operation", operation), ("kind", kind.as_str())],
        );
        match kind {
            ErrorKind::Internal => error!(operation, error = %err, "ledger operation failed"),
            ErrorKind::Forbidden | ErrorKind::Transient => {
                warn!(operation, error = %err, "ledger operation rejected")
            }
            _ => debug!(operation, error = %err, "ledger operation rejected"),
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeZone;
    use grantledger_core::{FixedClock, ProviderId, StaffId};
    use grantledger_observability::InMemoryMetrics;
    use grantledger_subsidy::{ExternalRefs, Provider, SubsidyStatus};

    use super::*;
    use crate::outbox::InMemoryOutbox;
    use crate::store::InMemoryLedgerStore;

    type Ledger = SubsidyLedger<InMemoryLedgerStore, InMemoryOutbox>;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
    }

    async fn ledger() -> (Ledger, ProviderId, Arc<InMemoryMetrics>) {
        let store = InMemoryLedgerStore::new();
        let provider = ProviderId::new();
        store.insert_provider(Provider::new(provider, "Community Fund")).await;
        let metrics = Arc::new(InMemoryMetrics::new());
        let ledger = SubsidyLedger::new(store, Arc::new(InMemoryOutbox::new()))
            .with_clock(Arc::new(FixedClock::new(now())))
            .with_retry_policy(RetryPolicy::fixed(3, Duration::ZERO))
            .with_metrics(metrics.clone());
        (ledger, provider, metrics)
    }

    fn create_cmd(customer: CustomerId, provider: ProviderId, dollars: i64) -> CreateSubsidy {
        CreateSubsidy {
            customer_id: customer,
            provider_id: provider,
            approved_amount: Money::from_major(dollars),
            reason: "hardship grant".into(),
            valid_until: None,
            admin_notes: None,
        }
    }

    fn usage_cmd(subsidy: &Subsidy, dollars: i64) -> RecordUsage {
        RecordUsage {
            subsidy_id: subsidy.id,
            customer_id: subsidy.customer_id,
            transaction_type: "subscription".into(),
            original_amount: Money::from_major(dollars),
            subsidy_applied: Money::from_major(dollars),
            customer_paid: Money::ZERO,
            external_refs: ExternalRefs::default(),
            description: None,
        }
    }

    fn staff() -> Actor {
        Actor::new(StaffId::new()).with_ip("192.0.2.10")
    }

    #[tokio::test]
    async fn unknown_provider_is_not_found() {
        let (ledger, _, _) = ledger().await;
        let err = ledger
            .create_subsidy(create_cmd(CustomerId::new(), ProviderId::new(), 100), &staff())
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::NotFound("provider".into()));
    }

    #[tokio::test]
    async fn inactive_provider_is_rejected() {
        let (ledger, _, _) = ledger().await;
        let provider = ProviderId::new();
        ledger
            .store()
            .insert_provider(Provider::new(provider, "Closed Fund").inactive())
            .await;

        let err = ledger
            .create_subsidy(create_cmd(CustomerId::new(), provider, 100), &staff())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn second_subsidy_for_customer_conflicts_with_details() {
        let (ledger, provider, metrics) = ledger().await;
        let customer = CustomerId::new();
        let first = ledger
            .create_subsidy(create_cmd(customer, provider, 100), &staff())
            .await
            .unwrap();

        let err = ledger
            .create_subsidy(create_cmd(customer, provider, 50), &staff())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::Conflict(format!(
                "customer already has an active subsidy ({}) with $100.00 remaining",
                first.id
            ))
        );
        assert_eq!(metrics.count_with("ledger.rejected", &[("kind", "conflict"), ("operation", "create_subsidy")]), 1);
    }

    #[tokio::test]
    async fn creation_validation_happens_before_the_transaction() {
        let (ledger, provider, _) = ledger().await;
        let mut cmd = create_cmd(CustomerId::new(), provider, 100);
        cmd.reason = "   ".into();
        let err = ledger.create_subsidy(cmd, &staff()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let mut cmd = create_cmd(CustomerId::new(), provider, 100);
        cmd.valid_until = Some(now());
        assert!(ledger.create_subsidy(cmd, &staff()).await.is_err());
        assert!(ledger.outbox().is_empty());
    }

    #[tokio::test]
    async fn usage_for_another_customer_is_forbidden() {
        let (ledger, provider, _) = ledger().await;
        let subsidy = ledger
            .create_subsidy(create_cmd(CustomerId::new(), provider, 100), &staff())
            .await
            .unwrap();

        let mut cmd = usage_cmd(&subsidy, 10);
        cmd.customer_id = CustomerId::new();
        let err = ledger.record_usage(cmd).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(ledger.store().usage_count().await, 0);
    }

    #[tokio::test]
    async fn usage_on_expired_subsidy_reports_status() {
        let (ledger, provider, _) = ledger().await;
        let subsidy = ledger
            .create_subsidy(create_cmd(CustomerId::new(), provider, 100), &staff())
            .await
            .unwrap();
        ledger
            .deactivate_subsidy(subsidy.id, &staff(), "customer left program")
            .await
            .unwrap();

        let err = ledger.record_usage(usage_cmd(&subsidy, 10)).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::State("subsidy is not active (status: expired)".into())
        );
    }

    #[tokio::test]
    async fn usage_on_missing_subsidy_is_not_found() {
        let (ledger, provider, _) = ledger().await;
        let subsidy = Subsidy::approve(
            SubsidyId::new(),
            &create_cmd(CustomerId::new(), provider, 100),
            StaffId::new(),
            now(),
        );
        let err = ledger.record_usage(usage_cmd(&subsidy, 10)).await.unwrap_err();
        assert_eq!(err, LedgerError::NotFound("subsidy".into()));
    }

    #[tokio::test]
    async fn deactivation_requires_a_reason() {
        let (ledger, provider, _) = ledger().await;
        let subsidy = ledger
            .create_subsidy(create_cmd(CustomerId::new(), provider, 100), &staff())
            .await
            .unwrap();
        let err = ledger.deactivate_subsidy(subsidy.id, &staff(), " ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let view = ledger.active_subsidy(subsidy.customer_id).await.unwrap().unwrap();
        assert_eq!(view.subsidy.status, SubsidyStatus::Active);
    }

    #[tokio::test]
    async fn quote_uses_remaining_balance() {
        let (ledger, provider, _) = ledger().await;
        let customer = CustomerId::new();
        let subsidy = ledger
            .create_subsidy(create_cmd(customer, provider, 100), &staff())
            .await
            .unwrap();
        ledger.record_usage(usage_cmd(&subsidy, 60)).await.unwrap();

        let quote = ledger.quote_charge(customer, Money::from_major(100)).await.unwrap();
        assert_eq!(quote.subsidy_id, Some(subsidy.id));
        assert_eq!(quote.subsidy_applied, Money::from_major(40));
        assert_eq!(quote.customer_pays, Money::from_major(60));

        let quote = ledger.quote_charge(CustomerId::new(), Money::from_major(100)).await.unwrap();
        assert_eq!(quote.subsidy_id, None);
        assert_eq!(quote.subsidy_applied, Money::ZERO);
    }

    #[tokio::test]
    async fn balance_without_subsidy_is_zero_value() {
        let (ledger, _, _) = ledger().await;
        let balance = ledger.customer_balance(CustomerId::new()).await.unwrap();
        assert_eq!(balance, CustomerBalance::none());
    }
}
