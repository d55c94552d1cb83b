use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use grantledger_core::CustomerId;
use grantledger_fraud::{FraudAlert, FraudHeuristics};
use grantledger_observability::{MetricsSink, NoopMetrics};
use grantledger_subsidy::{LedgerEvent, SubsidyCreated, UsageRecorded};

use super::LedgerEnvelope;
use crate::collaborators::{
    AlertChannel, CustomerContact, CustomerDirectory, EmptyCustomerDirectory, NoopPaymentMirror,
    NotificationKind, NotificationMessage, Notifier, PaymentMirror, PaymentMirrorRecord,
    SideEffectError, TracingAlertChannel, TracingNotifier,
};
use crate::retry::RetryPolicy;

/// Fans committed ledger events out to fraud checks, notifications and the
/// payment mirror.
///
/// Every delivery gets its own bounded retry. A failure in one collaborator
/// is logged, counted as `side_effect.failed` and never stops the others.
pub struct SideEffectDispatcher {
    heuristics: FraudHeuristics,
    alerts: Arc<dyn AlertChannel>,
    notifier: Arc<dyn Notifier>,
    directory: Arc<dyn CustomerDirectory>,
    mirror: Arc<dyn PaymentMirror>,
    metrics: Arc<dyn MetricsSink>,
    retry: RetryPolicy,
}

impl Default for SideEffectDispatcher {
    fn default() -> Self {
        Self::new(FraudHeuristics::default())
    }
}

impl SideEffectDispatcher {
    /// Dispatcher that only logs: tracing alert channel and notifier, no
    /// known customers, no mirror.
    pub fn new(heuristics: FraudHeuristics) -> Self {
        Self {
            heuristics,
            alerts: Arc::new(TracingAlertChannel),
            notifier: Arc::new(TracingNotifier),
            directory: Arc::new(EmptyCustomerDirectory),
            mirror: Arc::new(NoopPaymentMirror),
            metrics: Arc::new(NoopMetrics),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_alert_channel(mut self, alerts: Arc<dyn AlertChannel>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_customer_directory(mut self, directory: Arc<dyn CustomerDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn with_payment_mirror(mut self, mirror: Arc<dyn PaymentMirror>) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run every side effect for one envelope. Never fails.
    pub async fn dispatch(&self, envelope: &LedgerEnvelope) {
        let event = envelope.payload();
        debug!(
            event_id = %envelope.event_id(),
            event_type = envelope.event_type(),
            subsidy_id = %event.subsidy_id(),
            "dispatching side effects"
        );

        for alert in self.heuristics.evaluate(event) {
            self.raise(alert).await;
        }

        match event {
            LedgerEvent::SubsidyCreated(created) => self.on_created(created).await,
            LedgerEvent::UsageRecorded(recorded) => self.on_usage(recorded).await,
            LedgerEvent::SubsidyDeactivated(_) | LedgerEvent::SubsidyExpired(_) => {}
        }
    }

    /// Consume envelopes until the channel closes.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<LedgerEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            self.dispatch(&envelope).await;
        }
    }

    /// Run on a detached task. Shutting down drains what is already queued.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LedgerEnvelope>) -> DispatcherHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    next = rx.recv() => match next {
                        Some(envelope) => self.dispatch(&envelope).await,
                        None => return,
                    },
                }
            }

            rx.close();
            while let Ok(envelope) = rx.try_recv() {
                self.dispatch(&envelope).await;
            }
        });

        DispatcherHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }

    async fn raise(&self, alert: FraudAlert) {
        self.metrics.incr(
            "fraud.alert",
            &[("kind", alert.kind.as_str()), ("severity", alert.severity.as_str())],
        );
        info!(
            kind = alert.kind.as_str(),
            severity = alert.severity.as_str(),
            subsidy_id = %alert.subsidy_id,
            "fraud alert raised"
        );
        self.deliver("fraud_alert", || self.alerts.deliver(&alert)).await;
    }

    async fn on_created(&self, created: &SubsidyCreated) {
        let Some(contact) = self.contact(created.customer_id).await else {
            return;
        };

        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), created.approved_amount.to_string());
        data.insert("provider_name".to_string(), created.provider_name.clone());
        if let Some(until) = created.valid_until {
            data.insert("valid_until".to_string(), until.format("%Y-%m-%d").to_string());
        }

        self.notify(&contact, NotificationKind::SubsidyApproved, data).await;
    }

    async fn on_usage(&self, recorded: &UsageRecorded) {
        let usage = &recorded.usage;
        let contact = self.contact(usage.customer_id).await;

        if let Some(contact) = &contact {
            if recorded.depleted {
                let mut data = BTreeMap::new();
                data.insert("total_used".to_string(), recorded.total_amount_used.to_string());
                self.notify(contact, NotificationKind::SubsidyDepleted, data).await;
            } else if usage.subsidy_applied.is_positive() {
                let mut data = BTreeMap::new();
                data.insert("amount_used".to_string(), usage.subsidy_applied.to_string());
                data.insert("remaining_balance".to_string(), recorded.remaining_balance.to_string());
                data.insert("transaction_type".to_string(), usage.transaction_type.clone());
                self.notify(contact, NotificationKind::SubsidyUsed, data).await;
            }
        }

        let record = PaymentMirrorRecord {
            customer_id: usage.customer_id,
            customer_email: contact.as_ref().map(|c| c.email.clone()),
            customer_name: contact.as_ref().and_then(|c| c.display_name.clone()),
            subsidy_id: usage.subsidy_id,
            transaction_type: usage.transaction_type.clone(),
            transaction_date: usage.applied_at,
            original_amount: usage.original_amount,
            subsidy_amount: usage.subsidy_applied,
            customer_paid: usage.customer_paid,
            plan_id: usage.external_refs.plan_id.clone(),
            subscription_id: usage.external_refs.subscription_id.clone(),
            invoice_id: usage.external_refs.invoice_id.clone(),
            payment_intent_id: usage.external_refs.payment_intent_id.clone(),
            description: usage.description.clone(),
            payment_status: "completed".to_string(),
            currency: "USD".to_string(),
        };
        self.deliver("payment_mirror", || self.mirror.record(record.clone())).await;
    }

    async fn contact(&self, customer_id: CustomerId) -> Option<CustomerContact> {
        match self.directory.lookup(customer_id).await {
            Ok(Some(contact)) => Some(contact),
            Ok(None) => {
                debug!(customer_id = %customer_id, "no contact on file, skipping notification");
                None
            }
            Err(err) => {
                warn!(customer_id = %customer_id, error = %err, "customer lookup failed");
                self.metrics.incr("side_effect.failed", &[("effect", "customer_lookup")]);
                None
            }
        }
    }

    async fn notify(&self, contact: &CustomerContact, kind: NotificationKind, data: BTreeMap<String, String>) {
        let message = NotificationMessage {
            recipient: contact.email.clone(),
            recipient_name: contact.name_or_default().to_string(),
            kind,
            data,
        };
        self.deliver("notification", || self.notifier.send(message.clone())).await;
    }

    /// Bounded retry for one delivery. Returns whether it eventually succeeded.
    async fn deliver<F, Fut>(&self, effect: &'static str, mut op: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), SideEffectError>>,
    {
        let seed = Uuid::now_v7().as_u64_pair().1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(()) => return true,
                Err(err) if self.retry.should_retry(attempt) => {
                    debug!(effect, attempt, error = %err, "side effect failed, retrying");
                    tokio::time::sleep(self.retry.delay_with_seed(attempt, seed)).await;
                }
                Err(err) => {
                    warn!(effect, attempts = attempt, error = %err, "side effect dropped");
                    self.metrics.incr("side_effect.failed", &[("effect", effect)]);
                    return false;
                }
            }
        }
    }
}

/// Handle to stop a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop accepting new work, finish what is queued, and wait.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.join.await {
            warn!(error = %err, "side-effect dispatcher task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use grantledger_core::{Money, ProviderId, StaffId, SubsidyId, UsageTransactionId};
    use grantledger_observability::InMemoryMetrics;
    use grantledger_subsidy::{ExternalRefs, RecordUsage, UsageTransaction};

    use super::*;
    use crate::collaborators::{
        InMemoryAlertChannel, InMemoryCustomerDirectory, InMemoryNotifier, InMemoryPaymentMirror,
    };

    struct Harness {
        dispatcher: SideEffectDispatcher,
        alerts: Arc<InMemoryAlertChannel>,
        notifier: Arc<InMemoryNotifier>,
        mirror: Arc<InMemoryPaymentMirror>,
        metrics: Arc<InMemoryMetrics>,
        customer: CustomerId,
    }

    fn harness(retry: RetryPolicy) -> Harness {
        let alerts = Arc::new(InMemoryAlertChannel::new());
        let notifier = Arc::new(InMemoryNotifier::new());
        let mirror = Arc::new(InMemoryPaymentMirror::new());
        let directory = Arc::new(InMemoryCustomerDirectory::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let customer = CustomerId::new();
        directory.insert(customer, "pat@example.com", Some("Pat"));

        let dispatcher = SideEffectDispatcher::default()
            .with_alert_channel(alerts.clone())
            .with_notifier(notifier.clone())
            .with_customer_directory(directory)
            .with_payment_mirror(mirror.clone())
            .with_metrics(metrics.clone())
            .with_retry_policy(retry);

        Harness {
            dispatcher,
            alerts,
            notifier,
            mirror,
            metrics,
            customer,
        }
    }

    fn usage_event(customer: CustomerId, applied_cents: i64, depleted: bool) -> LedgerEnvelope {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        let cmd = RecordUsage {
            subsidy_id: SubsidyId::new(),
            customer_id: customer,
            transaction_type: "subscription".into(),
            original_amount: Money::from_cents(applied_cents),
            subsidy_applied: Money::from_cents(applied_cents),
            customer_paid: Money::ZERO,
            external_refs: ExternalRefs {
                plan_id: Some("plan_basic".into()),
                ..ExternalRefs::default()
            },
            description: None,
        };
        let usage = UsageTransaction::from_command(
            UsageTransactionId::new(),
            &cmd,
            created_at + chrono::Duration::hours(2),
        );
        LedgerEvent::UsageRecorded(UsageRecorded {
            usage,
            remaining_balance: if depleted { Money::ZERO } else { Money::from_cents(1_000) },
            total_amount_used: Money::from_cents(applied_cents),
            depleted,
            subsidy_created_at: created_at,
        })
        .into_envelope()
    }

    #[tokio::test]
    async fn depleting_usage_fans_out_to_every_collaborator() {
        let h = harness(RetryPolicy::no_retry());

        h.dispatcher.dispatch(&usage_event(h.customer, 15_000, true)).await;

        let kinds: Vec<_> = h.alerts.all().iter().map(|a| a.kind.as_str()).collect();
        assert_eq!(kinds, vec!["rapid_depletion"]);

        let sent = h.notifier.all();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, NotificationKind::SubsidyDepleted);
        assert_eq!(sent[0].recipient, "pat@example.com");

        let mirrored = h.mirror.all();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].plan_id.as_deref(), Some("plan_basic"));
        assert_eq!(mirrored[0].payment_status, "completed");
        assert_eq!(h.metrics.count("fraud.alert"), 1);
    }

    #[tokio::test]
    async fn a_failing_notifier_does_not_stop_the_mirror() {
        let h = harness(RetryPolicy::no_retry());
        h.notifier.fail_next(1);

        h.dispatcher.dispatch(&usage_event(h.customer, 2_000, false)).await;

        assert!(h.notifier.all().is_empty());
        assert_eq!(h.mirror.all().len(), 1);
        assert_eq!(h.metrics.count_with("side_effect.failed", &[("effect", "notification")]), 1);
    }

    #[tokio::test]
    async fn deliveries_are_retried_within_the_policy() {
        let h = harness(RetryPolicy::fixed(3, Duration::ZERO));
        h.mirror.fail_next(2);

        h.dispatcher.dispatch(&usage_event(h.customer, 2_000, false)).await;

        assert_eq!(h.mirror.all().len(), 1);
        assert_eq!(h.metrics.count("side_effect.failed"), 0);
    }

    #[tokio::test]
    async fn unknown_customer_gets_no_notification_but_is_still_mirrored() {
        let h = harness(RetryPolicy::no_retry());

        h.dispatcher.dispatch(&usage_event(CustomerId::new(), 2_000, false)).await;

        assert!(h.notifier.all().is_empty());
        let mirrored = h.mirror.all();
        assert_eq!(mirrored.len(), 1);
        assert!(mirrored[0].customer_email.is_none());
    }

    #[tokio::test]
    async fn spawned_dispatcher_drains_queue_on_shutdown() {
        let h = harness(RetryPolicy::no_retry());
        let mirror = h.mirror.clone();
        let customer = h.customer;
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = Arc::new(h.dispatcher).spawn(rx);
        tx.send(usage_event(customer, 100, false)).unwrap();
        tx.send(usage_event(customer, 200, false)).unwrap();
        handle.shutdown().await;

        assert_eq!(mirror.all().len(), 2);
    }

    #[tokio::test]
    async fn high_value_creation_alerts_and_notifies() {
        let h = harness(RetryPolicy::no_retry());
        let envelope = LedgerEvent::SubsidyCreated(SubsidyCreated {
            subsidy_id: SubsidyId::new(),
            customer_id: h.customer,
            provider_id: ProviderId::new(),
            provider_name: "City Fund".into(),
            approved_amount: Money::from_major(12_000),
            valid_until: None,
            approved_by: StaffId::new(),
            ip_address: Some("10.0.0.7".into()),
            occurred_at: Utc::now(),
        })
        .into_envelope();

        h.dispatcher.dispatch(&envelope).await;

        let alerts = h.alerts.all();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind.as_str(), "high_value_subsidy");
        let sent = h.notifier.all();
        assert_eq!(sent[0].kind, NotificationKind::SubsidyApproved);
        assert_eq!(sent[0].data.get("provider_name").map(String::as_str), Some("City Fund"));
    }
}
