//! Fire-and-forget collaborators fed by the side-effect dispatcher.
//!
//! None of these can influence a ledger outcome: they are only ever invoked
//! after commit, and every failure is logged and dropped by the caller.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use grantledger_core::{CustomerId, Money, SubsidyId};
use grantledger_fraud::{FraudAlert, Severity};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SideEffectError {
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("side effect rejected: {0}")]
    Rejected(String),
}

/// Recipient details for notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerContact {
    pub email: String,
    pub display_name: Option<String>,
}

impl CustomerContact {
    pub fn name_or_default(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or("Customer")
    }
}

/// Resolves customer ids to contact details.
#[async_trait]
pub trait CustomerDirectory: Send + Sync + 'static {
    async fn lookup(&self, customer_id: CustomerId) -> Result<Option<CustomerContact>, SideEffectError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    SubsidyApproved,
    SubsidyUsed,
    SubsidyDepleted,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::SubsidyApproved => "subsidy_approved",
            NotificationKind::SubsidyUsed => "subsidy_used",
            NotificationKind::SubsidyDepleted => "subsidy_depleted",
        }
    }
}

/// Template-agnostic notification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub recipient: String,
    pub recipient_name: String,
    pub kind: NotificationKind,
    /// Template variables.
    pub data: BTreeMap<String, String>,
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, message: NotificationMessage) -> Result<(), SideEffectError>;
}

/// Row written to the external payment-tracking ledger for every usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMirrorRecord {
    pub customer_id: CustomerId,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub subsidy_id: SubsidyId,
    pub transaction_type: String,
    pub transaction_date: DateTime<Utc>,
    pub original_amount: Money,
    pub subsidy_amount: Money,
    pub customer_paid: Money,
    pub plan_id: Option<String>,
    pub subscription_id: Option<String>,
    pub invoice_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub description: Option<String>,
    pub payment_status: String,
    pub currency: String,
}

#[async_trait]
pub trait PaymentMirror: Send + Sync + 'static {
    async fn record(&self, record: PaymentMirrorRecord) -> Result<(), SideEffectError>;
}

/// Destination for fraud alerts.
#[async_trait]
pub trait AlertChannel: Send + Sync + 'static {
    async fn deliver(&self, alert: &FraudAlert) -> Result<(), SideEffectError>;
}

/// Posts alerts to a Slack-compatible incoming webhook.
#[derive(Debug, Clone)]
pub struct SlackAlertChannel {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackAlertChannel {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self, SideEffectError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SideEffectError::Delivery(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl AlertChannel for SlackAlertChannel {
    async fn deliver(&self, alert: &FraudAlert) -> Result<(), SideEffectError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&alert.to_webhook_payload())
            .send()
            .await
            .map_err(|e| SideEffectError::Delivery(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SideEffectError::Delivery(format!("webhook returned {status}")));
        }
        Ok(())
    }
}

/// Logs alerts when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertChannel;

#[async_trait]
impl AlertChannel for TracingAlertChannel {
    async fn deliver(&self, alert: &FraudAlert) -> Result<(), SideEffectError> {
        let fields = serde_json::to_string(&alert.fields).unwrap_or_default();
        match alert.severity {
            Severity::High => warn!(
                severity = alert.severity.as_str(),
                kind = alert.kind.as_str(),
                subsidy_id = %alert.subsidy_id,
                customer_id = %alert.customer_id,
                fields = %fields,
                "fraud alert: {}",
                alert.summary
            ),
            Severity::Medium => info!(
                severity = alert.severity.as_str(),
                kind = alert.kind.as_str(),
                subsidy_id = %alert.subsidy_id,
                customer_id = %alert.customer_id,
                fields = %fields,
                "fraud alert: {}",
                alert.summary
            ),
        }
        Ok(())
    }
}

/// Logs notifications instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(&self, message: NotificationMessage) -> Result<(), SideEffectError> {
        info!(
            kind = message.kind.as_str(),
            recipient = %message.recipient,
            "notification queued"
        );
        Ok(())
    }
}

/// Directory that knows nobody; notifications are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyCustomerDirectory;

#[async_trait]
impl CustomerDirectory for EmptyCustomerDirectory {
    async fn lookup(&self, _customer_id: CustomerId) -> Result<Option<CustomerContact>, SideEffectError> {
        Ok(None)
    }
}

/// Discards mirror records.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPaymentMirror;

#[async_trait]
impl PaymentMirror for NoopPaymentMirror {
    async fn record(&self, _record: PaymentMirrorRecord) -> Result<(), SideEffectError> {
        Ok(())
    }
}

/// Failure injection shared by the in-memory collaborators.
#[derive(Debug, Default)]
struct FailNext(AtomicU32);

impl FailNext {
    fn set(&self, n: u32) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<(), SideEffectError> {
        let failed = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(SideEffectError::Delivery(format!("{what} unavailable (injected)")));
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// In-memory alert sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlertChannel {
    alerts: Mutex<Vec<FraudAlert>>,
    fail: FailNext,
}

impl InMemoryAlertChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail.set(n);
    }

    pub fn all(&self) -> Vec<FraudAlert> {
        lock(&self.alerts).clone()
    }
}

#[async_trait]
impl AlertChannel for InMemoryAlertChannel {
    async fn deliver(&self, alert: &FraudAlert) -> Result<(), SideEffectError> {
        self.fail.check("alert channel")?;
        lock(&self.alerts).push(alert.clone());
        Ok(())
    }
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    sent: Mutex<Vec<NotificationMessage>>,
    fail: FailNext,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail.set(n);
    }

    pub fn all(&self) -> Vec<NotificationMessage> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, message: NotificationMessage) -> Result<(), SideEffectError> {
        self.fail.check("notifier")?;
        lock(&self.sent).push(message);
        Ok(())
    }
}

/// In-memory payment mirror for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryPaymentMirror {
    records: Mutex<Vec<PaymentMirrorRecord>>,
    fail: FailNext,
}

impl InMemoryPaymentMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.fail.set(n);
    }

    pub fn all(&self) -> Vec<PaymentMirrorRecord> {
        lock(&self.records).clone()
    }
}

#[async_trait]
impl PaymentMirror for InMemoryPaymentMirror {
    async fn record(&self, record: PaymentMirrorRecord) -> Result<(), SideEffectError> {
        self.fail.check("payment mirror")?;
        lock(&self.records).push(record);
        Ok(())
    }
}

/// In-memory customer directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCustomerDirectory {
    contacts: Mutex<BTreeMap<CustomerId, CustomerContact>>,
}

impl InMemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, customer_id: CustomerId, email: impl Into<String>, name: Option<&str>) {
        lock(&self.contacts).insert(
            customer_id,
            CustomerContact {
                email: email.into(),
                display_name: name.map(str::to_string),
            },
        );
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryCustomerDirectory {
    async fn lookup(&self, customer_id: CustomerId) -> Result<Option<CustomerContact>, SideEffectError> {
        Ok(lock(&self.contacts).get(&customer_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantledger_fraud::AlertKind;

    fn alert() -> FraudAlert {
        FraudAlert::new(
            Severity::Medium,
            AlertKind::LargeTransaction,
            SubsidyId::new(),
            CustomerId::new(),
            "large",
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_one_at_a_time() {
        let channel = InMemoryAlertChannel::new();
        channel.fail_next(1);

        assert!(channel.deliver(&alert()).await.is_err());
        assert!(channel.deliver(&alert()).await.is_ok());
        assert_eq!(channel.all().len(), 1);
    }

    #[test]
    fn blank_display_name_falls_back() {
        let contact = CustomerContact {
            email: "a@example.com".into(),
            display_name: Some("  ".into()),
        };
        assert_eq!(contact.name_or_default(), "Customer");
    }

    #[tokio::test]
    async fn slack_channel_reports_unreachable_webhook() {
        let channel = SlackAlertChannel::new("http://127.0.0.1:9/hooks/test").unwrap();
        let err = channel.deliver(&alert()).await.unwrap_err();
        assert!(matches!(err, SideEffectError::Delivery(_)));
    }
}
