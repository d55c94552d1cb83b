use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use grantledger_core::{CustomerId, SubsidyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighValueSubsidy,
    LargeTransaction,
    RapidDepletion,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertKind::HighValueSubsidy => "high_value_subsidy",
            AlertKind::LargeTransaction => "large_transaction",
            AlertKind::RapidDepletion => "rapid_depletion",
        }
    }
}

/// A suspicious-activity signal for human review.
///
/// This is not a domain event and carries no authority over subsidy state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudAlert {
    pub severity: Severity,
    pub kind: AlertKind,
    pub subsidy_id: SubsidyId,
    pub customer_id: CustomerId,
    pub summary: String,
    /// Ordered key/value details for display.
    pub fields: BTreeMap<String, String>,
    pub raised_at: DateTime<Utc>,
}

impl FraudAlert {
    pub fn new(
        severity: Severity,
        kind: AlertKind,
        subsidy_id: SubsidyId,
        customer_id: CustomerId,
        summary: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            severity,
            kind,
            subsidy_id,
            customer_id,
            summary: summary.into(),
            fields: BTreeMap::new(),
            raised_at,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.fields.insert(key.into(), value.to_string());
        self
    }

    /// Title line used by chat-style alert channels.
    pub fn title(&self) -> String {
        format!("[{}] Subsidy fraud alert: {}", self.severity.as_str(), self.kind.as_str())
    }

    /// Slack-compatible incoming-webhook payload.
    pub fn to_webhook_payload(&self) -> JsonValue {
        let fields: Vec<JsonValue> = std::iter::once(("Subsidy ID".to_string(), self.subsidy_id.to_string()))
            .chain(std::iter::once(("Customer ID".to_string(), self.customer_id.to_string())))
            .chain(self.fields.iter().map(|(k, v)| (k.clone(), v.clone())))
            .map(|(title, value)| json!({ "title": title, "value": value, "short": true }))
            .collect();

        let color = match self.severity {
            Severity::High => "danger",
            Severity::Medium => "warning",
        };

        json!({
            "text": self.title(),
            "attachments": [{
                "color": color,
                "text": self.summary,
                "fields": fields,
                "ts": self.raised_at.timestamp(),
            }],
        })
    }
}
