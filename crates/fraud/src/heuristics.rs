use grantledger_subsidy::{LedgerEvent, SubsidyCreated, UsageRecorded};

use crate::alert::{AlertKind, FraudAlert, Severity};
use crate::thresholds::FraudThresholds;

/// Deterministic rule set evaluated against committed ledger events.
///
/// Rules:
/// - creation at or above `high_value` -> HIGH `high_value_subsidy`
/// - single usage at or above `suspicious_usage` -> MEDIUM `large_transaction`
/// - depletion within `rapid_depletion_hours` of creation -> HIGH `rapid_depletion`
#[derive(Debug, Clone, Default)]
pub struct FraudHeuristics {
    thresholds: FraudThresholds,
}

impl FraudHeuristics {
    pub fn new(thresholds: FraudThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &FraudThresholds {
        &self.thresholds
    }

    pub fn evaluate(&self, event: &LedgerEvent) -> Vec<FraudAlert> {
        match event {
            LedgerEvent::SubsidyCreated(created) => self.on_created(created).into_iter().collect(),
            LedgerEvent::UsageRecorded(usage) => self.on_usage(usage),
            LedgerEvent::SubsidyDeactivated(_) | LedgerEvent::SubsidyExpired(_) => Vec::new(),
        }
    }

    fn on_created(&self, e: &SubsidyCreated) -> Option<FraudAlert> {
        if e.approved_amount < self.thresholds.high_value {
            return None;
        }

        let alert = FraudAlert::new(
            Severity::High,
            AlertKind::HighValueSubsidy,
            e.subsidy_id,
            e.customer_id,
            format!("High-value subsidy created: {}", e.approved_amount),
            e.occurred_at,
        )
        .with_field("Amount", e.approved_amount)
        .with_field("Threshold", self.thresholds.high_value)
        .with_field("Staff ID", e.approved_by)
        .with_field("IP Address", e.ip_address.as_deref().unwrap_or("unknown"));

        Some(alert)
    }

    fn on_usage(&self, e: &UsageRecorded) -> Vec<FraudAlert> {
        let mut alerts = Vec::new();
        let usage = &e.usage;

        if usage.subsidy_applied >= self.thresholds.suspicious_usage {
            alerts.push(
                FraudAlert::new(
                    Severity::Medium,
                    AlertKind::LargeTransaction,
                    usage.subsidy_id,
                    usage.customer_id,
                    format!("Large subsidy transaction: {}", usage.subsidy_applied),
                    usage.applied_at,
                )
                .with_field("Amount", usage.subsidy_applied)
                .with_field("Threshold", self.thresholds.suspicious_usage)
                .with_field("Remaining", e.remaining_balance),
            );
        }

        let time_to_deplete = usage.applied_at - e.subsidy_created_at;
        if e.depleted && time_to_deplete <= self.thresholds.rapid_depletion_window() {
            let hours = time_to_deplete.num_seconds() as f64 / 3600.0;
            alerts.push(
                FraudAlert::new(
                    Severity::High,
                    AlertKind::RapidDepletion,
                    usage.subsidy_id,
                    usage.customer_id,
                    format!(
                        "Subsidy depleted in {hours:.1} hours (threshold: {} hrs)",
                        self.thresholds.rapid_depletion_hours
                    ),
                    usage.applied_at,
                )
                .with_field("Hours", format!("{hours:.1}"))
                .with_field("Threshold", format!("{} hours", self.thresholds.rapid_depletion_hours))
                .with_field("Final Amount", usage.subsidy_applied)
                .with_field("Action", "Review customer subsidy usage patterns"),
            );
        }

        alerts
    }
}
