use chrono::Duration;
use serde::{Deserialize, Serialize};

use grantledger_core::Money;

/// Tunable limits for the fraud heuristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudThresholds {
    /// Subsidies approved at or above this amount are flagged on creation.
    pub high_value: Money,
    /// Single usages applying at or above this amount are flagged.
    pub suspicious_usage: Money,
    /// Depletion within this many hours of creation is flagged.
    pub rapid_depletion_hours: i64,
}

impl Default for FraudThresholds {
    fn default() -> Self {
        Self {
            high_value: Money::from_major(10_000),
            suspicious_usage: Money::from_major(5_000),
            rapid_depletion_hours: 24,
        }
    }
}

impl FraudThresholds {
    pub fn rapid_depletion_window(&self) -> Duration {
        Duration::hours(self.rapid_depletion_hours)
    }
}
