//! Process configuration read from environment variables.

use std::time::Duration;

use thiserror::Error;

use grantledger_core::Money;
use grantledger_fraud::FraudThresholds;
use grantledger_subsidy::LedgerPolicy;

use crate::expiration_runner::ExpirationRunner;
use crate::retry::RetryPolicy;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const SUBSIDY_MAX_AMOUNT_CENTS: &str = "SUBSIDY_MAX_AMOUNT_CENTS";
pub const FRAUD_HIGH_VALUE_CENTS: &str = "FRAUD_HIGH_VALUE_CENTS";
pub const FRAUD_SUSPICIOUS_USAGE_CENTS: &str = "FRAUD_SUSPICIOUS_USAGE_CENTS";
pub const FRAUD_RAPID_DEPLETION_HOURS: &str = "FRAUD_RAPID_DEPLETION_HOURS";
pub const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
pub const SUBSIDY_EXPIRATION_INTERVAL_SECS: &str = "SUBSIDY_EXPIRATION_INTERVAL_SECS";
pub const LEDGER_MAX_RETRIES: &str = "LEDGER_MAX_RETRIES";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} has invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the ledger process needs to start.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub policy: LedgerPolicy,
    pub fraud: FraudThresholds,
    /// `None` logs alerts instead of posting them.
    pub slack_webhook_url: Option<String>,
    pub expiration: ExpirationRunner,
    pub retry: RetryPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            policy: LedgerPolicy::default(),
            fraud: FraudThresholds::default(),
            slack_webhook_url: None,
            expiration: ExpirationRunner::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        cfg.database_url = get(DATABASE_URL);
        cfg.slack_webhook_url = get(SLACK_WEBHOOK_URL);

        if let Some(raw) = get(SUBSIDY_MAX_AMOUNT_CENTS) {
            cfg.policy.max_subsidy_amount = positive_cents(SUBSIDY_MAX_AMOUNT_CENTS, &raw)?;
        }
        if let Some(raw) = get(FRAUD_HIGH_VALUE_CENTS) {
            cfg.fraud.high_value = positive_cents(FRAUD_HIGH_VALUE_CENTS, &raw)?;
        }
        if let Some(raw) = get(FRAUD_SUSPICIOUS_USAGE_CENTS) {
            cfg.fraud.suspicious_usage = positive_cents(FRAUD_SUSPICIOUS_USAGE_CENTS, &raw)?;
        }
        if let Some(raw) = get(FRAUD_RAPID_DEPLETION_HOURS) {
            cfg.fraud.rapid_depletion_hours = i64::from(positive::<u32>(FRAUD_RAPID_DEPLETION_HOURS, &raw)?);
        }
        if let Some(raw) = get(SUBSIDY_EXPIRATION_INTERVAL_SECS) {
            let secs = positive::<u64>(SUBSIDY_EXPIRATION_INTERVAL_SECS, &raw)?;
            cfg.expiration.interval = Duration::from_secs(secs);
        }
        if let Some(raw) = get(LEDGER_MAX_RETRIES) {
            // Retries on top of the first attempt.
            let retries = parse::<u32>(LEDGER_MAX_RETRIES, &raw)?;
            cfg.retry.max_attempts = retries.saturating_add(1);
        }

        Ok(cfg)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr + PartialEq + Default,
    T::Err: std::fmt::Display,
{
    let value = parse::<T>(key, raw)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn positive_cents(key: &'static str, raw: &str) -> Result<Money, ConfigError> {
    let cents = parse::<i64>(key, raw)?;
    if cents <= 0 {
        return Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Money::from_cents(cents))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let cfg = AppConfig::from_lookup(|_| None).unwrap();
        assert!(cfg.database_url.is_none());
        assert!(cfg.slack_webhook_url.is_none());
        assert_eq!(cfg.policy, LedgerPolicy::default());
        assert_eq!(cfg.fraud, FraudThresholds::default());
        assert_eq!(cfg.expiration.interval, Duration::from_secs(1800));
        assert_eq!(cfg.retry.max_attempts, 3);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = AppConfig::from_lookup(lookup(&[
            (DATABASE_URL, "postgres://ledger@localhost/ledger"),
            (SUBSIDY_MAX_AMOUNT_CENTS, "5000000"),
            (FRAUD_HIGH_VALUE_CENTS, "250000"),
            (FRAUD_RAPID_DEPLETION_HOURS, "6"),
            (SUBSIDY_EXPIRATION_INTERVAL_SECS, "60"),
            (LEDGER_MAX_RETRIES, "0"),
            (SLACK_WEBHOOK_URL, "  "),
        ]))
        .unwrap();

        assert_eq!(cfg.database_url.as_deref(), Some("postgres://ledger@localhost/ledger"));
        assert_eq!(cfg.policy.max_subsidy_amount, Money::from_major(50_000));
        assert_eq!(cfg.fraud.high_value, Money::from_major(2_500));
        assert_eq!(cfg.fraud.rapid_depletion_hours, 6);
        assert_eq!(cfg.expiration.interval, Duration::from_secs(60));
        assert_eq!(cfg.retry.max_attempts, 1);
        assert!(cfg.slack_webhook_url.is_none());
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[(FRAUD_SUSPICIOUS_USAGE_CENTS, "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: FRAUD_SUSPICIOUS_USAGE_CENTS, .. }));

        let err = AppConfig::from_lookup(lookup(&[(SUBSIDY_MAX_AMOUNT_CENTS, "-5")])).unwrap_err();
        assert!(err.to_string().contains("must be greater than zero"));

        assert!(AppConfig::from_lookup(lookup(&[(SUBSIDY_EXPIRATION_INTERVAL_SECS, "0")])).is_err());
    }
}
