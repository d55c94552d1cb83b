//! Process wiring: turns an `AppConfig` into a running ledger.
//!
//! - `DATABASE_URL` set: Postgres store (migrated on start), else in-memory
//! - `SLACK_WEBHOOK_URL` set: Slack alerts, else alerts are logged
//! - committed events flow over a `ChannelOutbox` into a spawned
//!   `SideEffectDispatcher`
//! - the expiration sweep runs on its own task
//!
//! Install the tracing subscriber (`grantledger_observability::init`) before
//! starting.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use grantledger_fraud::FraudHeuristics;
use grantledger_observability::{MetricsSink, TracingMetrics};

use crate::collaborators::{AlertChannel, SideEffectError, SlackAlertChannel, TracingAlertChannel};
use crate::config::AppConfig;
use crate::error::StoreError;
use crate::expiration_runner::ExpirationRunnerHandle;
use crate::ledger::SubsidyLedger;
use crate::outbox::dispatcher::DispatcherHandle;
use crate::outbox::{ChannelOutbox, SideEffectDispatcher};
use crate::store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("ledger store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("alert channel setup failed: {0}")]
    AlertChannel(#[from] SideEffectError),
}

pub type InMemoryLedger = SubsidyLedger<InMemoryLedgerStore, ChannelOutbox>;
pub type PostgresLedger = SubsidyLedger<PostgresLedgerStore, ChannelOutbox>;

/// The ledger service on whichever store the config selected.
#[derive(Clone)]
pub enum LedgerServices {
    InMemory(Arc<InMemoryLedger>),
    Postgres(Arc<PostgresLedger>),
}

impl LedgerServices {
    pub fn backend(&self) -> &'static str {
        match self {
            LedgerServices::InMemory(_) => "in_memory",
            LedgerServices::Postgres(_) => "postgres",
        }
    }
}

/// A started ledger with its background tasks.
pub struct LedgerRuntime {
    services: LedgerServices,
    alert_channel: &'static str,
    dispatcher: DispatcherHandle,
    expiration: ExpirationRunnerHandle,
}

impl LedgerRuntime {
    /// Start with counters emitted as tracing events.
    pub async fn start(config: AppConfig) -> Result<Self, BootstrapError> {
        Self::start_with_metrics(config, Arc::new(TracingMetrics)).await
    }

    pub async fn start_with_metrics(
        config: AppConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, BootstrapError> {
        let (alerts, alert_channel): (Arc<dyn AlertChannel>, &'static str) =
            match config.slack_webhook_url.as_deref() {
                Some(url) => (Arc::new(SlackAlertChannel::new(url)?), "slack"),
                None => (Arc::new(TracingAlertChannel), "tracing"),
            };

        let (outbox, rx) = ChannelOutbox::new();
        let outbox = Arc::new(outbox);

        let services = match config.database_url.as_deref() {
            Some(url) => {
                let store = PostgresLedgerStore::connect(url).await?;
                store.migrate().await?;
                LedgerServices::Postgres(build_ledger(store, outbox, &config, metrics.clone()))
            }
            None => LedgerServices::InMemory(build_ledger(
                InMemoryLedgerStore::new(),
                outbox,
                &config,
                metrics.clone(),
            )),
        };

        let dispatcher = Arc::new(
            SideEffectDispatcher::new(FraudHeuristics::new(config.fraud.clone()))
                .with_alert_channel(alerts)
                .with_metrics(metrics),
        )
        .spawn(rx);

        let expiration = match &services {
            LedgerServices::InMemory(ledger) => config.expiration.spawn("subsidy.expiration", ledger.clone()),
            LedgerServices::Postgres(ledger) => config.expiration.spawn("subsidy.expiration", ledger.clone()),
        };

        info!(
            backend = services.backend(),
            alert_channel,
            expiration_interval_secs = config.expiration.interval.as_secs(),
            max_attempts = config.retry.max_attempts,
            "subsidy ledger started"
        );

        Ok(Self {
            services,
            alert_channel,
            dispatcher,
            expiration,
        })
    }

    pub fn services(&self) -> &LedgerServices {
        &self.services
    }

    pub fn alert_channel(&self) -> &'static str {
        self.alert_channel
    }

    /// Run an expiration sweep now instead of waiting for the next tick.
    pub fn trigger_expiration(&self) {
        self.expiration.trigger();
    }

    /// Stop the sweep, then deliver every side effect already queued.
    pub async fn shutdown(self) {
        self.expiration.shutdown().await;
        self.dispatcher.shutdown().await;
        info!("subsidy ledger stopped");
    }
}

fn build_ledger<S: LedgerStore>(
    store: S,
    outbox: Arc<ChannelOutbox>,
    config: &AppConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Arc<SubsidyLedger<S, ChannelOutbox>> {
    Arc::new(
        SubsidyLedger::new(store, outbox)
            .with_policy(config.policy.clone())
            .with_retry_policy(config.retry.clone())
            .with_metrics(metrics),
    )
}

#[cfg(test)]
mod tests {
    use grantledger_core::{CustomerId, Money, ProviderId, StaffId};
    use grantledger_observability::InMemoryMetrics;
    use grantledger_subsidy::{Actor, CreateSubsidy, Provider};

    use super::*;

    #[tokio::test]
    async fn default_config_runs_in_memory_with_logged_alerts() {
        let mut config = AppConfig::default();
        config.fraud.high_value = Money::from_major(50);
        let metrics = Arc::new(InMemoryMetrics::new());

        let runtime = LedgerRuntime::start_with_metrics(config, metrics.clone()).await.unwrap();
        assert_eq!(runtime.services().backend(), "in_memory");
        assert_eq!(runtime.alert_channel(), "tracing");

        let LedgerServices::InMemory(ledger) = runtime.services().clone() else {
            panic!("expected the in-memory ledger");
        };
        let provider = ProviderId::new();
        ledger.store().insert_provider(Provider::new(provider, "Civic Fund")).await;
        ledger
            .create_subsidy(
                CreateSubsidy {
                    customer_id: CustomerId::new(),
                    provider_id: provider,
                    approved_amount: Money::from_major(60),
                    reason: "utility relief".into(),
                    valid_until: None,
                    admin_notes: None,
                },
                &Actor::new(StaffId::new()),
            )
            .await
            .unwrap();

        runtime.shutdown().await;

        assert_eq!(metrics.count("subsidy.created"), 1);
        // Threshold from the config reached the dispatcher.
        assert_eq!(metrics.count("fraud.alert"), 1);
        assert_eq!(metrics.count("side_effect.failed"), 0);
    }

    #[tokio::test]
    async fn webhook_url_selects_slack_alerts() {
        let config = AppConfig {
            slack_webhook_url: Some("http://127.0.0.1:9/hooks/ledger".to_string()),
            ..AppConfig::default()
        };

        let runtime = LedgerRuntime::start_with_metrics(config, Arc::new(InMemoryMetrics::new()))
            .await
            .unwrap();
        assert_eq!(runtime.alert_channel(), "slack");
        assert_eq!(runtime.services().backend(), "in_memory");
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_database_fails_startup() {
        let config = AppConfig {
            database_url: Some("postgres://ledger@127.0.0.1:1/ledger".to_string()),
            ..AppConfig::default()
        };

        let err = LedgerRuntime::start_with_metrics(config, Arc::new(InMemoryMetrics::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BootstrapError::Store(_)));
    }
}
