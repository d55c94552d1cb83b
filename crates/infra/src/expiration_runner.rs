use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::ledger::SubsidyLedger;
use crate::outbox::Outbox;
use crate::store::LedgerStore;

/// Config for the periodic expiration sweep.
#[derive(Debug, Clone)]
pub struct ExpirationRunner {
    pub interval: Duration,
    pub batch_size: u32,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for ExpirationRunner {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            batch_size: 100,
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
        }
    }
}

/// Handle for a running sweep (shutdown + trigger hook).
#[derive(Debug)]
pub struct ExpirationRunnerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    trigger: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl ExpirationRunnerHandle {
    /// Request a sweep now. Triggers are coalesced: if one is already
    /// pending this is a no-op.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    /// Stop the runner and wait for the in-flight sweep to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(err) = self.join.await {
            warn!(error = %err, "expiration runner task failed");
        }
    }
}

impl ExpirationRunner {
    /// Spawn the sweep on the current tokio runtime.
    ///
    /// Runs once on startup, then every `interval` or on `trigger()`. A full
    /// batch with progress schedules another sweep immediately. Failures are
    /// logged and retried with bounded exponential backoff; they never
    /// propagate.
    pub fn spawn<S, O>(&self, name: &'static str, ledger: Arc<SubsidyLedger<S, O>>) -> ExpirationRunnerHandle
    where
        S: LedgerStore,
        O: Outbox,
    {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);

        let cfg = self.clone();
        let join = tokio::spawn(runner_loop(name, cfg, ledger, shutdown_rx, trigger_rx));

        ExpirationRunnerHandle {
            shutdown: Some(shutdown_tx),
            trigger: trigger_tx,
            join,
        }
    }
}

async fn runner_loop<S, O>(
    name: &'static str,
    cfg: ExpirationRunner,
    ledger: Arc<SubsidyLedger<S, O>>,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut trigger_rx: mpsc::Receiver<()>,
) where
    S: LedgerStore,
    O: Outbox,
{
    info!(runner = name, interval_secs = cfg.interval.as_secs(), "expiration runner started");

    let mut ticker = tokio::time::interval_at(Instant::now() + cfg.interval, cfg.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut pending = true; // sweep once on startup
    let mut failures: u32 = 0;

    loop {
        if pending {
            pending = false;

            match ledger.expire_overdue(cfg.batch_size).await {
                Ok(report) => {
                    failures = 0;
                    if report.failed > 0 {
                        warn!(runner = name, failed = report.failed, "some subsidies could not be expired");
                    }
                    // Backlog larger than one batch: keep going.
                    if report.scanned >= cfg.batch_size as usize && report.expired > 0 {
                        pending = true;
                        continue;
                    }
                }
                Err(err) => {
                    warn!(runner = name, error = %err, "expiration sweep failed");
                    failures += 1;
                    if failures <= cfg.max_retries {
                        pending = true;
                        tokio::select! {
                            biased;
                            _ = &mut shutdown_rx => break,
                            _ = tokio::time::sleep(backoff(cfg.base_backoff, failures)) => {}
                        }
                        continue;
                    }
                    failures = 0;
                }
            }
        }

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => pending = true,
            Some(()) = trigger_rx.recv() => pending = true,
        }
    }

    info!(runner = name, "expiration runner stopped");
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    // base * 2^(attempt-1), capped at 10s
    let pow = 1u32 << attempt.saturating_sub(1).min(10);
    let ms = base.as_millis().saturating_mul(pow as u128);
    Duration::from_millis(ms.min(10_000) as u64)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use grantledger_core::{Clock, CustomerId, FixedClock, Money, ProviderId, StaffId};
    use grantledger_subsidy::{Actor, CreateSubsidy, Provider};

    use super::*;
    use crate::outbox::InMemoryOutbox;
    use crate::store::InMemoryLedgerStore;

    type Ledger = SubsidyLedger<InMemoryLedgerStore, InMemoryOutbox>;

    async fn ledger_with_overdue(count: usize) -> (Arc<Ledger>, Arc<FixedClock>) {
        let start = Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(start));
        let store = InMemoryLedgerStore::new();
        let provider = ProviderId::new();
        store.insert_provider(Provider::new(provider, "Relief Fund")).await;

        let ledger = Arc::new(
            SubsidyLedger::new(store, Arc::new(InMemoryOutbox::new())).with_clock(clock.clone()),
        );
        let actor = Actor::new(StaffId::new());
        for _ in 0..count {
            ledger
                .create_subsidy(
                    CreateSubsidy {
                        customer_id: CustomerId::new(),
                        provider_id: provider,
                        approved_amount: Money::from_major(50),
                        reason: "seasonal support".into(),
                        valid_until: Some(start + ChronoDuration::hours(1)),
                        admin_notes: None,
                    },
                    &actor,
                )
                .await
                .unwrap();
        }
        clock.advance(ChronoDuration::hours(2));
        (ledger, clock)
    }

    #[tokio::test]
    async fn startup_sweep_expires_overdue_subsidies() {
        let (ledger, _) = ledger_with_overdue(3).await;

        let handle = ExpirationRunner::default().spawn("expiration-test", ledger.clone());
        handle.shutdown().await;

        let summary = ledger.summary().await.unwrap();
        assert_eq!(summary.expired_count, 3);
        assert_eq!(summary.active_count, 0);
    }

    #[tokio::test]
    async fn small_batches_drain_the_backlog() {
        let (ledger, _) = ledger_with_overdue(5).await;
        let runner = ExpirationRunner {
            batch_size: 2,
            ..ExpirationRunner::default()
        };

        let handle = runner.spawn("expiration-test", ledger.clone());
        handle.shutdown().await;

        assert_eq!(ledger.summary().await.unwrap().expired_count, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_runs_another_sweep() {
        let (ledger, clock) = ledger_with_overdue(0).await;
        let handle = ExpirationRunner::default().spawn("expiration-test", ledger.clone());

        // Let the startup sweep run against an empty ledger.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let provider = ProviderId::new();
        ledger.store().insert_provider(Provider::new(provider, "Late Fund")).await;
        ledger
            .create_subsidy(
                CreateSubsidy {
                    customer_id: CustomerId::new(),
                    provider_id: provider,
                    approved_amount: Money::from_major(20),
                    reason: "bridge".into(),
                    valid_until: Some(clock.now() + ChronoDuration::minutes(5)),
                    admin_notes: None,
                },
                &Actor::new(StaffId::new()),
            )
            .await
            .unwrap();
        clock.advance(ChronoDuration::minutes(10));

        handle.trigger();
        for _ in 0..50 {
            if ledger.summary().await.unwrap().expired_count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(ledger.summary().await.unwrap().expired_count, 1);
    }

    #[test]
    fn backoff_is_bounded() {
        assert_eq!(backoff(Duration::from_millis(250), 1), Duration::from_millis(250));
        assert_eq!(backoff(Duration::from_millis(250), 3), Duration::from_millis(1_000));
        assert_eq!(backoff(Duration::from_millis(250), 30), Duration::from_secs(10));
    }
}
