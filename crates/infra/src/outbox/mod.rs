//! Post-commit side-effect queue.
//!
//! The ledger enqueues exactly one envelope per committed change. Enqueueing
//! never blocks and never fails the caller; delivery happens on a detached
//! worker (`SideEffectDispatcher`).

pub mod dispatcher;

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use grantledger_events::EventEnvelope;
use grantledger_subsidy::LedgerEvent;

pub use dispatcher::{DispatcherHandle, SideEffectDispatcher};

pub type LedgerEnvelope = EventEnvelope<LedgerEvent>;

/// Sink for committed ledger events.
pub trait Outbox: Send + Sync + 'static {
    fn enqueue(&self, envelope: LedgerEnvelope);
}

/// Collects envelopes in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryOutbox {
    items: Mutex<Vec<LedgerEnvelope>>,
}

impl InMemoryOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<LedgerEnvelope> {
        match self.items.lock() {
            Ok(items) => items.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.items.lock() {
            Ok(items) => items.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything enqueued so far.
    pub fn drain(&self) -> Vec<LedgerEnvelope> {
        match self.items.lock() {
            Ok(mut items) => std::mem::take(&mut *items),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Outbox for InMemoryOutbox {
    fn enqueue(&self, envelope: LedgerEnvelope) {
        match self.items.lock() {
            Ok(mut items) => items.push(envelope),
            Err(poisoned) => poisoned.into_inner().push(envelope),
        }
    }
}

/// Hands envelopes to a dispatcher task over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelOutbox {
    tx: mpsc::UnboundedSender<LedgerEnvelope>,
}

impl ChannelOutbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LedgerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Outbox for ChannelOutbox {
    fn enqueue(&self, envelope: LedgerEnvelope) {
        if let Err(err) = self.tx.send(envelope) {
            let envelope = err.0;
            warn!(
                event_id = %envelope.event_id(),
                event_type = envelope.event_type(),
                "side-effect worker is gone, dropping event"
            );
        }
    }
}
