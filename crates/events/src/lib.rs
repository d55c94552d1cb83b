//! Ledger event contracts.
//!
//! Events describe committed facts. They are handed to the outbox after the
//! ledger transaction commits and are consumed by best-effort side effects
//! (notifications, fraud heuristics, external mirroring).

pub mod envelope;
pub mod event;

pub use envelope::EventEnvelope;
pub use event::Event;
