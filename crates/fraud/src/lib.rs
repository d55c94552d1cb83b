//! `grantledger-fraud`
//!
//! **Responsibility:** best-effort anomaly detection over committed ledger events.
//!
//! This crate sits beside the ledger, not inside it:
//! - It is stateless and performs no IO.
//! - It never mutates subsidy state or blocks a ledger operation.
//! - It emits **alerts**, not domain events. Delivery is the caller's concern.

pub mod alert;
pub mod heuristics;
pub mod thresholds;

pub use alert::{AlertKind, FraudAlert, Severity};
pub use heuristics::FraudHeuristics;
pub use thresholds::FraudThresholds;
