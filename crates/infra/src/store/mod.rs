//! Ledger persistence.
//!
//! - `r#trait`: the transactional store contract used by `SubsidyLedger`
//! - `in_memory`: serialized in-process store for tests/dev
//! - `postgres`: SERIALIZABLE transactions with row/advisory locks

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::{InMemoryLedgerStore, InMemoryLedgerTx};
pub use postgres::{PostgresLedgerStore, PostgresLedgerTx};
pub use query::{Page, PageRequest, SubsidyFilter, SubsidySummary};
pub use r#trait::{LedgerStore, LedgerTx};
