//! Infrastructure layer: ledger service, storage backends, side-effect
//! delivery, and process configuration.
//!
//! Domain rules live in `grantledger-subsidy`; this crate owns transactions,
//! retries, and everything that talks to the outside world.

pub mod bootstrap;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod expiration_runner;
pub mod ledger;
pub mod outbox;
pub mod retry;
pub mod store;


pub use bootstrap::{BootstrapError, LedgerRuntime, LedgerServices};
pub use config::{AppConfig, ConfigError};
pub use error::{ErrorKind, LedgerError, StoreError};
pub use expiration_runner::{ExpirationRunner, ExpirationRunnerHandle};
pub use ledger::{ExpirationReport, SubsidyDetail, SubsidyLedger};
pub use outbox::{ChannelOutbox, InMemoryOutbox, Outbox, SideEffectDispatcher};
pub use retry::{BackoffStrategy, RetryPolicy};
