//! Error taxonomy for the ledger service and its storage backends.
//!
//! `StoreError` is what a backend reports. `LedgerError` is the closed set of
//! outcomes callers of `SubsidyLedger` see. Both domain and store failures map
//! into it through `From`, the same way command dispatch maps its inputs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use grantledger_core::DomainError;

/// Storage backend failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A uniqueness guarantee rejected the write (e.g. a second active subsidy).
    #[error("constraint conflict: {0}")]
    Conflict(String),

    /// Serialization failure, deadlock, lock timeout or a dropped connection.
    /// Safe to retry the whole transaction.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// A stored row could not be decoded into a domain value.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Forbidden,
    State,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::State => "state",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Outcome of a failed ledger operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid state: {0}")]
    State(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::Validation(_) => ErrorKind::Validation,
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::Conflict(_) => ErrorKind::Conflict,
            LedgerError::Forbidden(_) => ErrorKind::Forbidden,
            LedgerError::State(_) => ErrorKind::State,
            LedgerError::Transient(_) => ErrorKind::Transient,
            LedgerError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }

    /// Message safe to show an end user. Internal details are not exposed.
    pub fn public_message(&self) -> String {
        match self {
            LedgerError::Internal(_) => "an internal error occurred".to_string(),
            LedgerError::Transient(_) => "the service is busy, please retry".to_string(),
            other => other.to_string(),
        }
    }

    /// Suggested HTTP status for a transport layer.
    pub fn status_hint(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict | ErrorKind::State => 409,
            ErrorKind::Transient => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::NotFound(what) => LedgerError::NotFound(what),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
            DomainError::Forbidden(msg) => LedgerError::Forbidden(msg),
            DomainError::State(msg) => LedgerError::State(msg),
            DomainError::InvalidId(msg) => LedgerError::Validation(msg),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => LedgerError::Conflict(msg),
            StoreError::Transient(msg) => LedgerError::Transient(msg),
            StoreError::Corrupt(msg) | StoreError::Backend(msg) => LedgerError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_keep_their_kind() {
        assert_eq!(
            LedgerError::from(DomainError::forbidden("x")).kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            LedgerError::from(DomainError::invalid_id("x")).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            LedgerError::from(DomainError::not_found("subsidy")).to_string(),
            "subsidy not found"
        );
    }

    #[test]
    fn only_transient_store_failures_are_retryable() {
        assert!(LedgerError::from(StoreError::Transient("40001".into())).is_retryable());
        assert!(!LedgerError::from(StoreError::Conflict("23505".into())).is_retryable());
        assert_eq!(
            LedgerError::from(StoreError::Backend("boom".into())).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn internal_details_are_hidden_from_public_message() {
        let err = LedgerError::Internal("connection refused to 10.0.0.5:5432".into());
        assert_eq!(err.public_message(), "an internal error occurred");
        assert_eq!(err.status_hint(), 500);

        let err = LedgerError::State("subsidy is already expired".into());
        assert_eq!(err.public_message(), "invalid state: subsidy is already expired");
        assert_eq!(err.status_hint(), 409);
    }
}
