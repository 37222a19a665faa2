//! Typed results returned by the ledger services.

use rust_decimal::Decimal;
use thiserror::Error;

use stockledger_core::DomainError;

use crate::ledger_store::LedgerStoreError;
use crate::locks::LockError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed or out-of-range input. Rejected before any lock is taken.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Outbound quantity exceeds what is available (checked under the lock).
    #[error("insufficient stock: requested {requested}, available {available}")]
    InsufficientStock { requested: Decimal, available: Decimal },

    /// The catalog does not know the referenced product or warehouse.
    #[error("unknown aggregate: {0}")]
    UnknownAggregate(String),

    /// Stock locks were not obtained in time. Safe to retry.
    #[error("concurrency timeout: {0}")]
    ConcurrencyTimeout(String),

    #[error("invalid workflow transition: {0}")]
    WorkflowState(String),

    #[error("already processed")]
    AlreadyProcessed,

    #[error("not found: {0}")]
    NotFound(String),

    /// Replayed ledger disagrees with stored state. Needs an operator.
    #[error("integrity fault: {0}")]
    IntegrityFault(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    /// A concurrent writer changed the record first.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store failure: {0}")]
    Store(String),
}

impl LedgerError {
    /// Only lock timeouts are worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyTimeout(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        LedgerError::NotFound(what.into())
    }
}

impl From<DomainError> for LedgerError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => LedgerError::Validation(msg),
            DomainError::InvariantViolation(msg) => LedgerError::Validation(msg),
            DomainError::InvalidId(msg) => LedgerError::Validation(msg),
            DomainError::NotFound => LedgerError::NotFound("entity".to_string()),
            DomainError::Conflict(msg) => LedgerError::Conflict(msg),
            DomainError::InsufficientStock {
                requested,
                available,
            } => LedgerError::InsufficientStock {
                requested,
                available,
            },
            DomainError::WorkflowState(msg) => LedgerError::WorkflowState(msg),
            DomainError::AlreadyProcessed => LedgerError::AlreadyProcessed,
        }
    }
}

impl From<LedgerStoreError> for LedgerError {
    fn from(value: LedgerStoreError) -> Self {
        match value {
            LedgerStoreError::VersionConflict(msg) => LedgerError::Conflict(msg),
            LedgerStoreError::TenantIsolation(msg) => LedgerError::TenantIsolation(msg),
            other => LedgerError::Store(other.to_string()),
        }
    }
}

impl From<LockError> for LedgerError {
    fn from(value: LockError) -> Self {
        LedgerError::ConcurrencyTimeout(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[test]
    fn only_timeouts_are_retryable() {
        let timeout: LedgerError = LockError::Timeout {
            waited: Duration::from_millis(5),
            keys: 1,
        }
        .into();
        assert!(timeout.is_retryable());
        assert!(!LedgerError::AlreadyProcessed.is_retryable());
        assert!(!LedgerError::Conflict("x".into()).is_retryable());
    }

    #[test]
    fn domain_errors_keep_their_meaning() {
        assert_eq!(
            LedgerError::from(DomainError::insufficient_stock(dec!(40), dec!(20))),
            LedgerError::InsufficientStock {
                requested: dec!(40),
                available: dec!(20)
            }
        );
        assert_eq!(
            LedgerError::from(DomainError::AlreadyProcessed),
            LedgerError::AlreadyProcessed
        );
        assert!(matches!(
            LedgerError::from(DomainError::workflow("nope")),
            LedgerError::WorkflowState(_)
        ));
    }

    #[test]
    fn store_conflicts_surface_as_conflicts() {
        assert!(matches!(
            LedgerError::from(LedgerStoreError::VersionConflict("v".into())),
            LedgerError::Conflict(_)
        ));
        assert!(matches!(
            LedgerError::from(LedgerStoreError::Poisoned),
            LedgerError::Store(_)
        ));
    }
}
