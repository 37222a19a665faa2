use std::sync::Arc;

use thiserror::Error;

use stockledger_core::{ExpectedVersion, LotId, TenantId};
use stockledger_inventory::{Lot, Movement, StockKey, StockPosition};

use crate::idempotency::{IdempotencyRecord, IdempotencyScope};

/// Ledger store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, isolation) as
/// opposed to domain errors (validation, stock sufficiency).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    VersionConflict(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("invalid commit: {0}")]
    InvalidCommit(String),

    #[error("ledger store lock poisoned")]
    Poisoned,
}

/// New state of one position, guarded by the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionWrite {
    pub position: StockPosition,
    pub expected: ExpectedVersion,
}

/// Everything one locked section changed, committed all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerCommit {
    pub tenant_id: TenantId,
    pub positions: Vec<PositionWrite>,
    /// Appended in order; each continues its position's sequence.
    pub movements: Vec<Movement>,
    pub lots: Vec<Lot>,
    pub idempotency: Option<IdempotencyRecord>,
}

impl LedgerCommit {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            positions: Vec::new(),
            movements: Vec::new(),
            lots: Vec::new(),
            idempotency: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
            && self.movements.is_empty()
            && self.lots.is_empty()
            && self.idempotency.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// Another commit already recorded this idempotency scope; nothing was written.
    Duplicate(IdempotencyRecord),
}

/// Tenant-scoped storage of positions, movements, lots and idempotency records.
///
/// ## Commit semantics
///
/// `commit()`:
/// - rejects records of a tenant other than `commit.tenant_id`
/// - returns `Duplicate` without writing if the idempotency scope is taken
/// - checks every position's `ExpectedVersion`
/// - checks that movements continue their position's sequence without gaps
/// - writes everything atomically
///
/// Reads never wait for an in-flight commit to finish its locked section.
pub trait LedgerStore: Send + Sync {
    fn position(&self, key: &StockKey) -> Result<Option<StockPosition>, LedgerStoreError>;

    fn positions(&self, tenant_id: TenantId) -> Result<Vec<StockPosition>, LedgerStoreError>;

    /// Movements of one position in sequence order.
    fn movements(&self, key: &StockKey) -> Result<Vec<Movement>, LedgerStoreError>;

    /// Lots of one position.
    fn lots(&self, key: &StockKey) -> Result<Vec<Lot>, LedgerStoreError>;

    fn tenant_lots(&self, tenant_id: TenantId) -> Result<Vec<Lot>, LedgerStoreError>;

    fn lot(&self, tenant_id: TenantId, lot_id: LotId) -> Result<Option<Lot>, LedgerStoreError>;

    fn idempotency_record(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, LedgerStoreError>;

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, LedgerStoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn position(&self, key: &StockKey) -> Result<Option<StockPosition>, LedgerStoreError> {
        (**self).position(key)
    }

    fn positions(&self, tenant_id: TenantId) -> Result<Vec<StockPosition>, LedgerStoreError> {
        (**self).positions(tenant_id)
    }

    fn movements(&self, key: &StockKey) -> Result<Vec<Movement>, LedgerStoreError> {
        (**self).movements(key)
    }

    fn lots(&self, key: &StockKey) -> Result<Vec<Lot>, LedgerStoreError> {
        (**self).lots(key)
    }

    fn tenant_lots(&self, tenant_id: TenantId) -> Result<Vec<Lot>, LedgerStoreError> {
        (**self).tenant_lots(tenant_id)
    }

    fn lot(&self, tenant_id: TenantId, lot_id: LotId) -> Result<Option<Lot>, LedgerStoreError> {
        (**self).lot(tenant_id, lot_id)
    }

    fn idempotency_record(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, LedgerStoreError> {
        (**self).idempotency_record(scope)
    }

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, LedgerStoreError> {
        (**self).commit(commit)
    }
}
