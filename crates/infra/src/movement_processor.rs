//! Movement posting pipeline (application-level orchestration).
//!
//! The `MovementProcessor` is the only writer of the stock ledger. Every
//! mutating operation, including the multi-line workflow actions, runs the
//! same pipeline:
//!
//! ```text
//! Request
//!   ↓
//! 1. Validate input (no lock taken)
//!   ↓
//! 2. Idempotency fast path: return the stored result if the key is known
//!   ↓
//! 3. Acquire the stock locks of every touched key (sorted, bounded wait)
//!   ↓
//! 4. Re-check the idempotency key under the lock
//!   ↓
//! 5. Stage movements in a UnitOfWork (fresh stock checks, costing, lots)
//!   ↓
//! 6. Commit positions + movements + lots + idempotency record atomically
//!   ↓
//! 7. Release the locks, publish MovementPosted notifications
//! ```
//!
//! A commit that loses an idempotency race to a concurrent request with the
//! same key (possible when the two requests touch different keys) is
//! discarded and the winner's result is returned.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use stockledger_core::{Clock, LotId, ProductId, TenantContext, WarehouseId};
use stockledger_inventory::{
    CostingEngine, Lot, Movement, MovementRequest, StockEvent, StockKey, WeightedAverageCost,
};

use crate::catalog::Catalog;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::idempotency::{IdempotencyGuard, IdempotencyRecord, IdempotencyScope, operations};
use crate::kardex::KardexQuery;
use crate::ledger_store::{CommitOutcome, LedgerStore};
use crate::locks::{StockLockGuard, StockLockManager};
use crate::sink::NotificationSink;
use crate::unit_of_work::{PostingLine, UnitOfWork};

/// Aggregate type recorded on notifications about stock positions.
pub const STOCK_POSITION_AGGREGATE: &str = "inventory.stock_position";

/// Result of committing a unit of work.
#[derive(Debug)]
pub(crate) enum Committed<T> {
    /// Our staged work is now the ledger state.
    Applied,
    /// A concurrent request with the same idempotency key committed first.
    Replayed(T),
}

pub struct MovementProcessor {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<dyn Catalog>,
    costing: Arc<dyn CostingEngine>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn NotificationSink>,
    locks: StockLockManager,
    config: LedgerConfig,
}

impl MovementProcessor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<dyn Catalog>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            costing: Arc::new(WeightedAverageCost::new(config.cost_scale)),
            store,
            catalog,
            clock,
            sink,
            locks: StockLockManager::new(),
            config,
        }
    }

    /// Replace the costing engine (weighted average by default).
    pub fn with_costing(mut self, costing: Arc<dyn CostingEngine>) -> Self {
        self.costing = costing;
        self
    }

    pub fn store(&self) -> &dyn LedgerStore {
        self.store.as_ref()
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn sink(&self) -> &dyn NotificationSink {
        self.sink.as_ref()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Read side over the same store and costing engine.
    pub fn kardex(&self) -> KardexQuery {
        KardexQuery::new(Arc::clone(&self.store), Arc::clone(&self.costing))
    }

    /// Post one movement.
    ///
    /// Replaying a known idempotency key returns the original movement
    /// without validating the new payload.
    #[tracing::instrument(
        skip(self, ctx, request),
        fields(
            tenant_id = %ctx.tenant_id(),
            product_id = %request.product_id,
            warehouse_id = %request.warehouse_id,
            idempotency_key = %request.idempotency_key,
        )
    )]
    pub fn register_movement(
        &self,
        ctx: &TenantContext,
        request: MovementRequest,
    ) -> Result<Movement, LedgerError> {
        let scope = IdempotencyScope::new(
            ctx.tenant_id(),
            operations::REGISTER_MOVEMENT,
            request.idempotency_key.clone(),
        )?;
        if let Some(movement) = self.replay::<Movement>(&scope)? {
            return Ok(movement);
        }
        request.validate()?;

        let key = StockKey::new(ctx.tenant_id(), request.product_id, request.warehouse_id);
        let guard = self.lock(ctx, &[key])?;
        if let Some(movement) = self.replay::<Movement>(&scope)? {
            return Ok(movement);
        }

        let mut uow = self.unit_of_work(ctx, &guard);
        let movement = uow.post(PostingLine::from(request)).map_err(|err| {
            if let LedgerError::InsufficientStock { requested, available } = &err {
                warn!(%requested, %available, "outbound movement rejected");
            }
            err
        })?;

        match self.commit(uow, Some(&scope), &movement)? {
            Committed::Applied => {
                info!(
                    movement_id = %movement.id,
                    movement_type = ?movement.movement_type,
                    quantity = %movement.quantity,
                    sequence = movement.sequence,
                    "movement posted"
                );
                Ok(movement)
            }
            Committed::Replayed(original) => Ok(original),
        }
    }

    /// Register a lot for a lot-tracked product. Codes are unique per position.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn create_lot(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        code: &str,
        manufactured_on: Option<NaiveDate>,
        expires_on: Option<NaiveDate>,
    ) -> Result<Lot, LedgerError> {
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        if !self.catalog.product_exists(key.tenant_id, product_id) {
            return Err(LedgerError::UnknownAggregate(format!("product {product_id}")));
        }
        if !self.catalog.warehouse_exists(key.tenant_id, warehouse_id) {
            return Err(LedgerError::UnknownAggregate(format!("warehouse {warehouse_id}")));
        }
        if !self.catalog.is_lot_tracked(key.tenant_id, product_id) {
            return Err(LedgerError::Validation(format!(
                "product {product_id} is not lot-tracked"
            )));
        }
        let lot = Lot::new(key, code, manufactured_on, expires_on)?;

        let guard = self.lock(ctx, &[key])?;
        let mut uow = self.unit_of_work(ctx, &guard);
        uow.add_lot(lot.clone())?;
        self.commit(uow, None, &())?;
        info!(lot_id = %lot.id, code = %lot.code, "lot registered");
        Ok(lot)
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn block_lot(&self, ctx: &TenantContext, lot_id: LotId) -> Result<Lot, LedgerError> {
        self.update_lot(ctx, lot_id, |lot| lot.block().map_err(LedgerError::from))
    }

    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn unblock_lot(&self, ctx: &TenantContext, lot_id: LotId) -> Result<Lot, LedgerError> {
        self.update_lot(ctx, lot_id, |lot| lot.unblock().map_err(LedgerError::from))
    }

    pub fn lot(&self, ctx: &TenantContext, lot_id: LotId) -> Result<Lot, LedgerError> {
        self.store
            .lot(ctx.tenant_id(), lot_id)?
            .ok_or_else(|| LedgerError::not_found(format!("lot {lot_id}")))
    }

    /// Lots of one position, ordered by code.
    pub fn lots(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Vec<Lot>, LedgerError> {
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        Ok(self.store.lots(&key)?)
    }

    fn update_lot<F>(
        &self,
        ctx: &TenantContext,
        lot_id: LotId,
        change: F,
    ) -> Result<Lot, LedgerError>
    where
        F: FnOnce(&mut Lot) -> Result<(), LedgerError>,
    {
        let key = self.lot(ctx, lot_id)?.key();
        let guard = self.lock(ctx, &[key])?;
        let mut uow = self.unit_of_work(ctx, &guard);
        let lot = uow.lot_mut(lot_id)?;
        change(lot)?;
        let updated = lot.clone();
        self.commit(uow, None, &())?;
        info!(lot_id = %lot_id, status = ?updated.stored_status(), "lot status changed");
        Ok(updated)
    }

    pub(crate) fn idempotency(&self) -> IdempotencyGuard<'_> {
        IdempotencyGuard::new(self.store.as_ref())
    }

    pub(crate) fn replay<T: DeserializeOwned>(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<T>, LedgerError> {
        let replayed = self.idempotency().replay(scope)?;
        if replayed.is_some() {
            debug!(operation = %scope.operation, key = %scope.key, "idempotent replay");
        }
        Ok(replayed)
    }

    /// Lock `keys` (any order, duplicates allowed) for the caller's tenant.
    pub(crate) fn lock(
        &self,
        ctx: &TenantContext,
        keys: &[StockKey],
    ) -> Result<StockLockGuard<'_>, LedgerError> {
        if let Some(foreign) = keys.iter().find(|k| k.tenant_id != ctx.tenant_id()) {
            return Err(LedgerError::TenantIsolation(format!(
                "stock key {foreign} is outside tenant {}",
                ctx.tenant_id()
            )));
        }
        debug!(keys = keys.len(), "acquiring stock locks");
        self.locks
            .acquire(keys, self.config.lock_timeout)
            .map_err(|err| {
                warn!(error = %err, "stock lock timeout");
                LedgerError::from(err)
            })
    }

    pub(crate) fn unit_of_work<'a>(
        &'a self,
        ctx: &TenantContext,
        guard: &StockLockGuard<'_>,
    ) -> UnitOfWork<'a> {
        UnitOfWork::new(
            self.store.as_ref(),
            self.catalog.as_ref(),
            self.costing.as_ref(),
            ctx.tenant_id(),
            guard.keys(),
            self.clock.now(),
        )
    }

    /// Commit staged work, recording `result` under `scope` when given.
    pub(crate) fn commit<T>(
        &self,
        uow: UnitOfWork<'_>,
        scope: Option<&IdempotencyScope>,
        result: &T,
    ) -> Result<Committed<T>, LedgerError>
    where
        T: Serialize + DeserializeOwned,
    {
        let now = uow.now();
        let posted = uow.posted();
        let record = scope
            .map(|s| IdempotencyRecord::new(s.clone(), result, now))
            .transpose()?;
        let commit = uow.into_commit(record);
        if commit.is_empty() {
            return Ok(Committed::Applied);
        }

        match self.store.commit(commit)? {
            CommitOutcome::Committed => {
                self.publish(&posted);
                Ok(Committed::Applied)
            }
            CommitOutcome::Duplicate(winner) => {
                debug!(
                    operation = %winner.scope.operation,
                    key = %winner.scope.key,
                    "lost idempotency race; returning the committed result"
                );
                Ok(Committed::Replayed(winner.decode()?))
            }
        }
    }

    fn publish(&self, posted: &[(stockledger_core::AggregateId, Movement)]) {
        for (position_id, movement) in posted {
            let event = StockEvent::MovementPosted(movement.into());
            if let Err(err) =
                self.sink
                    .notify(*position_id, STOCK_POSITION_AGGREGATE, movement.sequence, &event)
            {
                warn!(movement_id = %movement.id, error = %err, "movement notification failed");
            }
        }
    }
}
