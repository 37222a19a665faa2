//! Staging area for one locked section.
//!
//! Every change (positions, movements, lots) is applied to staged copies and
//! validated against staged balances, so a multi-line action that fails on
//! its last line leaves nothing behind. The movement processor turns a
//! finished unit of work into a single [`LedgerCommit`].

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use stockledger_core::{
    AggregateId, AggregateRoot, ExpectedVersion, LotId, MovementId, ProductId, TenantId,
    WarehouseId,
};
use stockledger_inventory::movement::validate_quantity;
use stockledger_inventory::{
    BalanceSnapshot, CostingEngine, Direction, Lot, LotAllocation, LotAllocator, Movement,
    MovementDraft, MovementRequest, MovementType, NegativeStockPolicy, StockKey, StockPosition,
};

use crate::catalog::Catalog;
use crate::error::LedgerError;
use crate::idempotency::IdempotencyRecord;
use crate::ledger_store::{LedgerCommit, LedgerStore, PositionWrite};

/// One movement to post inside a unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingLine {
    pub id: MovementId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub movement_type: MovementType,
    /// Strictly positive.
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub reference: String,
    pub idempotency_key: String,
    pub lot_id: Option<LotId>,
    /// Reservation hold consumed by this movement.
    pub release_reserved: Decimal,
}

impl PostingLine {
    pub fn new(
        product_id: ProductId,
        warehouse_id: WarehouseId,
        movement_type: MovementType,
        quantity: Decimal,
        unit_cost: Decimal,
    ) -> Self {
        Self {
            id: MovementId::new(),
            product_id,
            warehouse_id,
            movement_type,
            quantity,
            unit_cost,
            reference: String::new(),
            idempotency_key: String::new(),
            lot_id: None,
            release_reserved: Decimal::ZERO,
        }
    }

    pub fn with_id(mut self, id: MovementId) -> Self {
        self.id = id;
        self
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = reference.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_lot(mut self, lot_id: Option<LotId>) -> Self {
        self.lot_id = lot_id;
        self
    }

    pub fn releasing(mut self, reserved: Decimal) -> Self {
        self.release_reserved = reserved;
        self
    }
}

impl From<MovementRequest> for PostingLine {
    fn from(request: MovementRequest) -> Self {
        PostingLine::new(
            request.product_id,
            request.warehouse_id,
            request.movement_type,
            request.quantity,
            request.unit_cost,
        )
        .with_reference(request.reference)
        .with_idempotency_key(request.idempotency_key)
        .with_lot(request.lot_id)
    }
}

#[derive(Debug)]
struct StagedPosition {
    position: StockPosition,
    expected: ExpectedVersion,
    read_version: u64,
}

pub struct UnitOfWork<'a> {
    store: &'a dyn LedgerStore,
    catalog: &'a dyn Catalog,
    costing: &'a dyn CostingEngine,
    tenant_id: TenantId,
    locked: Vec<StockKey>,
    now: DateTime<Utc>,
    positions: BTreeMap<StockKey, StagedPosition>,
    lots: BTreeMap<LotId, Lot>,
    lots_loaded: HashSet<StockKey>,
    dirty_lots: BTreeSet<LotId>,
    movements: Vec<Movement>,
}

impl<'a> UnitOfWork<'a> {
    pub(crate) fn new(
        store: &'a dyn LedgerStore,
        catalog: &'a dyn Catalog,
        costing: &'a dyn CostingEngine,
        tenant_id: TenantId,
        locked: &[StockKey],
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            catalog,
            costing,
            tenant_id,
            locked: locked.to_vec(),
            now,
            positions: BTreeMap::new(),
            lots: BTreeMap::new(),
            lots_loaded: HashSet::new(),
            dirty_lots: BTreeSet::new(),
            movements: Vec::new(),
        }
    }

    /// Business time of this unit of work (read once, under the lock).
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn key(&self, product_id: ProductId, warehouse_id: WarehouseId) -> StockKey {
        StockKey::new(self.tenant_id, product_id, warehouse_id)
    }

    /// Movements posted so far, in posting order.
    pub fn movements(&self) -> &[Movement] {
        &self.movements
    }

    /// Staged position (opened fresh when the key has no history).
    pub fn position(&mut self, key: StockKey) -> Result<&StockPosition, LedgerError> {
        Ok(&self.staged(key)?.position)
    }

    pub fn balance(&mut self, key: StockKey) -> Result<BalanceSnapshot, LedgerError> {
        Ok(self.position(key)?.balance())
    }

    /// Place a reservation hold on `key`.
    pub fn reserve(&mut self, key: StockKey, quantity: Decimal) -> Result<(), LedgerError> {
        self.ensure_catalog(&key)?;
        self.staged(key)?.position.reserve(quantity)?;
        Ok(())
    }

    /// Drop a reservation hold on `key` without moving stock.
    pub fn release(&mut self, key: StockKey, quantity: Decimal) -> Result<(), LedgerError> {
        self.staged(key)?.position.release(quantity)?;
        Ok(())
    }

    /// Validate and stage one movement.
    pub fn post(&mut self, line: PostingLine) -> Result<Movement, LedgerError> {
        let key = self.key(line.product_id, line.warehouse_id);
        self.ensure_locked(&key)?;
        self.ensure_catalog(&key)?;
        validate_quantity(line.quantity)?;

        let lot_tracked = self.catalog.is_lot_tracked(self.tenant_id, line.product_id);
        let (policy, lot_allocations, updated_lots) = if lot_tracked {
            // Lots never go negative, whatever the tenant policy.
            let (allocations, lots) = self.plan_lots(&key, &line)?;
            (NegativeStockPolicy::Reject, allocations, lots)
        } else {
            if line.lot_id.is_some() {
                return Err(LedgerError::Validation(format!(
                    "product {} is not lot-tracked",
                    line.product_id
                )));
            }
            let policy = if self.catalog.allows_negative_stock(self.tenant_id) {
                NegativeStockPolicy::Allow
            } else {
                NegativeStockPolicy::Reject
            };
            (policy, Vec::new(), Vec::new())
        };

        let draft = MovementDraft {
            id: line.id,
            movement_type: line.movement_type,
            quantity: line.quantity,
            unit_cost: line.unit_cost,
            reference: line.reference,
            idempotency_key: line.idempotency_key,
            lot_id: line.lot_id,
            lot_allocations,
            occurred_at: self.now,
            release_reserved: line.release_reserved,
        };
        let costing = self.costing;
        let movement = self.staged(key)?.position.record(draft, costing, policy)?;

        for lot in updated_lots {
            self.dirty_lots.insert(lot.id);
            self.lots.insert(lot.id, lot);
        }
        self.movements.push(movement.clone());
        Ok(movement)
    }

    /// Stage a newly registered lot. Codes are unique per position.
    pub fn add_lot(&mut self, lot: Lot) -> Result<(), LedgerError> {
        let key = lot.key();
        self.ensure_locked(&key)?;
        self.load_lots(&key)?;
        if self.lots.values().any(|l| l.key() == key && l.code == lot.code) {
            return Err(LedgerError::Conflict(format!(
                "lot code '{}' already exists for {key}",
                lot.code
            )));
        }
        self.dirty_lots.insert(lot.id);
        self.lots.insert(lot.id, lot);
        Ok(())
    }

    /// Staged lot for in-place changes (block/unblock).
    pub fn lot_mut(&mut self, lot_id: LotId) -> Result<&mut Lot, LedgerError> {
        if !self.lots.contains_key(&lot_id) {
            let lot = self
                .store
                .lot(self.tenant_id, lot_id)?
                .ok_or_else(|| LedgerError::not_found(format!("lot {lot_id}")))?;
            self.ensure_locked(&lot.key())?;
            self.lots.insert(lot_id, lot);
        }
        self.dirty_lots.insert(lot_id);
        self.lots
            .get_mut(&lot_id)
            .ok_or_else(|| LedgerError::not_found(format!("lot {lot_id}")))
    }

    /// Position aggregate id of each posted movement (for notifications).
    pub(crate) fn posted(&self) -> Vec<(AggregateId, Movement)> {
        self.movements
            .iter()
            .filter_map(|m| {
                self.positions
                    .get(&m.key())
                    .map(|s| (s.position.id_typed(), m.clone()))
            })
            .collect()
    }

    pub(crate) fn into_commit(self, idempotency: Option<IdempotencyRecord>) -> LedgerCommit {
        let mut commit = LedgerCommit::new(self.tenant_id);
        commit.positions = self
            .positions
            .into_values()
            .filter(|s| s.position.version() != s.read_version)
            .map(|s| PositionWrite {
                position: s.position,
                expected: s.expected,
            })
            .collect();
        commit.movements = self.movements;
        let mut lots = self.lots;
        commit.lots = self
            .dirty_lots
            .iter()
            .filter_map(|id| lots.remove(id))
            .collect();
        commit.idempotency = idempotency;
        commit
    }

    fn ensure_locked(&self, key: &StockKey) -> Result<(), LedgerError> {
        if key.tenant_id != self.tenant_id {
            return Err(LedgerError::TenantIsolation(format!(
                "stock key {key} belongs to another tenant"
            )));
        }
        if self.locked.binary_search(key).is_err() {
            return Err(LedgerError::Store(format!(
                "stock key {key} is not locked by this unit of work"
            )));
        }
        Ok(())
    }

    fn ensure_catalog(&self, key: &StockKey) -> Result<(), LedgerError> {
        if !self.catalog.product_exists(key.tenant_id, key.product_id) {
            return Err(LedgerError::UnknownAggregate(format!(
                "product {}",
                key.product_id
            )));
        }
        if !self.catalog.warehouse_exists(key.tenant_id, key.warehouse_id) {
            return Err(LedgerError::UnknownAggregate(format!(
                "warehouse {}",
                key.warehouse_id
            )));
        }
        Ok(())
    }

    fn staged(&mut self, key: StockKey) -> Result<&mut StagedPosition, LedgerError> {
        self.ensure_locked(&key)?;
        let staged = match self.positions.entry(key) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let staged = match self.store.position(&key)? {
                    Some(position) => StagedPosition {
                        expected: ExpectedVersion::Exact(position.version()),
                        read_version: position.version(),
                        position,
                    },
                    None => StagedPosition {
                        position: StockPosition::open(key),
                        expected: ExpectedVersion::NoneYet,
                        read_version: 0,
                    },
                };
                slot.insert(staged)
            }
        };
        Ok(staged)
    }

    fn load_lots(&mut self, key: &StockKey) -> Result<(), LedgerError> {
        if self.lots_loaded.insert(*key) {
            for lot in self.store.lots(key)? {
                self.lots.entry(lot.id).or_insert(lot);
            }
        }
        Ok(())
    }

    fn staged_lot(&self, key: &StockKey, lot_id: LotId) -> Result<&Lot, LedgerError> {
        self.lots
            .get(&lot_id)
            .filter(|l| l.key() == *key)
            .ok_or_else(|| LedgerError::not_found(format!("lot {lot_id} for {key}")))
    }

    /// Lot allocations for a lot-tracked line and the lots as they would be
    /// after it. Nothing is staged until the position accepts the movement.
    fn plan_lots(
        &mut self,
        key: &StockKey,
        line: &PostingLine,
    ) -> Result<(Vec<LotAllocation>, Vec<Lot>), LedgerError> {
        self.load_lots(key)?;
        let today = self.now.date_naive();

        match line.movement_type.direction() {
            Direction::Inbound => {
                let lot_id = line.lot_id.ok_or_else(|| {
                    LedgerError::Validation(format!(
                        "product {} is lot-tracked; receipts must name a lot",
                        line.product_id
                    ))
                })?;
                let mut lot = self.staged_lot(key, lot_id)?.clone();
                lot.receive(line.quantity, line.unit_cost, self.costing)?;
                let allocation = LotAllocation {
                    lot_id,
                    quantity: line.quantity,
                };
                Ok((vec![allocation], vec![lot]))
            }
            Direction::Outbound => {
                let allocations = match line.lot_id {
                    Some(lot_id) => vec![LotAllocation {
                        lot_id,
                        quantity: line.quantity,
                    }],
                    None => {
                        let candidates: Vec<Lot> = self
                            .lots
                            .values()
                            .filter(|l| l.key() == *key)
                            .cloned()
                            .collect();
                        LotAllocator::allocate(&candidates, line.quantity, today)?
                    }
                };
                let mut updated = Vec::with_capacity(allocations.len());
                for allocation in &allocations {
                    let mut lot = self.staged_lot(key, allocation.lot_id)?.clone();
                    lot.consume(allocation.quantity, today)?;
                    updated.push(lot);
                }
                Ok((allocations, updated))
            }
        }
    }
}
