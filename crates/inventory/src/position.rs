//! Stock position aggregate: the current-state cache of one ledger stream.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    AggregateId, AggregateRoot, DomainError, DomainResult, LotId, MovementId, ProductId,
    TenantId, WarehouseId,
};

use crate::costing::{CostingEngine, out_of_range};
use crate::movement::{
    validate_quantity, BalanceSnapshot, Direction, LotAllocation, Movement, MovementType,
};

/// Aggregate key and unit of serialization: one row per (tenant, product, warehouse).
///
/// The derived ordering (tenant, product, warehouse) is the global lock order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StockKey {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
}

impl StockKey {
    pub fn new(tenant_id: TenantId, product_id: ProductId, warehouse_id: WarehouseId) -> Self {
        Self {
            tenant_id,
            product_id,
            warehouse_id,
        }
    }
}

impl core::fmt::Display for StockKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.product_id, self.warehouse_id)
    }
}

/// Whether outbound movements may drive the position below zero.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeStockPolicy {
    Reject,
    Allow,
}

/// Everything needed to turn a validated request into a ledger line.
///
/// Built by the movement processor under the aggregate lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementDraft {
    pub id: MovementId,
    pub movement_type: MovementType,
    /// Strictly positive.
    pub quantity: Decimal,
    /// Inbound cost; ignored for outbound movements.
    pub unit_cost: Decimal,
    pub reference: String,
    pub idempotency_key: String,
    pub lot_id: Option<LotId>,
    pub lot_allocations: Vec<LotAllocation>,
    pub occurred_at: DateTime<Utc>,
    /// Reservation hold consumed by this movement (reservation confirm).
    pub release_reserved: Decimal,
}

/// Aggregate root: StockPosition.
///
/// `quantity` always equals the sum of the signed quantities of this
/// position's movements; the movement log is the source of truth and the
/// position can be rebuilt by replaying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockPosition {
    id: AggregateId,
    key: StockKey,
    quantity: Decimal,
    average_cost: Decimal,
    reserved: Decimal,
    /// Number of movements posted (the last movement's sequence).
    movement_count: u64,
    /// Bumped on every mutation (movement or reservation hold change).
    version: u64,
    last_movement_at: Option<DateTime<Utc>>,
}

impl StockPosition {
    /// A fresh position, created on the first movement or hold referencing the key.
    pub fn open(key: StockKey) -> Self {
        Self {
            id: AggregateId::new(),
            key,
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            reserved: Decimal::ZERO,
            movement_count: 0,
            version: 0,
            last_movement_at: None,
        }
    }

    pub fn id_typed(&self) -> AggregateId {
        self.id
    }

    pub fn key(&self) -> StockKey {
        self.key
    }

    pub fn tenant_id(&self) -> TenantId {
        self.key.tenant_id
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn average_cost(&self) -> Decimal {
        self.average_cost
    }

    pub fn reserved(&self) -> Decimal {
        self.reserved
    }

    pub fn movement_count(&self) -> u64 {
        self.movement_count
    }

    pub fn last_movement_at(&self) -> Option<DateTime<Utc>> {
        self.last_movement_at
    }

    /// Quantity free for new reservations and outbound movements.
    pub fn available(&self) -> Decimal {
        self.quantity.saturating_sub(self.reserved)
    }

    pub fn balance(&self) -> BalanceSnapshot {
        BalanceSnapshot::new(self.quantity, self.average_cost)
    }

    /// Validate and apply one movement, returning the immutable ledger record.
    ///
    /// Outbound movements are checked against `quantity − reserved` (plus the
    /// hold they consume). The recorded unit cost of an outbound movement is
    /// the current average cost.
    pub fn record(
        &mut self,
        draft: MovementDraft,
        costing: &dyn CostingEngine,
        policy: NegativeStockPolicy,
    ) -> DomainResult<Movement> {
        validate_quantity(draft.quantity)?;
        if draft.release_reserved < Decimal::ZERO || draft.release_reserved > self.reserved {
            return Err(DomainError::invariant(
                "released hold exceeds the reserved quantity",
            ));
        }

        let direction = draft.movement_type.direction();
        let unit_cost = match direction {
            Direction::Inbound => {
                if draft.unit_cost < Decimal::ZERO {
                    return Err(DomainError::validation("unit cost cannot be negative"));
                }
                draft.unit_cost
            }
            Direction::Outbound => {
                let available = self.available().saturating_add(draft.release_reserved);
                if policy == NegativeStockPolicy::Reject && draft.quantity > available {
                    return Err(DomainError::insufficient_stock(draft.quantity, available));
                }
                self.average_cost
            }
        };

        if draft.quantity.checked_mul(unit_cost).is_none() {
            return Err(out_of_range("movement value"));
        }
        let balance_after = costing.apply(self.balance(), direction, draft.quantity, unit_cost)?;

        // Keep (timestamp, sequence) ordering identical to commit ordering.
        let occurred_at = match self.last_movement_at {
            Some(last) if last > draft.occurred_at => last,
            _ => draft.occurred_at,
        };

        let movement = Movement {
            id: draft.id,
            tenant_id: self.key.tenant_id,
            product_id: self.key.product_id,
            warehouse_id: self.key.warehouse_id,
            lot_id: draft.lot_id,
            lot_allocations: draft.lot_allocations,
            movement_type: draft.movement_type,
            quantity: draft.movement_type.signed(draft.quantity),
            unit_cost,
            occurred_at,
            sequence: self.movement_count + 1,
            reference: draft.reference,
            idempotency_key: draft.idempotency_key,
            balance_after,
        };

        self.reserved -= draft.release_reserved;
        self.apply_movement(&movement);
        Ok(movement)
    }

    /// Evolve state from a movement already in the ledger (replay).
    pub fn apply_movement(&mut self, movement: &Movement) {
        self.quantity = movement.balance_after.quantity;
        self.average_cost = movement.balance_after.average_cost;
        self.movement_count = movement.sequence;
        self.last_movement_at = Some(movement.occurred_at);
        self.version += 1;
    }

    /// Place a hold: `reserved += quantity`, if that much is unreserved.
    pub fn reserve(&mut self, quantity: Decimal) -> DomainResult<()> {
        validate_quantity(quantity)?;
        let available = self.available();
        if quantity > available {
            return Err(DomainError::insufficient_stock(quantity, available.max(Decimal::ZERO)));
        }
        self.reserved += quantity;
        self.version += 1;
        Ok(())
    }

    /// Drop a hold without moving stock (reservation cancel / expiry).
    pub fn release(&mut self, quantity: Decimal) -> DomainResult<()> {
        validate_quantity(quantity)?;
        if quantity > self.reserved {
            return Err(DomainError::invariant(
                "released hold exceeds the reserved quantity",
            ));
        }
        self.reserved -= quantity;
        self.version += 1;
        Ok(())
    }
}

impl AggregateRoot for StockPosition {
    type Id = StockKey;

    fn id(&self) -> &Self::Id {
        &self.key
    }

    fn version(&self) -> u64 {
        self.version
    }
}
