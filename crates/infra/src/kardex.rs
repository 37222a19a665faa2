//! Read side of the stock ledger: kardex reports, balances, and replay checks.
//!
//! Queries never take stock locks. They read the latest committed state and
//! may trail an in-flight writer; pin `to` (or use `balance_at`) for a stable
//! view.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::error;

use stockledger_core::{MovementId, ProductId, TenantContext, TenantId, WarehouseId};
use stockledger_inventory::{
    BalanceSnapshot, CostingEngine, LotAllocation, Movement, MovementType, StockKey, StockPosition,
};

use crate::error::LedgerError;
use crate::ledger_store::LedgerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KardexEntry {
    pub movement_id: MovementId,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub movement_type: MovementType,
    /// Signed: positive in, negative out.
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    /// `quantity × unit_cost`, signed like the quantity.
    pub total_value: Decimal,
    pub running_balance: Decimal,
    pub running_average_cost: Decimal,
    pub reference: String,
    pub lot_allocations: Vec<LotAllocation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KardexReport {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub opening_balance: BalanceSnapshot,
    pub closing_balance: BalanceSnapshot,
    pub total_movements: usize,
    pub entries: Vec<KardexEntry>,
}

#[derive(Clone)]
pub struct KardexQuery {
    store: Arc<dyn LedgerStore>,
    costing: Arc<dyn CostingEngine>,
}

impl KardexQuery {
    pub fn new(store: Arc<dyn LedgerStore>, costing: Arc<dyn CostingEngine>) -> Self {
        Self { store, costing }
    }

    /// Movements of one position inside `[from, to]`, with a running balance
    /// recomputed from the opening balance and checked against every stored
    /// snapshot.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn kardex(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<KardexReport, LedgerError> {
        if let (Some(from), Some(to)) = (from, to) {
            if to < from {
                return Err(LedgerError::Validation(
                    "kardex window ends before it starts".to_string(),
                ));
            }
        }

        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        let movements = self.ordered_movements(&key)?;

        let before_window = |m: &Movement| from.is_some_and(|f| m.occurred_at < f);
        let after_window = |m: &Movement| to.is_some_and(|t| m.occurred_at > t);

        let opening_balance = movements
            .iter()
            .take_while(|m| before_window(*m))
            .last()
            .map_or_else(zero_balance, |m| m.balance_after);

        let mut running = opening_balance;
        let mut entries = Vec::new();
        for movement in movements
            .iter()
            .skip_while(|m| before_window(*m))
            .take_while(|m| !after_window(*m))
        {
            running = self.replay_one(running, movement)?;
            let total_value = movement.total_value().ok_or_else(|| {
                integrity_fault(
                    &key,
                    format!("movement {} has an unrepresentable value", movement.id),
                )
            })?;
            entries.push(KardexEntry {
                movement_id: movement.id,
                sequence: movement.sequence,
                occurred_at: movement.occurred_at,
                movement_type: movement.movement_type,
                quantity: movement.quantity,
                unit_cost: movement.unit_cost,
                total_value,
                running_balance: running.quantity,
                running_average_cost: running.average_cost,
                reference: movement.reference.clone(),
                lot_allocations: movement.lot_allocations.clone(),
            });
        }

        Ok(KardexReport {
            tenant_id: key.tenant_id,
            product_id,
            warehouse_id,
            from,
            to,
            opening_balance,
            closing_balance: running,
            total_movements: entries.len(),
            entries,
        })
    }

    /// Current aggregate, if the position has ever been touched.
    pub fn position(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Option<StockPosition>, LedgerError> {
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        Ok(self.store.position(&key)?)
    }

    /// `quantity − reserved`; zero for an unknown position.
    pub fn available_for_sale(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Decimal, LedgerError> {
        Ok(self
            .position(ctx, product_id, warehouse_id)?
            .map_or(Decimal::ZERO, |p| p.available()))
    }

    /// Balance as of `at`: the snapshot of the last movement at or before it.
    pub fn balance_at(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        at: DateTime<Utc>,
    ) -> Result<BalanceSnapshot, LedgerError> {
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        Ok(self
            .ordered_movements(&key)?
            .iter()
            .take_while(|m| m.occurred_at <= at)
            .last()
            .map_or_else(zero_balance, |m| m.balance_after))
    }

    /// Replay the whole ledger of a position from zero and compare it with
    /// every stored snapshot and with the stored aggregate.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn verify_position(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<BalanceSnapshot, LedgerError> {
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        let movements = self.store.movements(&key)?;

        let mut running = zero_balance();
        let mut signed_total = Decimal::ZERO;
        for (index, movement) in movements.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            if movement.sequence != expected_sequence {
                return Err(integrity_fault(
                    &key,
                    format!(
                        "movement {} has sequence {}, expected {expected_sequence}",
                        movement.id, movement.sequence
                    ),
                ));
            }
            running = self.replay_one(running, movement)?;
            signed_total = signed_total.checked_add(movement.quantity).ok_or_else(|| {
                integrity_fault(&key, "ledger quantity sum overflows".to_string())
            })?;
        }

        let stored = self.store.position(&key)?;
        let (quantity, average_cost, count) = stored
            .as_ref()
            .map_or((Decimal::ZERO, Decimal::ZERO, 0), |p| {
                (p.quantity(), p.average_cost(), p.movement_count())
            });
        if count != movements.len() as u64 {
            return Err(integrity_fault(
                &key,
                format!(
                    "aggregate counts {count} movements, ledger holds {}",
                    movements.len()
                ),
            ));
        }
        if quantity != signed_total || quantity != running.quantity {
            return Err(integrity_fault(
                &key,
                format!(
                    "aggregate quantity {quantity}, ledger sum {signed_total}, replay {}",
                    running.quantity
                ),
            ));
        }
        if !movements.is_empty() && average_cost != running.average_cost {
            return Err(integrity_fault(
                &key,
                format!(
                    "aggregate average cost {average_cost}, replay {}",
                    running.average_cost
                ),
            ));
        }
        Ok(running)
    }

    fn ordered_movements(&self, key: &StockKey) -> Result<Vec<Movement>, LedgerError> {
        let mut movements = self.store.movements(key)?;
        movements.sort_by(|a, b| {
            a.occurred_at
                .cmp(&b.occurred_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(movements)
    }

    fn replay_one(
        &self,
        running: BalanceSnapshot,
        movement: &Movement,
    ) -> Result<BalanceSnapshot, LedgerError> {
        let next = self
            .costing
            .apply(
                running,
                movement.direction(),
                movement.quantity.abs(),
                movement.unit_cost,
            )
            .map_err(|err| {
                integrity_fault(
                    &movement.key(),
                    format!("movement {} cannot be replayed: {err}", movement.id),
                )
            })?;
        if next != movement.balance_after {
            return Err(integrity_fault(
                &movement.key(),
                format!(
                    "movement {} (sequence {}) stores {:?}, replay gives {:?}",
                    movement.id, movement.sequence, movement.balance_after, next
                ),
            ));
        }
        Ok(next)
    }
}

fn zero_balance() -> BalanceSnapshot {
    BalanceSnapshot::new(Decimal::ZERO, Decimal::ZERO)
}

fn integrity_fault(key: &StockKey, detail: String) -> LedgerError {
    error!(stock_key = %key, %detail, "ledger replay disagrees with stored state");
    LedgerError::IntegrityFault(format!("{key}: {detail}"))
}
