//! Lot sub-ledger: traceable sub-quantities with their own cost and expiry.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{DomainError, DomainResult, LotId, ProductId, TenantId, WarehouseId};

use crate::costing::{CostingEngine, out_of_range};
use crate::movement::{BalanceSnapshot, Direction, LotAllocation, validate_quantity};
use crate::position::StockKey;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotStatus {
    Available,
    Blocked,
    Expired,
    Depleted,
}

/// A lot of one product in one warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lot {
    pub id: LotId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub code: String,
    pub manufactured_on: Option<NaiveDate>,
    pub expires_on: Option<NaiveDate>,
    /// Cumulative quantity received into the lot.
    pub initial_quantity: Decimal,
    pub available_quantity: Decimal,
    pub unit_cost: Decimal,
    status: LotStatus,
}

impl Lot {
    /// Register an empty lot; it becomes available on its first receipt.
    pub fn new(
        key: StockKey,
        code: impl Into<String>,
        manufactured_on: Option<NaiveDate>,
        expires_on: Option<NaiveDate>,
    ) -> DomainResult<Self> {
        let code = code.into();
        if code.trim().is_empty() {
            return Err(DomainError::validation("lot code cannot be empty"));
        }
        if let (Some(made), Some(expires)) = (manufactured_on, expires_on) {
            if expires < made {
                return Err(DomainError::validation(
                    "lot cannot expire before it is manufactured",
                ));
            }
        }
        Ok(Self {
            id: LotId::new(),
            tenant_id: key.tenant_id,
            product_id: key.product_id,
            warehouse_id: key.warehouse_id,
            code,
            manufactured_on,
            expires_on,
            initial_quantity: Decimal::ZERO,
            available_quantity: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
            status: LotStatus::Depleted,
        })
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.tenant_id, self.product_id, self.warehouse_id)
    }

    /// Stored status (never `Expired`; see [`Lot::status_on`]).
    pub fn stored_status(&self) -> LotStatus {
        self.status
    }

    /// Effective status on `today`: past-expiry lots report `Expired`.
    pub fn status_on(&self, today: NaiveDate) -> LotStatus {
        match self.status {
            LotStatus::Blocked => LotStatus::Blocked,
            _ if self.is_expired(today) => LotStatus::Expired,
            other => other,
        }
    }

    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.expires_on.is_some_and(|d| d < today)
    }

    pub fn is_allocatable(&self, today: NaiveDate) -> bool {
        self.status_on(today) == LotStatus::Available && self.available_quantity > Decimal::ZERO
    }

    /// Days until expiry (negative once expired).
    pub fn days_to_expiry(&self, today: NaiveDate) -> Option<i64> {
        self.expires_on.map(|d| (d - today).num_days())
    }

    pub fn receive(
        &mut self,
        quantity: Decimal,
        unit_cost: Decimal,
        costing: &dyn CostingEngine,
    ) -> DomainResult<()> {
        validate_quantity(quantity)?;
        let initial_quantity = self
            .initial_quantity
            .checked_add(quantity)
            .ok_or_else(|| out_of_range("lot quantity"))?;
        let after = costing.apply(
            BalanceSnapshot::new(self.available_quantity, self.unit_cost),
            Direction::Inbound,
            quantity,
            unit_cost,
        )?;
        self.available_quantity = after.quantity;
        self.unit_cost = after.average_cost;
        self.initial_quantity = initial_quantity;
        if self.status == LotStatus::Depleted {
            self.status = LotStatus::Available;
        }
        Ok(())
    }

    pub fn consume(&mut self, quantity: Decimal, today: NaiveDate) -> DomainResult<()> {
        validate_quantity(quantity)?;
        match self.status_on(today) {
            LotStatus::Blocked => return Err(DomainError::invariant("lot is blocked")),
            LotStatus::Expired => return Err(DomainError::invariant("lot is expired")),
            _ => {}
        }
        if quantity > self.available_quantity {
            return Err(DomainError::insufficient_stock(quantity, self.available_quantity));
        }
        self.available_quantity -= quantity;
        if self.available_quantity.is_zero() {
            self.status = LotStatus::Depleted;
        }
        Ok(())
    }

    pub fn block(&mut self) -> DomainResult<()> {
        if self.status == LotStatus::Blocked {
            return Err(DomainError::workflow("lot is already blocked"));
        }
        self.status = LotStatus::Blocked;
        Ok(())
    }

    pub fn unblock(&mut self) -> DomainResult<()> {
        if self.status != LotStatus::Blocked {
            return Err(DomainError::workflow("lot is not blocked"));
        }
        self.status = if self.available_quantity > Decimal::ZERO {
            LotStatus::Available
        } else {
            LotStatus::Depleted
        };
        Ok(())
    }
}

/// FEFO allocation of outbound quantities across lots.
#[derive(Debug, Default, Copy, Clone)]
pub struct LotAllocator;

impl LotAllocator {
    /// Total quantity that could be allocated on `today`.
    pub fn allocatable_quantity(lots: &[Lot], today: NaiveDate) -> Decimal {
        lots.iter()
            .filter(|l| l.is_allocatable(today))
            .map(|l| l.available_quantity)
            .sum()
    }

    /// Split `quantity` across allocatable lots, earliest expiry first
    /// (lots without expiry last, ties by code).
    pub fn allocate(
        lots: &[Lot],
        quantity: Decimal,
        today: NaiveDate,
    ) -> DomainResult<Vec<LotAllocation>> {
        validate_quantity(quantity)?;

        let available = Self::allocatable_quantity(lots, today);
        if quantity > available {
            return Err(DomainError::insufficient_stock(quantity, available));
        }

        let mut candidates: Vec<&Lot> = lots.iter().filter(|l| l.is_allocatable(today)).collect();
        candidates.sort_by(|a, b| {
            let expiry = |l: &Lot| (l.expires_on.is_none(), l.expires_on);
            expiry(a).cmp(&expiry(b)).then_with(|| a.code.cmp(&b.code))
        });

        let mut remaining = quantity;
        let mut allocations = Vec::new();
        for lot in candidates {
            if remaining.is_zero() {
                break;
            }
            let take = remaining.min(lot.available_quantity);
            allocations.push(LotAllocation {
                lot_id: lot.id,
                quantity: take,
            });
            remaining -= take;
        }
        Ok(allocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costing::WeightedAverageCost;
    use rust_decimal_macros::dec;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn test_key() -> StockKey {
        StockKey::new(TenantId::new(), ProductId::new(), WarehouseId::new())
    }

    fn stocked(key: StockKey, code: &str, expires: Option<NaiveDate>, qty: Decimal) -> Lot {
        let mut lot = Lot::new(key, code, None, expires).unwrap();
        lot.receive(qty, dec!(2), &WeightedAverageCost::default()).unwrap();
        lot
    }

    #[test]
    fn new_lot_is_depleted_until_received() {
        let key = test_key();
        let mut lot = Lot::new(key, "L-1", None, None).unwrap();
        assert_eq!(lot.stored_status(), LotStatus::Depleted);

        lot.receive(dec!(10), dec!(3), &WeightedAverageCost::default()).unwrap();
        assert_eq!(lot.stored_status(), LotStatus::Available);
        assert_eq!(lot.initial_quantity, dec!(10));
        assert_eq!(lot.unit_cost, dec!(3));
    }

    #[test]
    fn oversized_receipt_leaves_lot_untouched() {
        let mut lot = stocked(test_key(), "L-1", None, dec!(4));
        let before = lot.clone();
        let err = lot
            .receive(Decimal::MAX, dec!(1), &WeightedAverageCost::default())
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert_eq!(lot, before);
    }

    #[test]
    fn consuming_everything_depletes() {
        let today = day(2026, 1, 1);
        let mut lot = stocked(test_key(), "L-1", None, dec!(4));
        lot.consume(dec!(4), today).unwrap();
        assert_eq!(lot.status_on(today), LotStatus::Depleted);
        assert!(lot.consume(dec!(1), today).is_err());
    }

    #[test]
    fn expired_and_blocked_lots_cannot_be_consumed() {
        let today = day(2026, 6, 1);
        let key = test_key();
        let mut expired = stocked(key, "OLD", Some(day(2026, 5, 31)), dec!(5));
        assert_eq!(expired.status_on(today), LotStatus::Expired);
        assert!(expired.consume(dec!(1), today).is_err());

        let mut blocked = stocked(key, "BLK", None, dec!(5));
        blocked.block().unwrap();
        assert!(blocked.consume(dec!(1), today).is_err());
        blocked.unblock().unwrap();
        assert!(blocked.consume(dec!(1), today).is_ok());
    }

    #[test]
    fn allocation_is_first_expired_first_out() {
        let today = day(2026, 1, 1);
        let key = test_key();
        let late = stocked(key, "B", Some(day(2026, 9, 1)), dec!(10));
        let early = stocked(key, "A", Some(day(2026, 3, 1)), dec!(4));
        let never = stocked(key, "C", None, dec!(10));
        let lots = vec![never.clone(), late.clone(), early.clone()];

        let allocations = LotAllocator::allocate(&lots, dec!(12), today).unwrap();

        assert_eq!(
            allocations,
            vec![
                LotAllocation { lot_id: early.id, quantity: dec!(4) },
                LotAllocation { lot_id: late.id, quantity: dec!(8) },
            ]
        );
    }

    #[test]
    fn allocation_skips_expired_and_reports_shortfall() {
        let today = day(2026, 6, 1);
        let key = test_key();
        let lots = vec![
            stocked(key, "OLD", Some(day(2026, 1, 1)), dec!(100)),
            stocked(key, "NEW", Some(day(2027, 1, 1)), dec!(5)),
        ];

        let err = LotAllocator::allocate(&lots, dec!(6), today).unwrap_err();
        assert_eq!(err, DomainError::insufficient_stock(dec!(6), dec!(5)));
    }

    #[test]
    fn expiry_before_manufacture_is_invalid() {
        let err = Lot::new(test_key(), "X", Some(day(2026, 2, 1)), Some(day(2026, 1, 1)))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
