//! Notifications the ledger publishes after commit (movement posted) or from
//! the alert sweep (thresholds, lot expiry). Delivery is someone else's job.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{LotId, MovementId, ProductId, TenantId, WarehouseId};
use stockledger_events::{Event, TenantScoped};

use crate::lot::Lot;
use crate::movement::{BalanceSnapshot, Movement, MovementType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementPosted {
    pub tenant_id: TenantId,
    pub movement_id: MovementId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub movement_type: MovementType,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub sequence: u64,
    pub balance_after: BalanceSnapshot,
    pub reference: String,
    pub occurred_at: DateTime<Utc>,
}

impl From<&Movement> for MovementPosted {
    fn from(m: &Movement) -> Self {
        Self {
            tenant_id: m.tenant_id,
            movement_id: m.id,
            product_id: m.product_id,
            warehouse_id: m.warehouse_id,
            movement_type: m.movement_type,
            quantity: m.quantity,
            unit_cost: m.unit_cost,
            sequence: m.sequence,
            balance_after: m.balance_after,
            reference: m.reference.clone(),
            occurred_at: m.occurred_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockBelowMinimum {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub quantity: Decimal,
    pub minimum: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Lot approaching (or past) its expiry date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotExpiryAlert {
    pub tenant_id: TenantId,
    pub lot_id: LotId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub code: String,
    pub expires_on: NaiveDate,
    /// Negative once expired.
    pub days_to_expiry: i64,
    pub available_quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

impl LotExpiryAlert {
    /// `None` for lots without an expiry date.
    pub fn for_lot(lot: &Lot, today: NaiveDate, occurred_at: DateTime<Utc>) -> Option<Self> {
        let expires_on = lot.expires_on?;
        Some(Self {
            tenant_id: lot.tenant_id,
            lot_id: lot.id,
            product_id: lot.product_id,
            warehouse_id: lot.warehouse_id,
            code: lot.code.clone(),
            expires_on,
            days_to_expiry: (expires_on - today).num_days(),
            available_quantity: lot.available_quantity,
            occurred_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StockEvent {
    MovementPosted(MovementPosted),
    StockBelowMinimum(StockBelowMinimum),
    LotNearExpiry(LotExpiryAlert),
    LotExpired(LotExpiryAlert),
}

impl StockEvent {
    pub fn product_id(&self) -> ProductId {
        match self {
            StockEvent::MovementPosted(e) => e.product_id,
            StockEvent::StockBelowMinimum(e) => e.product_id,
            StockEvent::LotNearExpiry(e) | StockEvent::LotExpired(e) => e.product_id,
        }
    }

    pub fn warehouse_id(&self) -> WarehouseId {
        match self {
            StockEvent::MovementPosted(e) => e.warehouse_id,
            StockEvent::StockBelowMinimum(e) => e.warehouse_id,
            StockEvent::LotNearExpiry(e) | StockEvent::LotExpired(e) => e.warehouse_id,
        }
    }
}

impl TenantScoped for StockEvent {
    fn tenant_id(&self) -> TenantId {
        match self {
            StockEvent::MovementPosted(e) => e.tenant_id,
            StockEvent::StockBelowMinimum(e) => e.tenant_id,
            StockEvent::LotNearExpiry(e) | StockEvent::LotExpired(e) => e.tenant_id,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::MovementPosted(_) => "inventory.movement.posted",
            StockEvent::StockBelowMinimum(_) => "inventory.stock.below_minimum",
            StockEvent::LotNearExpiry(_) => "inventory.lot.near_expiry",
            StockEvent::LotExpired(_) => "inventory.lot.expired",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::MovementPosted(e) => e.occurred_at,
            StockEvent::StockBelowMinimum(e) => e.occurred_at,
            StockEvent::LotNearExpiry(e) | StockEvent::LotExpired(e) => e.occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::costing::WeightedAverageCost;
    use crate::position::StockKey;
    use rust_decimal_macros::dec;

    #[test]
    fn expiry_alert_counts_days_from_today() {
        let key = StockKey::new(TenantId::new(), ProductId::new(), WarehouseId::new());
        let today = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let expires = NaiveDate::from_ymd_opt(2026, 3, 11).unwrap();
        let mut lot = Lot::new(key, "L-7", None, Some(expires)).unwrap();
        lot.receive(dec!(5), dec!(1), &WeightedAverageCost::default()).unwrap();

        let alert = LotExpiryAlert::for_lot(&lot, today, Utc::now()).unwrap();
        let event = StockEvent::LotNearExpiry(alert);

        assert_eq!(event.event_type(), "inventory.lot.near_expiry");
        assert!(event.belongs_to(key.tenant_id));
        match event {
            StockEvent::LotNearExpiry(a) => assert_eq!(a.days_to_expiry, 10),
            _ => panic!("Expected LotNearExpiry"),
        }
    }

    #[test]
    fn lots_without_expiry_produce_no_alert() {
        let key = StockKey::new(TenantId::new(), ProductId::new(), WarehouseId::new());
        let lot = Lot::new(key, "L-8", None, None).unwrap();
        assert!(LotExpiryAlert::for_lot(&lot, Utc::now().date_naive(), Utc::now()).is_none());
    }
}
