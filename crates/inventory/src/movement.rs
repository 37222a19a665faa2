//! Immutable stock movements (the kardex lines).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    DomainError, DomainResult, LotId, MovementId, ProductId, TenantId, WarehouseId,
};

use crate::position::StockKey;

/// Which way a movement moves stock.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Movement type. The direction is implied by the type; callers always
/// submit a positive quantity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    /// Purchase receipt.
    EntradaCompra,
    /// Sale dispatch.
    SalidaVenta,
    /// Outbound leg of an inter-warehouse transfer (origin).
    TransferenciaSalida,
    /// Inbound leg of an inter-warehouse transfer (destination, or origin on cancel).
    TransferenciaEntrada,
    AjustePositivo,
    AjusteNegativo,
    /// Customer return.
    DevolucionCliente,
    /// Return to supplier.
    DevolucionProveedor,
}

impl MovementType {
    pub const ALL: [MovementType; 8] = [
        MovementType::EntradaCompra,
        MovementType::SalidaVenta,
        MovementType::TransferenciaSalida,
        MovementType::TransferenciaEntrada,
        MovementType::AjustePositivo,
        MovementType::AjusteNegativo,
        MovementType::DevolucionCliente,
        MovementType::DevolucionProveedor,
    ];

    pub fn direction(self) -> Direction {
        match self {
            MovementType::EntradaCompra
            | MovementType::TransferenciaEntrada
            | MovementType::AjustePositivo
            | MovementType::DevolucionCliente => Direction::Inbound,
            MovementType::SalidaVenta
            | MovementType::TransferenciaSalida
            | MovementType::AjusteNegativo
            | MovementType::DevolucionProveedor => Direction::Outbound,
        }
    }

    pub fn is_inbound(self) -> bool {
        self.direction() == Direction::Inbound
    }

    /// Signed ledger quantity for a positive request quantity.
    pub fn signed(self, quantity: Decimal) -> Decimal {
        match self.direction() {
            Direction::Inbound => quantity,
            Direction::Outbound => -quantity,
        }
    }
}

/// Quantity and average cost of a position at one point of the ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub quantity: Decimal,
    pub average_cost: Decimal,
}

impl BalanceSnapshot {
    pub const ZERO: BalanceSnapshot = BalanceSnapshot {
        quantity: Decimal::ZERO,
        average_cost: Decimal::ZERO,
    };

    pub fn new(quantity: Decimal, average_cost: Decimal) -> Self {
        Self {
            quantity,
            average_cost,
        }
    }

    /// Inventory value at average cost, `None` if it overflows.
    pub fn value(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.average_cost)
    }
}

/// Part of an outbound (or inbound) quantity attributed to one lot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotAllocation {
    pub lot_id: LotId,
    pub quantity: Decimal,
}

/// Immutable ledger record. Never updated or deleted; corrections are new
/// compensating movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    /// Lot requested by the caller (if any).
    pub lot_id: Option<LotId>,
    /// Lots actually touched; empty for products without lot tracking.
    pub lot_allocations: Vec<LotAllocation>,
    pub movement_type: MovementType,
    /// Signed: positive inbound, negative outbound.
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub occurred_at: DateTime<Utc>,
    /// 1-based, contiguous position of this movement in its position's ledger.
    pub sequence: u64,
    pub reference: String,
    pub idempotency_key: String,
    /// Balance of the position right after this movement.
    pub balance_after: BalanceSnapshot,
}

impl Movement {
    pub fn key(&self) -> StockKey {
        StockKey::new(self.tenant_id, self.product_id, self.warehouse_id)
    }

    pub fn direction(&self) -> Direction {
        self.movement_type.direction()
    }

    /// Signed movement value (`quantity × unit_cost`), `None` if it overflows.
    pub fn total_value(&self) -> Option<Decimal> {
        self.quantity.checked_mul(self.unit_cost)
    }
}

/// Caller-facing request to post one movement (`RegisterMovement`).
///
/// The tenant comes from the call's `TenantContext`, never from the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRequest {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub movement_type: MovementType,
    /// Strictly positive; the sign comes from `movement_type`.
    pub quantity: Decimal,
    /// Cost of inbound units. Outbound movements are valued at average cost.
    pub unit_cost: Decimal,
    pub reference: String,
    pub idempotency_key: String,
    pub lot_id: Option<LotId>,
}

impl MovementRequest {
    /// Input checks that need no stock state (run before any lock is taken).
    pub fn validate(&self) -> DomainResult<()> {
        validate_quantity(self.quantity)?;
        if self.unit_cost < Decimal::ZERO {
            return Err(DomainError::validation("unit cost cannot be negative"));
        }
        validate_idempotency_key(&self.idempotency_key)
    }
}

pub fn validate_quantity(quantity: Decimal) -> DomainResult<()> {
    if quantity <= Decimal::ZERO {
        return Err(DomainError::validation("quantity must be strictly positive"));
    }
    Ok(())
}

pub fn validate_idempotency_key(key: &str) -> DomainResult<()> {
    if key.trim().is_empty() {
        return Err(DomainError::validation("idempotency key is required"));
    }
    Ok(())
}
