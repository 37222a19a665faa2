//! Threshold and expiry alerts.
//!
//! `AlertSweep` is meant to be driven by an external scheduler. It only reads
//! committed state and never takes stock locks.

use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{info, warn};

use stockledger_core::{AggregateId, AggregateRoot, TenantContext};
use stockledger_inventory::{LotExpiryAlert, StockBelowMinimum, StockEvent};

use crate::error::LedgerError;
use crate::movement_processor::{MovementProcessor, STOCK_POSITION_AGGREGATE};

pub const LOT_AGGREGATE: &str = "inventory.lot";

pub struct AlertSweep {
    processor: Arc<MovementProcessor>,
}

impl AlertSweep {
    pub fn new(processor: Arc<MovementProcessor>) -> Self {
        Self { processor }
    }

    /// Scan one tenant and publish every alert that applies on `today`.
    ///
    /// Returns the emitted events in scan order: positions first, then lots.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn run(
        &self,
        ctx: &TenantContext,
        today: NaiveDate,
    ) -> Result<Vec<StockEvent>, LedgerError> {
        let store = self.processor.store();
        let catalog = self.processor.catalog();
        let now = self.processor.clock().now();
        let window = self.processor.config().lot_expiry_warning_days;
        let mut emitted = Vec::new();

        for position in store.positions(ctx.tenant_id())? {
            let key = position.key();
            let Some(minimum) = catalog.minimum_stock(&key) else {
                continue;
            };
            if position.quantity() >= minimum {
                continue;
            }
            let event = StockEvent::StockBelowMinimum(StockBelowMinimum {
                tenant_id: key.tenant_id,
                product_id: key.product_id,
                warehouse_id: key.warehouse_id,
                quantity: position.quantity(),
                minimum,
                occurred_at: now,
            });
            self.publish(
                position.id_typed(),
                STOCK_POSITION_AGGREGATE,
                position.version(),
                &event,
            );
            emitted.push(event);
        }

        for lot in store.tenant_lots(ctx.tenant_id())? {
            if lot.available_quantity.is_zero() || lot.available_quantity.is_sign_negative() {
                continue;
            }
            let Some(alert) = LotExpiryAlert::for_lot(&lot, today, now) else {
                continue;
            };
            let event = if alert.days_to_expiry < 0 {
                StockEvent::LotExpired(alert)
            } else if alert.days_to_expiry <= window {
                StockEvent::LotNearExpiry(alert)
            } else {
                continue;
            };
            self.publish(AggregateId::from_uuid(*lot.id.as_uuid()), LOT_AGGREGATE, 0, &event);
            emitted.push(event);
        }

        info!(alerts = emitted.len(), %today, "alert sweep finished");
        Ok(emitted)
    }

    fn publish(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence: u64,
        event: &StockEvent,
    ) {
        if let Err(err) = self
            .processor
            .sink()
            .notify(aggregate_id, aggregate_type, sequence, event)
        {
            warn!(%aggregate_id, error = %err, "alert notification failed");
        }
    }
}
