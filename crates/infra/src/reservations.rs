//! Reservation service: holds on available stock and their outcomes.
//!
//! The hold lives on the stock position (`reserved`), so placing, consuming
//! and dropping it serialize through the position's lock like any movement.
//! The reservation document is saved after the ledger commit, still under
//! that lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use stockledger_core::{
    AggregateId, AggregateRoot, ExpectedVersion, MovementId, ProductId, TenantContext, WarehouseId,
};
use stockledger_events::execute;
use stockledger_inventory::movement::validate_quantity;
use stockledger_inventory::{
    CancelReservation, ConfirmReservation, CreateReservation, ExpireReservation, Movement,
    MovementType, Reservation, ReservationCommand, ReservationId, ReservationStatus, StockKey,
};

use crate::error::LedgerError;
use crate::idempotency::{IdempotencyScope, operations};
use crate::movement_processor::{Committed, MovementProcessor};
use crate::repository::DocumentRepository;
use crate::unit_of_work::PostingLine;

pub struct ReservationManager {
    processor: Arc<MovementProcessor>,
    repo: Arc<dyn DocumentRepository<Reservation>>,
}

impl ReservationManager {
    pub fn new(
        processor: Arc<MovementProcessor>,
        repo: Arc<dyn DocumentRepository<Reservation>>,
    ) -> Self {
        Self { processor, repo }
    }

    /// Hold `quantity` of a position until `expires_at`.
    ///
    /// Fails with `InsufficientStock` when `quantity > quantity − reserved`.
    #[tracing::instrument(skip(self, ctx, reference), fields(tenant_id = %ctx.tenant_id()))]
    pub fn create(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        quantity: Decimal,
        reference: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Reservation, LedgerError> {
        validate_quantity(quantity)?;
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        let reservation_id = ReservationId::new(AggregateId::new());

        let guard = self.processor.lock(ctx, &[key])?;
        let mut uow = self.processor.unit_of_work(ctx, &guard);
        let mut reservation = Reservation::empty(reservation_id);
        execute(
            &mut reservation,
            &ReservationCommand::Create(CreateReservation {
                tenant_id: ctx.tenant_id(),
                reservation_id,
                key,
                quantity,
                reference: reference.to_string(),
                expires_at,
                occurred_at: uow.now(),
            }),
        )?;
        uow.reserve(key, quantity)?;
        self.processor.commit(uow, None, &())?;
        self.repo
            .save(ctx.tenant_id(), reservation.clone(), ExpectedVersion::NoneYet)?;

        info!(reservation_id = %reservation_id, %quantity, "reservation created");
        Ok(reservation)
    }

    /// Consume the hold with one SalidaVenta of the reserved quantity.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn confirm(
        &self,
        ctx: &TenantContext,
        reservation_id: ReservationId,
        idempotency_key: &str,
    ) -> Result<Movement, LedgerError> {
        let scope = IdempotencyScope::new(
            ctx.tenant_id(),
            operations::CONFIRM_RESERVATION,
            idempotency_key,
        )?;
        if let Some(movement) = self.processor.replay::<Movement>(&scope)? {
            return Ok(movement);
        }

        let key = self.stock_key(ctx, reservation_id)?;
        let guard = self.processor.lock(ctx, &[key])?;
        if let Some(movement) = self.processor.replay::<Movement>(&scope)? {
            return Ok(movement);
        }

        let mut reservation = self.get(ctx, reservation_id)?;
        let expected = ExpectedVersion::Exact(reservation.version());
        let mut uow = self.processor.unit_of_work(ctx, &guard);
        let movement_id = MovementId::new();
        execute(
            &mut reservation,
            &ReservationCommand::Confirm(ConfirmReservation {
                tenant_id: ctx.tenant_id(),
                reservation_id,
                movement_id,
                occurred_at: uow.now(),
            }),
        )?;

        let quantity = reservation.quantity();
        let movement = uow.post(
            PostingLine::new(
                key.product_id,
                key.warehouse_id,
                MovementType::SalidaVenta,
                quantity,
                Decimal::ZERO,
            )
            .with_id(movement_id)
            .with_reference(reservation.reference())
            .with_idempotency_key(scope.key.clone())
            .releasing(quantity),
        )?;

        match self.processor.commit(uow, Some(&scope), &movement)? {
            Committed::Applied => {
                self.repo.save(ctx.tenant_id(), reservation, expected)?;
                info!(
                    reservation_id = %reservation_id,
                    movement_id = %movement.id,
                    "reservation confirmed"
                );
                Ok(movement)
            }
            Committed::Replayed(original) => Ok(original),
        }
    }

    /// Drop the hold without posting a movement.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn cancel(
        &self,
        ctx: &TenantContext,
        reservation_id: ReservationId,
    ) -> Result<Reservation, LedgerError> {
        self.release(ctx, reservation_id, |now| {
            ReservationCommand::Cancel(CancelReservation {
                tenant_id: ctx.tenant_id(),
                reservation_id,
                occurred_at: now,
            })
        })
    }

    /// Expire a reservation whose expiry has passed (clock time).
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn expire(
        &self,
        ctx: &TenantContext,
        reservation_id: ReservationId,
    ) -> Result<Reservation, LedgerError> {
        self.release(ctx, reservation_id, |now| {
            ReservationCommand::Expire(ExpireReservation {
                tenant_id: ctx.tenant_id(),
                reservation_id,
                occurred_at: now,
            })
        })
    }

    /// Expire every Pending reservation of the tenant due at `now`.
    ///
    /// Reservations confirmed or cancelled concurrently are skipped.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn expire_due(
        &self,
        ctx: &TenantContext,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReservationId>, LedgerError> {
        let due: Vec<ReservationId> = self
            .list(ctx)?
            .into_iter()
            .filter(|r| r.is_due(now))
            .map(|r| r.id_typed())
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for reservation_id in due {
            let result = self.release(ctx, reservation_id, |_| {
                ReservationCommand::Expire(ExpireReservation {
                    tenant_id: ctx.tenant_id(),
                    reservation_id,
                    occurred_at: now,
                })
            });
            match result {
                Ok(_) => expired.push(reservation_id),
                Err(LedgerError::WorkflowState(reason)) => {
                    debug!(reservation_id = %reservation_id, %reason, "reservation no longer due");
                }
                Err(err) => return Err(err),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "expired due reservations");
        }
        Ok(expired)
    }

    pub fn get(
        &self,
        ctx: &TenantContext,
        reservation_id: ReservationId,
    ) -> Result<Reservation, LedgerError> {
        self.repo
            .load(ctx.tenant_id(), &reservation_id)?
            .ok_or_else(|| LedgerError::not_found(format!("reservation {reservation_id}")))
    }

    pub fn list(&self, ctx: &TenantContext) -> Result<Vec<Reservation>, LedgerError> {
        Ok(self.repo.list(ctx.tenant_id())?)
    }

    /// Sum of Pending reservation quantities on one position.
    pub fn pending_quantity(
        &self,
        ctx: &TenantContext,
        product_id: ProductId,
        warehouse_id: WarehouseId,
    ) -> Result<Decimal, LedgerError> {
        let key = StockKey::new(ctx.tenant_id(), product_id, warehouse_id);
        Ok(self
            .list(ctx)?
            .iter()
            .filter(|r| r.status() == ReservationStatus::Pending && r.key() == Some(key))
            .map(|r| r.quantity())
            .sum())
    }

    fn stock_key(
        &self,
        ctx: &TenantContext,
        reservation_id: ReservationId,
    ) -> Result<StockKey, LedgerError> {
        self.get(ctx, reservation_id)?
            .key()
            .ok_or_else(|| LedgerError::not_found(format!("reservation {reservation_id}")))
    }

    fn release<F>(
        &self,
        ctx: &TenantContext,
        reservation_id: ReservationId,
        command: F,
    ) -> Result<Reservation, LedgerError>
    where
        F: FnOnce(DateTime<Utc>) -> ReservationCommand,
    {
        let key = self.stock_key(ctx, reservation_id)?;
        let guard = self.processor.lock(ctx, &[key])?;

        let mut reservation = self.get(ctx, reservation_id)?;
        let expected = ExpectedVersion::Exact(reservation.version());
        let mut uow = self.processor.unit_of_work(ctx, &guard);
        execute(&mut reservation, &command(uow.now()))?;
        uow.release(key, reservation.quantity())?;
        self.processor.commit(uow, None, &())?;
        self.repo
            .save(ctx.tenant_id(), reservation.clone(), expected)?;

        info!(
            reservation_id = %reservation_id,
            status = ?reservation.status(),
            "reservation released"
        );
        Ok(reservation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;
    use stockledger_core::{Clock, FixedClock, TenantId, UserId};
    use stockledger_events::{EventEnvelope, InMemoryEventBus};
    use stockledger_inventory::MovementRequest;

    use crate::catalog::InMemoryCatalog;
    use crate::config::LedgerConfig;
    use crate::ledger_store::InMemoryLedgerStore;
    use crate::repository::InMemoryRepository;

    struct Fixture {
        manager: ReservationManager,
        processor: Arc<MovementProcessor>,
        clock: Arc<FixedClock>,
        ctx: TenantContext,
        product: ProductId,
        warehouse: WarehouseId,
    }

    fn fixture(stock: Decimal) -> Fixture {
        let ctx = TenantContext::new(TenantId::new(), UserId::new());
        let product = ProductId::new();
        let warehouse = WarehouseId::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_product(ctx.tenant_id(), product, false);
        catalog.add_warehouse(ctx.tenant_id(), warehouse);
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()));
        let processor = Arc::new(MovementProcessor::new(
            Arc::new(InMemoryLedgerStore::new()),
            catalog,
            clock.clone(),
            Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new()),
            LedgerConfig::default(),
        ));
        processor
            .register_movement(
                &ctx,
                MovementRequest {
                    product_id: product,
                    warehouse_id: warehouse,
                    movement_type: MovementType::EntradaCompra,
                    quantity: stock,
                    unit_cost: dec!(4),
                    reference: "opening".to_string(),
                    idempotency_key: "opening".to_string(),
                    lot_id: None,
                },
            )
            .unwrap();
        let manager = ReservationManager::new(
            processor.clone(),
            Arc::new(InMemoryRepository::<Reservation>::new()),
        );
        Fixture {
            manager,
            processor,
            clock,
            ctx,
            product,
            warehouse,
        }
    }

    fn available(f: &Fixture) -> Decimal {
        f.processor
            .kardex()
            .available_for_sale(&f.ctx, f.product, f.warehouse)
            .unwrap()
    }

    fn reserve(f: &Fixture, qty: Decimal) -> Result<Reservation, LedgerError> {
        let expires = f.clock.now() + Duration::minutes(15);
        f.manager
            .create(&f.ctx, f.product, f.warehouse, qty, "SO-1", expires)
    }

    #[test]
    fn create_holds_available_stock() {
        let f = fixture(dec!(50));
        let reservation = reserve(&f, dec!(30)).unwrap();
        assert_eq!(reservation.status(), ReservationStatus::Pending);
        assert_eq!(available(&f), dec!(20));
        assert_eq!(
            f.manager.pending_quantity(&f.ctx, f.product, f.warehouse).unwrap(),
            dec!(30)
        );

        let err = reserve(&f, dec!(21)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
    }

    #[test]
    fn confirm_posts_one_outbound_and_consumes_the_hold() {
        let f = fixture(dec!(50));
        let reservation = reserve(&f, dec!(30)).unwrap();
        let movement = f
            .manager
            .confirm(&f.ctx, reservation.id_typed(), "confirm-1")
            .unwrap();
        assert_eq!(movement.movement_type, MovementType::SalidaVenta);
        assert_eq!(movement.quantity, dec!(-30));

        let position = f
            .processor
            .kardex()
            .position(&f.ctx, f.product, f.warehouse)
            .unwrap()
            .unwrap();
        assert_eq!(position.reserved(), Decimal::ZERO);
        assert_eq!(position.quantity(), dec!(20));

        let again = f
            .manager
            .confirm(&f.ctx, reservation.id_typed(), "confirm-1")
            .unwrap();
        assert_eq!(again, movement);
        let stored = f.manager.get(&f.ctx, reservation.id_typed()).unwrap();
        assert_eq!(stored.status(), ReservationStatus::Confirmed);
        assert_eq!(stored.movement_id(), Some(movement.id));
    }

    #[test]
    fn cancel_restores_availability_without_movements() {
        let f = fixture(dec!(50));
        let reservation = reserve(&f, dec!(30)).unwrap();
        f.manager.cancel(&f.ctx, reservation.id_typed()).unwrap();
        assert_eq!(available(&f), dec!(50));

        let key = StockKey::new(f.ctx.tenant_id(), f.product, f.warehouse);
        assert_eq!(f.processor.store().movements(&key).unwrap().len(), 1);

        let err = f
            .manager
            .confirm(&f.ctx, reservation.id_typed(), "late")
            .unwrap_err();
        assert!(matches!(err, LedgerError::WorkflowState(_)));
    }

    #[test]
    fn expire_requires_the_expiry_to_have_passed() {
        let f = fixture(dec!(10));
        let reservation = reserve(&f, dec!(4)).unwrap();
        let err = f.manager.expire(&f.ctx, reservation.id_typed()).unwrap_err();
        assert!(matches!(err, LedgerError::WorkflowState(_)));

        f.clock.advance(Duration::minutes(16));
        let expired = f.manager.expire(&f.ctx, reservation.id_typed()).unwrap();
        assert_eq!(expired.status(), ReservationStatus::Expired);
        assert_eq!(available(&f), dec!(10));
    }

    #[test]
    fn sweep_expires_only_due_reservations() {
        let f = fixture(dec!(10));
        let early = reserve(&f, dec!(2)).unwrap();
        f.clock.advance(Duration::minutes(10));
        let late = reserve(&f, dec!(3)).unwrap();

        let now = f.clock.now() + Duration::minutes(6);
        let expired = f.manager.expire_due(&f.ctx, now).unwrap();
        assert_eq!(expired, vec![early.id_typed()]);
        assert_eq!(
            f.manager.get(&f.ctx, late.id_typed()).unwrap().status(),
            ReservationStatus::Pending
        );
        assert_eq!(available(&f), dec!(7));
    }
}
