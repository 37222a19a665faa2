//! Integration tests for the full ledger pipeline.
//!
//! Tests: workflow service → UnitOfWork → LedgerStore → KardexQuery
//!
//! Verifies:
//! - The position always equals the replay of its movement log
//! - Idempotency keys hold under retries and under concurrent submission
//! - Contended keys serialize without losing or inventing stock
//! - Tenant isolation is preserved

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;

    use stockledger_core::{FixedClock, ProductId, TenantContext, TenantId, UserId, WarehouseId};
    use stockledger_events::{EventEnvelope, InMemoryEventBus};
    use stockledger_inventory::{
        Adjustment, AdjustmentType, Movement, MovementRequest, MovementType, NewAdjustmentLine,
        NewTransferLine, Reservation, StockKey, Transfer,
    };

    use crate::adjustments::AdjustmentWorkflow;
    use crate::catalog::InMemoryCatalog;
    use crate::config::LedgerConfig;
    use crate::error::LedgerError;
    use crate::ledger_store::{InMemoryLedgerStore, LedgerStore};
    use crate::movement_processor::MovementProcessor;
    use crate::repository::InMemoryRepository;
    use crate::reservations::ReservationManager;
    use crate::transfers::TransferWorkflow;

    struct Harness {
        processor: Arc<MovementProcessor>,
        store: Arc<InMemoryLedgerStore>,
        catalog: Arc<InMemoryCatalog>,
        clock: Arc<FixedClock>,
        ctx: TenantContext,
        product: ProductId,
        warehouse: WarehouseId,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
    }

    fn harness() -> Harness {
        stockledger_observability::init();
        let ctx = TenantContext::new(TenantId::new(), UserId::new());
        let product = ProductId::new();
        let warehouse = WarehouseId::new();
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_product(ctx.tenant_id(), product, false);
        catalog.add_warehouse(ctx.tenant_id(), warehouse);
        let store = Arc::new(InMemoryLedgerStore::new());
        let clock = Arc::new(FixedClock::new(start()));
        let config = LedgerConfig {
            lock_timeout: Duration::from_secs(10),
            ..LedgerConfig::default()
        };
        let processor = Arc::new(MovementProcessor::new(
            store.clone(),
            catalog.clone(),
            clock.clone(),
            Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new()),
            config,
        ));
        Harness {
            processor,
            store,
            catalog,
            clock,
            ctx,
            product,
            warehouse,
        }
    }

    impl Harness {
        fn key(&self) -> StockKey {
            StockKey::new(self.ctx.tenant_id(), self.product, self.warehouse)
        }

        fn request(
            &self,
            movement_type: MovementType,
            quantity: Decimal,
            unit_cost: Decimal,
            key: &str,
        ) -> MovementRequest {
            MovementRequest {
                product_id: self.product,
                warehouse_id: self.warehouse,
                movement_type,
                quantity,
                unit_cost,
                reference: format!("ref-{key}"),
                idempotency_key: key.to_string(),
                lot_id: None,
            }
        }

        fn post(
            &self,
            movement_type: MovementType,
            quantity: Decimal,
            unit_cost: Decimal,
            key: &str,
        ) -> Result<Movement, LedgerError> {
            self.processor
                .register_movement(&self.ctx, self.request(movement_type, quantity, unit_cost, key))
        }

        fn movement_rows(&self) -> usize {
            self.store.movements(&self.key()).unwrap().len()
        }

        fn quantity(&self) -> Decimal {
            self.store
                .position(&self.key())
                .unwrap()
                .map_or(Decimal::ZERO, |p| p.quantity())
        }

        fn reservations(&self) -> ReservationManager {
            ReservationManager::new(
                self.processor.clone(),
                Arc::new(InMemoryRepository::<Reservation>::new()),
            )
        }
    }

    #[test]
    fn weighted_average_after_second_receipt() {
        let h = harness();
        h.post(MovementType::EntradaCompra, dec!(10), dec!(100), "po-1").unwrap();
        let second = h
            .post(MovementType::EntradaCompra, dec!(5), dec!(130), "po-2")
            .unwrap();

        assert_eq!(second.balance_after.quantity, dec!(15));
        assert_eq!(second.balance_after.average_cost, dec!(110.00));
    }

    #[test]
    fn same_key_with_different_payload_returns_first_result() {
        let h = harness();
        let first = h
            .post(MovementType::EntradaCompra, dec!(10), dec!(4), "dup")
            .unwrap();
        let second = h
            .post(MovementType::EntradaCompra, dec!(999), dec!(1), "dup")
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(h.movement_rows(), 1);
        assert_eq!(h.quantity(), dec!(10));
    }

    #[test]
    fn insufficient_stock_leaves_no_trace() {
        let h = harness();
        h.post(MovementType::EntradaCompra, dec!(20), dec!(3), "po").unwrap();
        let before = h.store.position(&h.key()).unwrap();

        let err = h
            .post(MovementType::SalidaVenta, dec!(40), Decimal::ZERO, "so")
            .unwrap_err();

        assert_eq!(
            err,
            LedgerError::InsufficientStock {
                requested: dec!(40),
                available: dec!(20)
            }
        );
        assert_eq!(h.movement_rows(), 1);
        assert_eq!(h.store.position(&h.key()).unwrap(), before);
        // A failed attempt does not burn the key.
        h.post(MovementType::SalidaVenta, dec!(5), Decimal::ZERO, "so").unwrap();
        assert_eq!(h.quantity(), dec!(15));
    }

    #[test]
    fn receipt_too_large_to_value_is_rejected() {
        let h = harness();

        let err = h
            .post(
                MovementType::EntradaCompra,
                dec!(100000000000000000000),
                dec!(10000000000),
                "big",
            )
            .unwrap_err();

        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(h.movement_rows(), 0);
        assert_eq!(h.quantity(), Decimal::ZERO);
        h.post(MovementType::EntradaCompra, dec!(2), dec!(5), "big").unwrap();
        assert_eq!(h.movement_rows(), 1);
    }

    #[test]
    fn reservation_confirm_and_cancel_paths() {
        let h = harness();
        let kardex = h.processor.kardex();
        let reservations = h.reservations();
        h.post(MovementType::EntradaCompra, dec!(50), dec!(2), "po").unwrap();
        let expires = start() + chrono::Duration::hours(4);

        let held = reservations
            .create(&h.ctx, h.product, h.warehouse, dec!(30), "SO-9", expires)
            .unwrap();
        assert_eq!(
            kardex.available_for_sale(&h.ctx, h.product, h.warehouse).unwrap(),
            dec!(20)
        );
        assert_eq!(h.quantity(), dec!(50));

        let movement = reservations.confirm(&h.ctx, held.id_typed(), "confirm-9").unwrap();
        assert_eq!(movement.movement_type, MovementType::SalidaVenta);
        assert_eq!(movement.quantity, dec!(-30));
        assert_eq!(h.movement_rows(), 2);
        let position = kardex.position(&h.ctx, h.product, h.warehouse).unwrap().unwrap();
        assert_eq!(position.reserved(), Decimal::ZERO);
        assert_eq!(position.quantity(), dec!(20));

        let other = reservations
            .create(&h.ctx, h.product, h.warehouse, dec!(20), "SO-10", expires)
            .unwrap();
        assert_eq!(
            kardex.available_for_sale(&h.ctx, h.product, h.warehouse).unwrap(),
            Decimal::ZERO
        );
        reservations.cancel(&h.ctx, other.id_typed()).unwrap();
        assert_eq!(h.movement_rows(), 2);
        assert_eq!(
            kardex.available_for_sale(&h.ctx, h.product, h.warehouse).unwrap(),
            dec!(20)
        );
    }

    #[test]
    fn transfer_send_is_all_or_nothing() {
        let h = harness();
        let second_product = ProductId::new();
        let destination = WarehouseId::new();
        h.catalog.add_product(h.ctx.tenant_id(), second_product, false);
        h.catalog.add_warehouse(h.ctx.tenant_id(), destination);
        h.post(MovementType::EntradaCompra, dec!(10), dec!(1), "po").unwrap();
        let transfers = TransferWorkflow::new(
            h.processor.clone(),
            Arc::new(InMemoryRepository::<Transfer>::new()),
        );

        let transfer = transfers
            .create(
                &h.ctx,
                h.warehouse,
                destination,
                "TR-1",
                vec![
                    NewTransferLine {
                        product_id: h.product,
                        quantity: dec!(5),
                    },
                    NewTransferLine {
                        product_id: second_product,
                        quantity: dec!(1),
                    },
                ],
            )
            .unwrap();
        let err = transfers.send(&h.ctx, transfer.id_typed(), "send-1").unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(h.movement_rows(), 1);
        assert_eq!(h.quantity(), dec!(10));
        assert_eq!(h.store.positions(h.ctx.tenant_id()).unwrap().len(), 1);
    }

    #[test]
    fn adjustment_processes_exactly_once() {
        let h = harness();
        h.post(MovementType::EntradaCompra, dec!(10), dec!(6), "po").unwrap();
        let adjustments = AdjustmentWorkflow::new(
            h.processor.clone(),
            Arc::new(InMemoryRepository::<Adjustment>::new()),
        );
        let adjustment = adjustments
            .create(
                &h.ctx,
                h.warehouse,
                AdjustmentType::Spoilage,
                "water damage",
                vec![NewAdjustmentLine {
                    product_id: h.product,
                    previous_quantity: dec!(10),
                    new_quantity: dec!(7),
                    unit_cost: None,
                }],
            )
            .unwrap();
        adjustments.approve(&h.ctx, adjustment.id_typed()).unwrap();
        adjustments
            .process(&h.ctx, adjustment.id_typed(), "adj-1")
            .unwrap();

        let again = adjustments.process(&h.ctx, adjustment.id_typed(), "adj-2");
        assert_eq!(again.unwrap_err(), LedgerError::AlreadyProcessed);
        assert_eq!(h.movement_rows(), 2);
        assert_eq!(h.quantity(), dec!(7));
    }

    #[test]
    fn kardex_window_opens_at_prior_balance() {
        let h = harness();
        let mut posted = Vec::new();
        for (n, (movement_type, qty, cost)) in [
            (MovementType::EntradaCompra, dec!(10), dec!(100)),
            (MovementType::EntradaCompra, dec!(5), dec!(130)),
            (MovementType::SalidaVenta, dec!(3), Decimal::ZERO),
            (MovementType::EntradaCompra, dec!(8), dec!(90)),
        ]
        .into_iter()
        .enumerate()
        {
            posted.push(h.post(movement_type, qty, cost, &format!("m-{n}")).unwrap());
            h.clock.advance(chrono::Duration::days(1));
        }

        let from = posted[2].occurred_at + chrono::Duration::hours(1);
        let report = h
            .processor
            .kardex()
            .kardex(&h.ctx, h.product, h.warehouse, Some(from), None)
            .unwrap();

        assert_eq!(report.opening_balance, posted[2].balance_after);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.closing_balance, posted[3].balance_after);
    }

    #[test]
    fn contended_outbound_never_oversells() {
        let h = harness();
        h.post(MovementType::EntradaCompra, dec!(50), dec!(1), "po").unwrap();

        let handles: Vec<_> = (0..80)
            .map(|n| {
                let processor = h.processor.clone();
                let ctx = h.ctx;
                let request = h.request(
                    MovementType::SalidaVenta,
                    dec!(1),
                    Decimal::ZERO,
                    &format!("so-{n}"),
                );
                thread::spawn(move || processor.register_movement(&ctx, request))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientStock { .. })))
            .count();
        assert_eq!(accepted, 50);
        assert_eq!(rejected, 30);
        assert_eq!(h.quantity(), Decimal::ZERO);
        assert_eq!(h.movement_rows(), 51);

        let mut sequences: Vec<u64> = h
            .store
            .movements(&h.key())
            .unwrap()
            .iter()
            .map(|m| m.sequence)
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (1..=51).collect::<Vec<u64>>());
    }

    #[test]
    fn concurrent_retries_of_one_key_post_once() {
        let h = harness();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let processor = h.processor.clone();
                let ctx = h.ctx;
                let request = h.request(MovementType::EntradaCompra, dec!(3), dec!(9), "shared");
                thread::spawn(move || processor.register_movement(&ctx, request))
            })
            .collect();
        let results: Vec<Movement> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();

        assert!(results.iter().all(|m| m == &results[0]));
        assert_eq!(h.movement_rows(), 1);
        assert_eq!(h.quantity(), dec!(3));
    }

    #[test]
    fn tenants_do_not_see_each_other() {
        let h = harness();
        h.post(MovementType::EntradaCompra, dec!(10), dec!(1), "po").unwrap();
        let intruder = TenantContext::new(TenantId::new(), UserId::new());

        let kardex = h.processor.kardex();
        assert!(kardex.position(&intruder, h.product, h.warehouse).unwrap().is_none());
        let report = kardex
            .kardex(&intruder, h.product, h.warehouse, None, None)
            .unwrap();
        assert!(report.entries.is_empty());

        // Same key string under another tenant is a different operation.
        let err = h
            .processor
            .register_movement(
                &intruder,
                h.request(MovementType::EntradaCompra, dec!(1), dec!(1), "po"),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::UnknownAggregate(_)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        In(i64, i64),
        Out(i64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (1i64..500, 1i64..10_000).prop_map(|(q, c)| Step::In(q, c)),
            (1i64..500).prop_map(Step::Out),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: whatever sequence is accepted, the live position equals
        /// the replay of its movement log and the sum of signed quantities.
        #[test]
        fn position_matches_replayed_ledger(steps in prop::collection::vec(step(), 1..30)) {
            let h = harness();
            let mut expected = Decimal::ZERO;

            for (n, step) in steps.iter().enumerate() {
                let key = format!("p-{n}");
                let outcome = match step {
                    Step::In(q, c) => h.post(
                        MovementType::EntradaCompra,
                        Decimal::from(*q),
                        Decimal::new(*c, 2),
                        &key,
                    ),
                    Step::Out(q) => h.post(
                        MovementType::SalidaVenta,
                        Decimal::from(*q),
                        Decimal::ZERO,
                        &key,
                    ),
                };
                match outcome {
                    Ok(movement) => expected += movement.quantity,
                    Err(LedgerError::InsufficientStock { .. }) => {}
                    Err(other) => prop_assert!(false, "unexpected error {other:?}"),
                }
            }

            let live = h.store.position(&h.key()).unwrap();
            let replayed = h
                .processor
                .kardex()
                .verify_position(&h.ctx, h.product, h.warehouse)
                .unwrap();
            let sum: Decimal = h
                .store
                .movements(&h.key())
                .unwrap()
                .iter()
                .map(|m| m.quantity)
                .sum();

            prop_assert_eq!(sum, expected);
            prop_assert_eq!(replayed.quantity, expected);
            if let Some(position) = live {
                prop_assert_eq!(position.quantity(), expected);
                prop_assert_eq!(position.average_cost(), replayed.average_cost);
                prop_assert!(position.quantity() >= Decimal::ZERO);
            }
        }
    }
}
