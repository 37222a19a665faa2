//! Inter-warehouse transfers.
//!
//! Every stock-moving action (send, receive, cancel) locks all origin and
//! destination keys of the transfer in the global key order, stages every
//! line in one unit of work, and commits all lines or none.

use std::sync::Arc;

use tracing::info;

use stockledger_core::{AggregateId, AggregateRoot, ExpectedVersion, TenantContext, WarehouseId};
use stockledger_events::execute;
use stockledger_inventory::{
    CancelTransfer, CreateTransfer, LineReceipt, MovementType, NewTransferLine, ReceiveTransfer,
    SendTransfer, StockKey, Transfer, TransferCommand, TransferEvent, TransferId, TransferLeg,
};

use crate::error::LedgerError;
use crate::idempotency::{IdempotencyScope, operations};
use crate::movement_processor::{Committed, MovementProcessor};
use crate::repository::DocumentRepository;
use crate::unit_of_work::{PostingLine, UnitOfWork};

pub struct TransferWorkflow {
    processor: Arc<MovementProcessor>,
    repo: Arc<dyn DocumentRepository<Transfer>>,
}

impl TransferWorkflow {
    pub fn new(
        processor: Arc<MovementProcessor>,
        repo: Arc<dyn DocumentRepository<Transfer>>,
    ) -> Self {
        Self { processor, repo }
    }

    /// Register a Pending transfer. No stock moves.
    #[tracing::instrument(skip(self, ctx, reference, lines), fields(tenant_id = %ctx.tenant_id()))]
    pub fn create(
        &self,
        ctx: &TenantContext,
        origin: WarehouseId,
        destination: WarehouseId,
        reference: &str,
        lines: Vec<NewTransferLine>,
    ) -> Result<Transfer, LedgerError> {
        let tenant_id = ctx.tenant_id();
        let catalog = self.processor.catalog();
        for warehouse_id in [origin, destination] {
            if !catalog.warehouse_exists(tenant_id, warehouse_id) {
                return Err(LedgerError::UnknownAggregate(format!("warehouse {warehouse_id}")));
            }
        }
        for line in &lines {
            if !catalog.product_exists(tenant_id, line.product_id) {
                return Err(LedgerError::UnknownAggregate(format!(
                    "product {}",
                    line.product_id
                )));
            }
            if catalog.is_lot_tracked(tenant_id, line.product_id) {
                return Err(LedgerError::Validation(format!(
                    "product {} is lot-tracked; move lots with explicit movements",
                    line.product_id
                )));
            }
        }

        let transfer_id = TransferId::new(AggregateId::new());
        let mut transfer = Transfer::empty(transfer_id);
        execute(
            &mut transfer,
            &TransferCommand::Create(CreateTransfer {
                tenant_id,
                transfer_id,
                origin,
                destination,
                reference: reference.to_string(),
                lines,
                requested_by: ctx.actor(),
                occurred_at: self.processor.clock().now(),
            }),
        )?;
        self.repo
            .save(tenant_id, transfer.clone(), ExpectedVersion::NoneYet)?;

        info!(transfer_id = %transfer_id, lines = transfer.lines().len(), "transfer created");
        Ok(transfer)
    }

    /// Post the outbound leg of every line at the origin, valued at the
    /// origin's average cost. Any insufficient line fails the whole send.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn send(
        &self,
        ctx: &TenantContext,
        transfer_id: TransferId,
        idempotency_key: &str,
    ) -> Result<Transfer, LedgerError> {
        self.act(
            ctx,
            transfer_id,
            operations::SEND_TRANSFER,
            idempotency_key,
            |uow, transfer, scope| {
                let origin = origin_of(transfer)?;
                let mut line_costs = Vec::with_capacity(transfer.lines().len());
                for line in transfer.lines() {
                    let key = StockKey::new(uow.tenant_id(), line.product_id, origin);
                    line_costs.push((line.line_no, uow.balance(key)?.average_cost));
                }
                let events = execute(
                    transfer,
                    &TransferCommand::Send(SendTransfer {
                        tenant_id: uow.tenant_id(),
                        transfer_id,
                        line_costs,
                        occurred_at: uow.now(),
                    }),
                )?;
                for event in &events {
                    if let TransferEvent::Sent(sent) = event {
                        post_legs(
                            uow,
                            &sent.legs,
                            sent.origin,
                            MovementType::TransferenciaSalida,
                            transfer.reference(),
                            scope,
                        )?;
                    }
                }
                Ok(())
            },
        )
    }

    /// Post inbound legs at the destination for the received quantities.
    #[tracing::instrument(skip(self, ctx, receipts), fields(tenant_id = %ctx.tenant_id()))]
    pub fn receive(
        &self,
        ctx: &TenantContext,
        transfer_id: TransferId,
        receipts: Vec<LineReceipt>,
        idempotency_key: &str,
    ) -> Result<Transfer, LedgerError> {
        self.act(
            ctx,
            transfer_id,
            operations::RECEIVE_TRANSFER,
            idempotency_key,
            move |uow, transfer, scope| {
                let events = execute(
                    transfer,
                    &TransferCommand::Receive(ReceiveTransfer {
                        tenant_id: uow.tenant_id(),
                        transfer_id,
                        receipts,
                        occurred_at: uow.now(),
                    }),
                )?;
                for event in &events {
                    if let TransferEvent::Received(received) = event {
                        post_legs(
                            uow,
                            &received.legs,
                            received.destination,
                            MovementType::TransferenciaEntrada,
                            transfer.reference(),
                            scope,
                        )?;
                    }
                }
                Ok(())
            },
        )
    }

    /// Cancel a Pending transfer, or an InTransit one by returning the sent
    /// quantities to the origin.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn cancel(
        &self,
        ctx: &TenantContext,
        transfer_id: TransferId,
        idempotency_key: &str,
    ) -> Result<Transfer, LedgerError> {
        self.act(
            ctx,
            transfer_id,
            operations::CANCEL_TRANSFER,
            idempotency_key,
            |uow, transfer, scope| {
                let events = execute(
                    transfer,
                    &TransferCommand::Cancel(CancelTransfer {
                        tenant_id: uow.tenant_id(),
                        transfer_id,
                        occurred_at: uow.now(),
                    }),
                )?;
                for event in &events {
                    if let TransferEvent::Cancelled(cancelled) = event {
                        post_legs(
                            uow,
                            &cancelled.reversed,
                            cancelled.origin,
                            MovementType::TransferenciaEntrada,
                            transfer.reference(),
                            scope,
                        )?;
                    }
                }
                Ok(())
            },
        )
    }

    pub fn get(
        &self,
        ctx: &TenantContext,
        transfer_id: TransferId,
    ) -> Result<Transfer, LedgerError> {
        self.repo
            .load(ctx.tenant_id(), &transfer_id)?
            .ok_or_else(|| LedgerError::not_found(format!("transfer {transfer_id}")))
    }

    pub fn list(&self, ctx: &TenantContext) -> Result<Vec<Transfer>, LedgerError> {
        Ok(self.repo.list(ctx.tenant_id())?)
    }

    /// Shared pipeline of the stock-moving actions: replay, lock, reload,
    /// stage, commit, save.
    fn act<F>(
        &self,
        ctx: &TenantContext,
        transfer_id: TransferId,
        operation: &str,
        idempotency_key: &str,
        stage: F,
    ) -> Result<Transfer, LedgerError>
    where
        F: FnOnce(&mut UnitOfWork<'_>, &mut Transfer, &IdempotencyScope) -> Result<(), LedgerError>,
    {
        let scope = IdempotencyScope::new(ctx.tenant_id(), operation, idempotency_key)?;
        if let Some(transfer) = self.processor.replay::<Transfer>(&scope)? {
            return Ok(transfer);
        }

        let keys = self.get(ctx, transfer_id)?.stock_keys();
        let guard = self.processor.lock(ctx, &keys)?;
        if let Some(transfer) = self.processor.replay::<Transfer>(&scope)? {
            return Ok(transfer);
        }

        let mut transfer = self.get(ctx, transfer_id)?;
        let expected = ExpectedVersion::Exact(transfer.version());
        let mut uow = self.processor.unit_of_work(ctx, &guard);
        stage(&mut uow, &mut transfer, &scope)?;

        match self.processor.commit(uow, Some(&scope), &transfer)? {
            Committed::Applied => {
                self.repo
                    .save(ctx.tenant_id(), transfer.clone(), expected)?;
                info!(
                    transfer_id = %transfer_id,
                    operation,
                    status = ?transfer.status(),
                    "transfer updated"
                );
                Ok(transfer)
            }
            Committed::Replayed(original) => Ok(original),
        }
    }
}

fn origin_of(transfer: &Transfer) -> Result<WarehouseId, LedgerError> {
    transfer
        .origin()
        .ok_or_else(|| LedgerError::not_found(format!("transfer {}", transfer.id_typed())))
}

fn post_legs(
    uow: &mut UnitOfWork<'_>,
    legs: &[TransferLeg],
    warehouse_id: WarehouseId,
    movement_type: MovementType,
    reference: &str,
    scope: &IdempotencyScope,
) -> Result<(), LedgerError> {
    for leg in legs {
        uow.post(
            PostingLine::new(
                leg.product_id,
                warehouse_id,
                movement_type,
                leg.quantity,
                leg.unit_cost,
            )
            .with_reference(reference)
            .with_idempotency_key(scope.line_key(leg.line_no)),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use serde_json::Value as JsonValue;
    use stockledger_core::{FixedClock, ProductId, TenantId, UserId};
    use stockledger_events::{EventEnvelope, InMemoryEventBus};
    use stockledger_inventory::{MovementRequest, TransferStatus};

    use crate::catalog::InMemoryCatalog;
    use crate::config::LedgerConfig;
    use crate::ledger_store::InMemoryLedgerStore;
    use crate::repository::InMemoryRepository;

    struct Fixture {
        workflow: TransferWorkflow,
        processor: Arc<MovementProcessor>,
        ctx: TenantContext,
        origin: WarehouseId,
        destination: WarehouseId,
        apples: ProductId,
        pears: ProductId,
    }

    fn fixture() -> Fixture {
        let ctx = TenantContext::new(TenantId::new(), UserId::new());
        let (origin, destination) = (WarehouseId::new(), WarehouseId::new());
        let (apples, pears) = (ProductId::new(), ProductId::new());
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_warehouse(ctx.tenant_id(), origin);
        catalog.add_warehouse(ctx.tenant_id(), destination);
        catalog.add_product(ctx.tenant_id(), apples, false);
        catalog.add_product(ctx.tenant_id(), pears, false);
        let processor = Arc::new(MovementProcessor::new(
            Arc::new(InMemoryLedgerStore::new()),
            catalog,
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 2, 2, 12, 0, 0).unwrap())),
            Arc::new(InMemoryEventBus::<EventEnvelope<JsonValue>>::new()),
            LedgerConfig::default(),
        ));
        let workflow = TransferWorkflow::new(
            processor.clone(),
            Arc::new(InMemoryRepository::<Transfer>::new()),
        );
        Fixture {
            workflow,
            processor,
            ctx,
            origin,
            destination,
            apples,
            pears,
        }
    }

    fn stock(f: &Fixture, product: ProductId, qty: Decimal, cost: Decimal) {
        f.processor
            .register_movement(
                &f.ctx,
                MovementRequest {
                    product_id: product,
                    warehouse_id: f.origin,
                    movement_type: MovementType::EntradaCompra,
                    quantity: qty,
                    unit_cost: cost,
                    reference: "stock".to_string(),
                    idempotency_key: format!("stock-{product}"),
                    lot_id: None,
                },
            )
            .unwrap();
    }

    fn quantity(f: &Fixture, product: ProductId, warehouse: WarehouseId) -> Decimal {
        f.processor
            .kardex()
            .position(&f.ctx, product, warehouse)
            .unwrap()
            .map_or(Decimal::ZERO, |p| p.quantity())
    }

    fn two_lines(f: &Fixture, apples: Decimal, pears: Decimal) -> Transfer {
        f.workflow
            .create(
                &f.ctx,
                f.origin,
                f.destination,
                "TR-1",
                vec![
                    NewTransferLine {
                        product_id: f.apples,
                        quantity: apples,
                    },
                    NewTransferLine {
                        product_id: f.pears,
                        quantity: pears,
                    },
                ],
            )
            .unwrap()
    }

    #[test]
    fn send_then_partial_then_full_receipt() {
        let f = fixture();
        stock(&f, f.apples, dec!(10), dec!(3));
        stock(&f, f.pears, dec!(10), dec!(5));
        let transfer = two_lines(&f, dec!(4), dec!(6));

        let sent = f.workflow.send(&f.ctx, transfer.id_typed(), "send-1").unwrap();
        assert_eq!(sent.status(), TransferStatus::InTransit);
        assert_eq!(sent.line(1).unwrap().unit_cost, dec!(3));
        assert_eq!(quantity(&f, f.apples, f.origin), dec!(6));
        assert_eq!(quantity(&f, f.pears, f.origin), dec!(4));

        let partial = f
            .workflow
            .receive(
                &f.ctx,
                transfer.id_typed(),
                vec![LineReceipt {
                    line_no: 1,
                    quantity: dec!(4),
                }],
                "recv-1",
            )
            .unwrap();
        assert_eq!(partial.status(), TransferStatus::PartiallyReceived);

        let done = f
            .workflow
            .receive(
                &f.ctx,
                transfer.id_typed(),
                vec![LineReceipt {
                    line_no: 2,
                    quantity: dec!(6),
                }],
                "recv-2",
            )
            .unwrap();
        assert_eq!(done.status(), TransferStatus::Received);
        assert_eq!(quantity(&f, f.pears, f.destination), dec!(6));

        let position = f
            .processor
            .kardex()
            .position(&f.ctx, f.pears, f.destination)
            .unwrap()
            .unwrap();
        assert_eq!(position.average_cost(), dec!(5));
    }

    #[test]
    fn insufficient_line_aborts_the_whole_send() {
        let f = fixture();
        stock(&f, f.apples, dec!(10), dec!(3));
        stock(&f, f.pears, dec!(2), dec!(5));
        let transfer = two_lines(&f, dec!(4), dec!(6));

        let err = f
            .workflow
            .send(&f.ctx, transfer.id_typed(), "send-1")
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientStock { .. }));
        assert_eq!(quantity(&f, f.apples, f.origin), dec!(10));
        let key = StockKey::new(f.ctx.tenant_id(), f.apples, f.origin);
        assert_eq!(f.processor.store().movements(&key).unwrap().len(), 1);
        assert_eq!(
            f.workflow.get(&f.ctx, transfer.id_typed()).unwrap().status(),
            TransferStatus::Pending
        );
    }

    #[test]
    fn over_receipt_is_rejected() {
        let f = fixture();
        stock(&f, f.apples, dec!(10), dec!(3));
        stock(&f, f.pears, dec!(10), dec!(5));
        let transfer = two_lines(&f, dec!(4), dec!(6));
        f.workflow.send(&f.ctx, transfer.id_typed(), "send-1").unwrap();

        let err = f
            .workflow
            .receive(
                &f.ctx,
                transfer.id_typed(),
                vec![LineReceipt {
                    line_no: 1,
                    quantity: dec!(5),
                }],
                "recv-1",
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
        assert_eq!(quantity(&f, f.apples, f.destination), Decimal::ZERO);
    }

    #[test]
    fn cancel_in_transit_returns_stock_to_origin() {
        let f = fixture();
        stock(&f, f.apples, dec!(10), dec!(3));
        stock(&f, f.pears, dec!(10), dec!(5));
        let transfer = two_lines(&f, dec!(4), dec!(6));
        f.workflow.send(&f.ctx, transfer.id_typed(), "send-1").unwrap();

        let cancelled = f
            .workflow
            .cancel(&f.ctx, transfer.id_typed(), "cancel-1")
            .unwrap();
        assert_eq!(cancelled.status(), TransferStatus::Cancelled);
        assert_eq!(quantity(&f, f.apples, f.origin), dec!(10));
        assert_eq!(quantity(&f, f.pears, f.origin), dec!(10));

        let again = f
            .workflow
            .cancel(&f.ctx, transfer.id_typed(), "cancel-1")
            .unwrap();
        assert_eq!(again, cancelled);
        let err = f
            .workflow
            .cancel(&f.ctx, transfer.id_typed(), "cancel-2")
            .unwrap_err();
        assert!(matches!(err, LedgerError::WorkflowState(_)));
    }

    #[test]
    fn duplicate_send_key_is_replayed() {
        let f = fixture();
        stock(&f, f.apples, dec!(10), dec!(3));
        stock(&f, f.pears, dec!(10), dec!(5));
        let transfer = two_lines(&f, dec!(1), dec!(1));
        let first = f.workflow.send(&f.ctx, transfer.id_typed(), "send-1").unwrap();
        let second = f.workflow.send(&f.ctx, transfer.id_typed(), "send-1").unwrap();
        assert_eq!(first, second);
        assert_eq!(quantity(&f, f.apples, f.origin), dec!(9));
    }

    #[test]
    fn same_origin_and_destination_is_rejected() {
        let f = fixture();
        let err = f
            .workflow
            .create(
                &f.ctx,
                f.origin,
                f.origin,
                "TR-X",
                vec![NewTransferLine {
                    product_id: f.apples,
                    quantity: dec!(1),
                }],
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }
}
