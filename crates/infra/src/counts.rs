//! Physical counts: freeze system quantities, record counts, reconcile the
//! differences through one Inventory adjustment.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::info;

use stockledger_core::{
    AggregateId, AggregateRoot, ExpectedVersion, ProductId, TenantContext, WarehouseId,
};
use stockledger_events::execute;
use stockledger_inventory::{
    AdjustmentType, CancelPhysicalCount, CountCommand, CreatePhysicalCount, FinishPhysicalCount,
    NewAdjustmentLine, PhysicalCount, PhysicalCountId, ReconcilePhysicalCount, RecordCount,
    StartPhysicalCount, StockKey,
};

use crate::adjustments::{AdjustmentWorkflow, stage_approval, stage_processing};
use crate::error::LedgerError;
use crate::idempotency::{IdempotencyScope, operations};
use crate::movement_processor::{Committed, MovementProcessor};
use crate::repository::DocumentRepository;

pub struct PhysicalCountWorkflow {
    processor: Arc<MovementProcessor>,
    repo: Arc<dyn DocumentRepository<PhysicalCount>>,
    adjustments: Arc<AdjustmentWorkflow>,
}

impl PhysicalCountWorkflow {
    pub fn new(
        processor: Arc<MovementProcessor>,
        repo: Arc<dyn DocumentRepository<PhysicalCount>>,
        adjustments: Arc<AdjustmentWorkflow>,
    ) -> Self {
        Self {
            processor,
            repo,
            adjustments,
        }
    }

    /// Plan a count of `products` in one warehouse.
    #[tracing::instrument(
        skip(self, ctx, reference, products),
        fields(tenant_id = %ctx.tenant_id())
    )]
    pub fn create(
        &self,
        ctx: &TenantContext,
        warehouse_id: WarehouseId,
        reference: &str,
        products: Vec<ProductId>,
    ) -> Result<PhysicalCount, LedgerError> {
        let tenant_id = ctx.tenant_id();
        let catalog = self.processor.catalog();
        if !catalog.warehouse_exists(tenant_id, warehouse_id) {
            return Err(LedgerError::UnknownAggregate(format!("warehouse {warehouse_id}")));
        }
        for product_id in &products {
            if !catalog.product_exists(tenant_id, *product_id) {
                return Err(LedgerError::UnknownAggregate(format!("product {product_id}")));
            }
            if catalog.is_lot_tracked(tenant_id, *product_id) {
                return Err(LedgerError::Validation(format!(
                    "product {product_id} is lot-tracked and cannot be counted in bulk"
                )));
            }
        }

        let count_id = PhysicalCountId::new(AggregateId::new());
        let mut count = PhysicalCount::empty(count_id);
        execute(
            &mut count,
            &CountCommand::Create(CreatePhysicalCount {
                tenant_id,
                count_id,
                warehouse_id,
                reference: reference.to_string(),
                products,
                created_by: ctx.actor(),
                occurred_at: self.processor.clock().now(),
            }),
        )?;
        self.repo
            .save(tenant_id, count.clone(), ExpectedVersion::NoneYet)?;
        info!(count_id = %count_id, lines = count.lines().len(), "physical count planned");
        Ok(count)
    }

    /// Freeze the current system quantity of every line. Taken under the
    /// stock locks so the snapshot is one consistent instant.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn start(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
    ) -> Result<PhysicalCount, LedgerError> {
        let keys = stock_keys(ctx, &self.get(ctx, count_id)?);
        let guard = self.processor.lock(ctx, &keys)?;

        let mut count = self.get(ctx, count_id)?;
        let expected = ExpectedVersion::Exact(count.version());
        let mut uow = self.processor.unit_of_work(ctx, &guard);
        let mut snapshot = Vec::with_capacity(keys.len());
        for key in &keys {
            snapshot.push((key.product_id, uow.balance(*key)?.quantity));
        }
        execute(
            &mut count,
            &CountCommand::Start(StartPhysicalCount {
                tenant_id: ctx.tenant_id(),
                count_id,
                snapshot,
                occurred_at: uow.now(),
            }),
        )?;
        self.repo
            .save(ctx.tenant_id(), count.clone(), expected)?;
        info!(count_id = %count_id, "physical count started");
        Ok(count)
    }

    pub fn record_count(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
        product_id: ProductId,
        counted_quantity: Decimal,
    ) -> Result<PhysicalCount, LedgerError> {
        self.transition(ctx, count_id, |now| {
            CountCommand::Record(RecordCount {
                tenant_id: ctx.tenant_id(),
                count_id,
                product_id,
                counted_quantity,
                occurred_at: now,
            })
        })
    }

    /// Close counting; every line must have been counted.
    pub fn finish(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
    ) -> Result<PhysicalCount, LedgerError> {
        self.transition(ctx, count_id, |now| {
            CountCommand::Finish(FinishPhysicalCount {
                tenant_id: ctx.tenant_id(),
                count_id,
                occurred_at: now,
            })
        })
    }

    pub fn cancel(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
    ) -> Result<PhysicalCount, LedgerError> {
        self.transition(ctx, count_id, |now| {
            CountCommand::Cancel(CancelPhysicalCount {
                tenant_id: ctx.tenant_id(),
                count_id,
                occurred_at: now,
            })
        })
    }

    /// Post every non-zero difference through one auto-approved Inventory
    /// adjustment, committed together with the count's transition.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn reconcile(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
        idempotency_key: &str,
    ) -> Result<PhysicalCount, LedgerError> {
        let scope = IdempotencyScope::new(
            ctx.tenant_id(),
            operations::RECONCILE_COUNT,
            idempotency_key,
        )?;
        if let Some(count) = self.processor.replay::<PhysicalCount>(&scope)? {
            return Ok(count);
        }

        let keys = stock_keys(ctx, &self.get(ctx, count_id)?);
        let guard = self.processor.lock(ctx, &keys)?;
        if let Some(count) = self.processor.replay::<PhysicalCount>(&scope)? {
            return Ok(count);
        }

        let mut count = self.get(ctx, count_id)?;
        let expected = ExpectedVersion::Exact(count.version());
        let warehouse_id = count
            .warehouse_id()
            .ok_or_else(|| LedgerError::not_found(format!("physical count {count_id}")))?;
        let lines: Vec<NewAdjustmentLine> = count
            .discrepancies()
            .into_iter()
            .filter_map(|line| {
                line.counted_quantity.map(|counted| NewAdjustmentLine {
                    product_id: line.product_id,
                    previous_quantity: line.system_quantity,
                    new_quantity: counted,
                    unit_cost: None,
                })
            })
            .collect();

        let mut uow = self.processor.unit_of_work(ctx, &guard);
        let adjustment = if lines.is_empty() {
            None
        } else {
            let reason = format!("physical count {}", count.reference());
            let mut adjustment =
                self.adjustments
                    .draft(ctx, warehouse_id, AdjustmentType::Inventory, &reason, lines)?;
            stage_approval(&uow, &mut adjustment, ctx.actor())?;
            stage_processing(&mut uow, &mut adjustment, &scope)?;
            Some(adjustment)
        };
        execute(
            &mut count,
            &CountCommand::Reconcile(ReconcilePhysicalCount {
                tenant_id: ctx.tenant_id(),
                count_id,
                adjustment_id: adjustment.as_ref().map(|a| a.id_typed()),
                occurred_at: uow.now(),
            }),
        )?;

        match self.processor.commit(uow, Some(&scope), &count)? {
            Committed::Applied => {
                if let Some(adjustment) = adjustment {
                    self.adjustments.insert(ctx, adjustment)?;
                }
                self.repo
                    .save(ctx.tenant_id(), count.clone(), expected)?;
                info!(
                    count_id = %count_id,
                    adjustment_id = ?count.adjustment_id(),
                    "physical count reconciled"
                );
                Ok(count)
            }
            Committed::Replayed(original) => Ok(original),
        }
    }

    pub fn get(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
    ) -> Result<PhysicalCount, LedgerError> {
        self.repo
            .load(ctx.tenant_id(), &count_id)?
            .ok_or_else(|| LedgerError::not_found(format!("physical count {count_id}")))
    }

    pub fn list(&self, ctx: &TenantContext) -> Result<Vec<PhysicalCount>, LedgerError> {
        Ok(self.repo.list(ctx.tenant_id())?)
    }

    fn transition<F>(
        &self,
        ctx: &TenantContext,
        count_id: PhysicalCountId,
        command: F,
    ) -> Result<PhysicalCount, LedgerError>
    where
        F: FnOnce(DateTime<Utc>) -> CountCommand,
    {
        let mut count = self.get(ctx, count_id)?;
        let expected = ExpectedVersion::Exact(count.version());
        execute(&mut count, &command(self.processor.clock().now()))?;
        self.repo
            .save(ctx.tenant_id(), count.clone(), expected)?;
        Ok(count)
    }
}

fn stock_keys(ctx: &TenantContext, count: &PhysicalCount) -> Vec<StockKey> {
    let Some(warehouse_id) = count.warehouse_id() else {
        return Vec::new();
    };
    let mut keys: Vec<StockKey> = count
        .product_ids()
        .into_iter()
        .map(|product_id| StockKey::new(ctx.tenant_id(), product_id, warehouse_id))
        .collect();
    keys.sort();
    keys
}
