//! Stock adjustments: approval workflow and posting of deltas.

use std::sync::Arc;

use tracing::info;

use stockledger_core::{
    AggregateId, AggregateRoot, ExpectedVersion, TenantContext, UserId, WarehouseId,
};
use stockledger_events::execute;
use stockledger_inventory::{
    Adjustment, AdjustmentCommand, AdjustmentEvent, AdjustmentId, AdjustmentStatus,
    AdjustmentType, ApproveAdjustment, CreateAdjustment, NewAdjustmentLine, ProcessAdjustment,
    RejectAdjustment, StockKey,
};

use crate::error::LedgerError;
use crate::idempotency::{IdempotencyScope, operations};
use crate::movement_processor::{Committed, MovementProcessor};
use crate::repository::DocumentRepository;
use crate::unit_of_work::{PostingLine, UnitOfWork};

pub struct AdjustmentWorkflow {
    processor: Arc<MovementProcessor>,
    repo: Arc<dyn DocumentRepository<Adjustment>>,
}

impl AdjustmentWorkflow {
    pub fn new(
        processor: Arc<MovementProcessor>,
        repo: Arc<dyn DocumentRepository<Adjustment>>,
    ) -> Self {
        Self { processor, repo }
    }

    /// Register an adjustment awaiting approval. Requested by `ctx.actor()`.
    #[tracing::instrument(skip(self, ctx, reason, lines), fields(tenant_id = %ctx.tenant_id()))]
    pub fn create(
        &self,
        ctx: &TenantContext,
        warehouse_id: WarehouseId,
        adjustment_type: AdjustmentType,
        reason: &str,
        lines: Vec<NewAdjustmentLine>,
    ) -> Result<Adjustment, LedgerError> {
        let adjustment = self.draft(ctx, warehouse_id, adjustment_type, reason, lines)?;
        self.repo
            .save(ctx.tenant_id(), adjustment.clone(), ExpectedVersion::NoneYet)?;
        info!(adjustment_id = %adjustment.id_typed(), "adjustment created");
        Ok(adjustment)
    }

    /// Approve as `ctx.actor()`. Whether that user may approve is the
    /// caller's authorization concern.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn approve(
        &self,
        ctx: &TenantContext,
        adjustment_id: AdjustmentId,
    ) -> Result<Adjustment, LedgerError> {
        self.decide(ctx, adjustment_id, |now| {
            AdjustmentCommand::Approve(ApproveAdjustment {
                tenant_id: ctx.tenant_id(),
                adjustment_id,
                approver: ctx.actor(),
                occurred_at: now,
            })
        })
    }

    #[tracing::instrument(skip(self, ctx, reason), fields(tenant_id = %ctx.tenant_id()))]
    pub fn reject(
        &self,
        ctx: &TenantContext,
        adjustment_id: AdjustmentId,
        reason: &str,
    ) -> Result<Adjustment, LedgerError> {
        self.decide(ctx, adjustment_id, |now| {
            AdjustmentCommand::Reject(RejectAdjustment {
                tenant_id: ctx.tenant_id(),
                adjustment_id,
                approver: ctx.actor(),
                reason: reason.to_string(),
                occurred_at: now,
            })
        })
    }

    /// Post one AjustePositivo/AjusteNegativo per non-zero line delta.
    ///
    /// A Processed adjustment always answers `AlreadyProcessed`, whatever
    /// idempotency key is supplied.
    #[tracing::instrument(skip(self, ctx), fields(tenant_id = %ctx.tenant_id()))]
    pub fn process(
        &self,
        ctx: &TenantContext,
        adjustment_id: AdjustmentId,
        idempotency_key: &str,
    ) -> Result<Adjustment, LedgerError> {
        let adjustment = self.get(ctx, adjustment_id)?;
        if adjustment.status() == AdjustmentStatus::Processed {
            return Err(LedgerError::AlreadyProcessed);
        }
        let scope = IdempotencyScope::new(
            ctx.tenant_id(),
            operations::PROCESS_ADJUSTMENT,
            idempotency_key,
        )?;
        if let Some(processed) = self.processor.replay::<Adjustment>(&scope)? {
            return Ok(processed);
        }

        let keys = stock_keys(ctx, &adjustment);
        let guard = self.processor.lock(ctx, &keys)?;
        let mut adjustment = self.get(ctx, adjustment_id)?;
        if adjustment.status() == AdjustmentStatus::Processed {
            return Err(LedgerError::AlreadyProcessed);
        }
        if let Some(processed) = self.processor.replay::<Adjustment>(&scope)? {
            return Ok(processed);
        }

        let expected = ExpectedVersion::Exact(adjustment.version());
        let mut uow = self.processor.unit_of_work(ctx, &guard);
        stage_processing(&mut uow, &mut adjustment, &scope)?;

        match self.processor.commit(uow, Some(&scope), &adjustment)? {
            Committed::Applied => {
                self.repo
                    .save(ctx.tenant_id(), adjustment.clone(), expected)?;
                info!(
                    adjustment_id = %adjustment_id,
                    postings = adjustment.postings().len(),
                    "adjustment processed"
                );
                Ok(adjustment)
            }
            Committed::Replayed(original) => Ok(original),
        }
    }

    pub fn get(
        &self,
        ctx: &TenantContext,
        adjustment_id: AdjustmentId,
    ) -> Result<Adjustment, LedgerError> {
        self.repo
            .load(ctx.tenant_id(), &adjustment_id)?
            .ok_or_else(|| LedgerError::not_found(format!("adjustment {adjustment_id}")))
    }

    pub fn list(&self, ctx: &TenantContext) -> Result<Vec<Adjustment>, LedgerError> {
        Ok(self.repo.list(ctx.tenant_id())?)
    }

    /// Validated, unsaved PendingApproval adjustment.
    pub(crate) fn draft(
        &self,
        ctx: &TenantContext,
        warehouse_id: WarehouseId,
        adjustment_type: AdjustmentType,
        reason: &str,
        lines: Vec<NewAdjustmentLine>,
    ) -> Result<Adjustment, LedgerError> {
        let tenant_id = ctx.tenant_id();
        let catalog = self.processor.catalog();
        if !catalog.warehouse_exists(tenant_id, warehouse_id) {
            return Err(LedgerError::UnknownAggregate(format!("warehouse {warehouse_id}")));
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
                    "product {} is lot-tracked; adjust lots with explicit movements",
                    line.product_id
                )));
            }
        }

        let adjustment_id = AdjustmentId::new(AggregateId::new());
        let mut adjustment = Adjustment::empty(adjustment_id);
        execute(
            &mut adjustment,
            &AdjustmentCommand::Create(CreateAdjustment {
                tenant_id,
                adjustment_id,
                warehouse_id,
                adjustment_type,
                reason: reason.to_string(),
                lines,
                requested_by: ctx.actor(),
                occurred_at: self.processor.clock().now(),
            }),
        )?;
        Ok(adjustment)
    }

    /// Store an adjustment created inside another workflow's commit.
    pub(crate) fn insert(
        &self,
        ctx: &TenantContext,
        adjustment: Adjustment,
    ) -> Result<(), LedgerError> {
        Ok(self
            .repo
            .save(ctx.tenant_id(), adjustment, ExpectedVersion::NoneYet)?)
    }

    fn decide<F>(
        &self,
        ctx: &TenantContext,
        adjustment_id: AdjustmentId,
        command: F,
    ) -> Result<Adjustment, LedgerError>
    where
        F: FnOnce(chrono::DateTime<chrono::Utc>) -> AdjustmentCommand,
    {
        let mut adjustment = self.get(ctx, adjustment_id)?;
        let expected = ExpectedVersion::Exact(adjustment.version());
        execute(&mut adjustment, &command(self.processor.clock().now()))?;
        self.repo
            .save(ctx.tenant_id(), adjustment.clone(), expected)?;
        info!(
            adjustment_id = %adjustment_id,
            status = ?adjustment.status(),
            "adjustment decided"
        );
        Ok(adjustment)
    }
}

/// Approve `adjustment` as `approver` inside a unit of work.
pub(crate) fn stage_approval(
    uow: &UnitOfWork<'_>,
    adjustment: &mut Adjustment,
    approver: UserId,
) -> Result<(), LedgerError> {
    let adjustment_id = adjustment.id_typed();
    execute(
        adjustment,
        &AdjustmentCommand::Approve(ApproveAdjustment {
            tenant_id: uow.tenant_id(),
            adjustment_id,
            approver,
            occurred_at: uow.now(),
        }),
    )?;
    Ok(())
}

/// Transition an Approved adjustment to Processed and stage its movements.
///
/// Lines without a unit cost are valued at the position's staged average.
pub(crate) fn stage_processing(
    uow: &mut UnitOfWork<'_>,
    adjustment: &mut Adjustment,
    scope: &IdempotencyScope,
) -> Result<(), LedgerError> {
    let adjustment_id = adjustment.id_typed();
    let events = execute(
        adjustment,
        &AdjustmentCommand::Process(ProcessAdjustment {
            tenant_id: uow.tenant_id(),
            adjustment_id,
            occurred_at: uow.now(),
        }),
    )?;

    for event in &events {
        let AdjustmentEvent::Processed(processed) = event else {
            continue;
        };
        for posting in &processed.postings {
            let key = uow.key(posting.product_id, processed.warehouse_id);
            let unit_cost = match posting.unit_cost {
                Some(cost) => cost,
                None => uow.balance(key)?.average_cost,
            };
            uow.post(
                PostingLine::new(
                    posting.product_id,
                    processed.warehouse_id,
                    posting.movement_type,
                    posting.quantity,
                    unit_cost,
                )
                .with_reference(format!("ADJ-{adjustment_id}"))
                .with_idempotency_key(scope.line_key(posting.line_no)),
            )?;
        }
    }
    Ok(())
}

fn stock_keys(ctx: &TenantContext, adjustment: &Adjustment) -> Vec<StockKey> {
    let Some(warehouse_id) = adjustment.warehouse_id() else {
        return Vec::new();
    };
    adjustment
        .lines()
        .iter()
        .map(|l| StockKey::new(ctx.tenant_id(), l.product_id, warehouse_id))
        .collect()
}
