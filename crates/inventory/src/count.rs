use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, ProductId, TenantId, UserId, WarehouseId,
};
use stockledger_events::Event;

use crate::adjustment::AdjustmentId;

/// Physical count identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhysicalCountId(pub AggregateId);

impl PhysicalCountId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for PhysicalCountId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Count lifecycle: Planned → InProgress → Finished → Adjusted.
/// Cancelled is reachable from Planned or InProgress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CountStatus {
    Planned,
    InProgress,
    Finished,
    Adjusted,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountLine {
    pub line_no: u32,
    pub product_id: ProductId,
    /// Frozen when the count starts.
    pub system_quantity: Decimal,
    pub counted_quantity: Option<Decimal>,
}

impl CountLine {
    /// `counted − system`, once counted.
    pub fn delta(&self) -> Option<Decimal> {
        self.counted_quantity
            .and_then(|c| c.checked_sub(self.system_quantity))
    }
}

/// Aggregate root: PhysicalCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalCount {
    id: PhysicalCountId,
    tenant_id: Option<TenantId>,
    warehouse_id: Option<WarehouseId>,
    reference: String,
    lines: Vec<CountLine>,
    status: CountStatus,
    adjustment_id: Option<AdjustmentId>,
    created_by: Option<UserId>,
    started_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl PhysicalCount {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: PhysicalCountId) -> Self {
        Self {
            id,
            tenant_id: None,
            warehouse_id: None,
            reference: String::new(),
            lines: Vec::new(),
            status: CountStatus::Planned,
            adjustment_id: None,
            created_by: None,
            started_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> PhysicalCountId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn lines(&self) -> &[CountLine] {
        &self.lines
    }

    pub fn status(&self) -> CountStatus {
        self.status
    }

    /// Adjustment produced by reconciliation, if any delta was found.
    pub fn adjustment_id(&self) -> Option<AdjustmentId> {
        self.adjustment_id
    }

    pub fn created_by(&self) -> Option<UserId> {
        self.created_by
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn product_ids(&self) -> Vec<ProductId> {
        self.lines.iter().map(|l| l.product_id).collect()
    }

    /// Counted lines whose count differs from the frozen system quantity.
    pub fn discrepancies(&self) -> Vec<&CountLine> {
        self.lines
            .iter()
            .filter(|l| l.delta().is_some_and(|d| !d.is_zero()))
            .collect()
    }
}

impl AggregateRoot for PhysicalCount {
    type Id = PhysicalCountId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePhysicalCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePhysicalCount {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub warehouse_id: WarehouseId,
    pub reference: String,
    pub products: Vec<ProductId>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartPhysicalCount. `snapshot` holds the system quantity per product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPhysicalCount {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub snapshot: Vec<(ProductId, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCount {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub product_id: ProductId,
    pub counted_quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FinishPhysicalCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishPhysicalCount {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReconcilePhysicalCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilePhysicalCount {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub adjustment_id: Option<AdjustmentId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelPhysicalCount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelPhysicalCount {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountCommand {
    Create(CreatePhysicalCount),
    Start(StartPhysicalCount),
    Record(RecordCount),
    Finish(FinishPhysicalCount),
    Reconcile(ReconcilePhysicalCount),
    Cancel(CancelPhysicalCount),
}

/// Event: CountCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCreated {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub warehouse_id: WarehouseId,
    pub reference: String,
    pub lines: Vec<CountLine>,
    pub created_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountStarted (frozen system quantities, by line).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountStarted {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub system_quantities: Vec<(u32, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRecorded {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub line_no: u32,
    pub counted_quantity: Decimal,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountFinished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountFinished {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountReconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountReconciled {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub adjustment_id: Option<AdjustmentId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: CountCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountCancelled {
    pub tenant_id: TenantId,
    pub count_id: PhysicalCountId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountEvent {
    Created(CountCreated),
    Started(CountStarted),
    Recorded(CountRecorded),
    Finished(CountFinished),
    Reconciled(CountReconciled),
    Cancelled(CountCancelled),
}

impl Event for CountEvent {
    fn event_type(&self) -> &'static str {
        match self {
            CountEvent::Created(_) => "inventory.count.created",
            CountEvent::Started(_) => "inventory.count.started",
            CountEvent::Recorded(_) => "inventory.count.recorded",
            CountEvent::Finished(_) => "inventory.count.finished",
            CountEvent::Reconciled(_) => "inventory.count.reconciled",
            CountEvent::Cancelled(_) => "inventory.count.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CountEvent::Created(e) => e.occurred_at,
            CountEvent::Started(e) => e.occurred_at,
            CountEvent::Recorded(e) => e.occurred_at,
            CountEvent::Finished(e) => e.occurred_at,
            CountEvent::Reconciled(e) => e.occurred_at,
            CountEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PhysicalCount {
    type Command = CountCommand;
    type Event = CountEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CountEvent::Created(e) => {
                self.id = e.count_id;
                self.tenant_id = Some(e.tenant_id);
                self.warehouse_id = Some(e.warehouse_id);
                self.reference = e.reference.clone();
                self.lines = e.lines.clone();
                self.created_by = Some(e.created_by);
                self.status = CountStatus::Planned;
                self.created = true;
            }
            CountEvent::Started(e) => {
                for (line_no, qty) in &e.system_quantities {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == *line_no) {
                        line.system_quantity = *qty;
                    }
                }
                self.started_at = Some(e.occurred_at);
                self.status = CountStatus::InProgress;
            }
            CountEvent::Recorded(e) => {
                if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == e.line_no) {
                    line.counted_quantity = Some(e.counted_quantity);
                }
            }
            CountEvent::Finished(_) => {
                self.status = CountStatus::Finished;
            }
            CountEvent::Reconciled(e) => {
                self.adjustment_id = e.adjustment_id;
                self.status = CountStatus::Adjusted;
            }
            CountEvent::Cancelled(_) => {
                self.status = CountStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CountCommand::Create(cmd) => self.handle_create(cmd),
            CountCommand::Start(cmd) => self.handle_start(cmd),
            CountCommand::Record(cmd) => self.handle_record(cmd),
            CountCommand::Finish(cmd) => {
                self.ensure_status(cmd.tenant_id, cmd.count_id, CountStatus::InProgress, "finish")?;
                if let Some(line) = self.lines.iter().find(|l| l.counted_quantity.is_none()) {
                    return Err(DomainError::workflow(format!(
                        "line {} has not been counted",
                        line.line_no
                    )));
                }
                Ok(vec![CountEvent::Finished(CountFinished {
                    tenant_id: cmd.tenant_id,
                    count_id: cmd.count_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            CountCommand::Reconcile(cmd) => {
                self.ensure_status(
                    cmd.tenant_id,
                    cmd.count_id,
                    CountStatus::Finished,
                    "reconcile",
                )?;
                if self.discrepancies().is_empty() != cmd.adjustment_id.is_none() {
                    return Err(DomainError::invariant(
                        "an adjustment is required exactly when the count has discrepancies",
                    ));
                }
                Ok(vec![CountEvent::Reconciled(CountReconciled {
                    tenant_id: cmd.tenant_id,
                    count_id: cmd.count_id,
                    adjustment_id: cmd.adjustment_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            CountCommand::Cancel(cmd) => {
                self.ensure_existing(cmd.tenant_id, cmd.count_id)?;
                if !matches!(self.status, CountStatus::Planned | CountStatus::InProgress) {
                    return Err(self.wrong_state("cancel"));
                }
                Ok(vec![CountEvent::Cancelled(CountCancelled {
                    tenant_id: cmd.tenant_id,
                    count_id: cmd.count_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl PhysicalCount {
    fn ensure_existing(
        &self,
        tenant_id: TenantId,
        count_id: PhysicalCountId,
    ) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != count_id {
            return Err(DomainError::invariant("count_id mismatch"));
        }
        Ok(())
    }

    fn wrong_state(&self, action: &str) -> DomainError {
        DomainError::workflow(format!("cannot {action} a count in status {:?}", self.status))
    }

    fn ensure_status(
        &self,
        tenant_id: TenantId,
        count_id: PhysicalCountId,
        expected: CountStatus,
        action: &str,
    ) -> Result<(), DomainError> {
        self.ensure_existing(tenant_id, count_id)?;
        if self.status != expected {
            return Err(self.wrong_state(action));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreatePhysicalCount) -> Result<Vec<CountEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("physical count already exists"));
        }
        if cmd.products.is_empty() {
            return Err(DomainError::validation("count must have at least one line"));
        }
        let mut seen = HashSet::new();
        for product_id in &cmd.products {
            if !seen.insert(*product_id) {
                return Err(DomainError::validation(format!(
                    "product {product_id} appears on more than one line"
                )));
            }
        }

        let lines = cmd
            .products
            .iter()
            .enumerate()
            .map(|(idx, product_id)| CountLine {
                line_no: (idx + 1) as u32,
                product_id: *product_id,
                system_quantity: Decimal::ZERO,
                counted_quantity: None,
            })
            .collect();

        Ok(vec![CountEvent::Created(CountCreated {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            warehouse_id: cmd.warehouse_id,
            reference: cmd.reference.clone(),
            lines,
            created_by: cmd.created_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start(&self, cmd: &StartPhysicalCount) -> Result<Vec<CountEvent>, DomainError> {
        self.ensure_status(cmd.tenant_id, cmd.count_id, CountStatus::Planned, "start")?;

        let snapshot: HashMap<ProductId, Decimal> = cmd.snapshot.iter().copied().collect();
        let system_quantities = self
            .lines
            .iter()
            .map(|line| {
                snapshot
                    .get(&line.product_id)
                    .map(|qty| (line.line_no, *qty))
                    .ok_or_else(|| {
                        DomainError::invariant(format!(
                            "snapshot is missing product {}",
                            line.product_id
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(vec![CountEvent::Started(CountStarted {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            system_quantities,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_record(&self, cmd: &RecordCount) -> Result<Vec<CountEvent>, DomainError> {
        self.ensure_status(
            cmd.tenant_id,
            cmd.count_id,
            CountStatus::InProgress,
            "record counts on",
        )?;
        if cmd.counted_quantity < Decimal::ZERO {
            return Err(DomainError::validation("counted quantity cannot be negative"));
        }
        let line = self
            .lines
            .iter()
            .find(|l| l.product_id == cmd.product_id)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "product {} is not part of this count",
                    cmd.product_id
                ))
            })?;
        if cmd.counted_quantity.checked_sub(line.system_quantity).is_none() {
            return Err(DomainError::validation(
                "count discrepancy exceeds the supported decimal range",
            ));
        }

        Ok(vec![CountEvent::Recorded(CountRecorded {
            tenant_id: cmd.tenant_id,
            count_id: cmd.count_id,
            line_no: line.line_no,
            counted_quantity: cmd.counted_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}
