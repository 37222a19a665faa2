use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, ProductId, TenantId, UserId, WarehouseId,
};
use stockledger_events::Event;

use crate::movement::MovementType;

/// Adjustment identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdjustmentId(pub AggregateId);

impl AdjustmentId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for AdjustmentId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Why the stock is being adjusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    Inventory,
    Discrepancy,
    Spoilage,
    Theft,
    Donation,
    Sample,
    Production,
    Disposal,
}

/// Adjustment lifecycle: PendingApproval → {Approved, Rejected}; Approved → Processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentStatus {
    PendingApproval,
    Approved,
    Rejected,
    Processed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub previous_quantity: Decimal,
    pub new_quantity: Decimal,
    /// Cost for positive deltas; `None` means the position's average cost.
    pub unit_cost: Option<Decimal>,
}

impl AdjustmentLine {
    /// Signed change: `new − previous`.
    pub fn delta(&self) -> Decimal {
        self.new_quantity - self.previous_quantity
    }
}

/// One movement to post when the adjustment is processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentPosting {
    pub line_no: u32,
    pub product_id: ProductId,
    pub movement_type: MovementType,
    /// Absolute quantity (> 0).
    pub quantity: Decimal,
    pub unit_cost: Option<Decimal>,
}

/// Aggregate root: Adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjustment {
    id: AdjustmentId,
    tenant_id: Option<TenantId>,
    warehouse_id: Option<WarehouseId>,
    adjustment_type: AdjustmentType,
    reason: String,
    lines: Vec<AdjustmentLine>,
    status: AdjustmentStatus,
    requested_by: Option<UserId>,
    decided_by: Option<UserId>,
    rejection_reason: Option<String>,
    version: u64,
    created: bool,
}

impl Adjustment {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: AdjustmentId) -> Self {
        Self {
            id,
            tenant_id: None,
            warehouse_id: None,
            adjustment_type: AdjustmentType::Inventory,
            reason: String::new(),
            lines: Vec::new(),
            status: AdjustmentStatus::PendingApproval,
            requested_by: None,
            decided_by: None,
            rejection_reason: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AdjustmentId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn adjustment_type(&self) -> AdjustmentType {
        self.adjustment_type
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn lines(&self) -> &[AdjustmentLine] {
        &self.lines
    }

    pub fn status(&self) -> AdjustmentStatus {
        self.status
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.requested_by
    }

    /// Approver or rejecter.
    pub fn decided_by(&self) -> Option<UserId> {
        self.decided_by
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Movements `process` would post: one per non-zero delta line.
    pub fn postings(&self) -> Vec<AdjustmentPosting> {
        self.lines
            .iter()
            .filter(|l| !l.delta().is_zero())
            .map(|l| {
                let delta = l.delta();
                AdjustmentPosting {
                    line_no: l.line_no,
                    product_id: l.product_id,
                    movement_type: if delta > Decimal::ZERO {
                        MovementType::AjustePositivo
                    } else {
                        MovementType::AjusteNegativo
                    },
                    quantity: delta.abs(),
                    unit_cost: l.unit_cost,
                }
            })
            .collect()
    }
}

impl AggregateRoot for Adjustment {
    type Id = AdjustmentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAdjustmentLine {
    pub product_id: ProductId,
    pub previous_quantity: Decimal,
    pub new_quantity: Decimal,
    pub unit_cost: Option<Decimal>,
}

/// Command: CreateAdjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAdjustment {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub warehouse_id: WarehouseId,
    pub adjustment_type: AdjustmentType,
    pub reason: String,
    pub lines: Vec<NewAdjustmentLine>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApproveAdjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproveAdjustment {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub approver: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RejectAdjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectAdjustment {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub approver: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ProcessAdjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessAdjustment {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentCommand {
    Create(CreateAdjustment),
    Approve(ApproveAdjustment),
    Reject(RejectAdjustment),
    Process(ProcessAdjustment),
}

/// Event: AdjustmentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentCreated {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub warehouse_id: WarehouseId,
    pub adjustment_type: AdjustmentType,
    pub reason: String,
    pub lines: Vec<AdjustmentLine>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AdjustmentApproved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentApproved {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub approver: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AdjustmentRejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentRejected {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub approver: UserId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AdjustmentProcessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentProcessed {
    pub tenant_id: TenantId,
    pub adjustment_id: AdjustmentId,
    pub warehouse_id: WarehouseId,
    pub postings: Vec<AdjustmentPosting>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdjustmentEvent {
    Created(AdjustmentCreated),
    Approved(AdjustmentApproved),
    Rejected(AdjustmentRejected),
    Processed(AdjustmentProcessed),
}

impl Event for AdjustmentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            AdjustmentEvent::Created(_) => "inventory.adjustment.created",
            AdjustmentEvent::Approved(_) => "inventory.adjustment.approved",
            AdjustmentEvent::Rejected(_) => "inventory.adjustment.rejected",
            AdjustmentEvent::Processed(_) => "inventory.adjustment.processed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            AdjustmentEvent::Created(e) => e.occurred_at,
            AdjustmentEvent::Approved(e) => e.occurred_at,
            AdjustmentEvent::Rejected(e) => e.occurred_at,
            AdjustmentEvent::Processed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Adjustment {
    type Command = AdjustmentCommand;
    type Event = AdjustmentEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            AdjustmentEvent::Created(e) => {
                self.id = e.adjustment_id;
                self.tenant_id = Some(e.tenant_id);
                self.warehouse_id = Some(e.warehouse_id);
                self.adjustment_type = e.adjustment_type;
                self.reason = e.reason.clone();
                self.lines = e.lines.clone();
                self.requested_by = Some(e.requested_by);
                self.status = AdjustmentStatus::PendingApproval;
                self.created = true;
            }
            AdjustmentEvent::Approved(e) => {
                self.status = AdjustmentStatus::Approved;
                self.decided_by = Some(e.approver);
            }
            AdjustmentEvent::Rejected(e) => {
                self.status = AdjustmentStatus::Rejected;
                self.decided_by = Some(e.approver);
                self.rejection_reason = Some(e.reason.clone());
            }
            AdjustmentEvent::Processed(_) => {
                self.status = AdjustmentStatus::Processed;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            AdjustmentCommand::Create(cmd) => self.handle_create(cmd),
            AdjustmentCommand::Approve(cmd) => {
                self.ensure_pending(cmd.tenant_id, cmd.adjustment_id, "approve")?;
                Ok(vec![AdjustmentEvent::Approved(AdjustmentApproved {
                    tenant_id: cmd.tenant_id,
                    adjustment_id: cmd.adjustment_id,
                    approver: cmd.approver,
                    occurred_at: cmd.occurred_at,
                })])
            }
            AdjustmentCommand::Reject(cmd) => {
                self.ensure_pending(cmd.tenant_id, cmd.adjustment_id, "reject")?;
                if cmd.reason.trim().is_empty() {
                    return Err(DomainError::validation("rejection reason is required"));
                }
                Ok(vec![AdjustmentEvent::Rejected(AdjustmentRejected {
                    tenant_id: cmd.tenant_id,
                    adjustment_id: cmd.adjustment_id,
                    approver: cmd.approver,
                    reason: cmd.reason.clone(),
                    occurred_at: cmd.occurred_at,
                })])
            }
            AdjustmentCommand::Process(cmd) => self.handle_process(cmd),
        }
    }
}

impl Adjustment {
    fn ensure_existing(
        &self,
        tenant_id: TenantId,
        adjustment_id: AdjustmentId,
    ) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != adjustment_id {
            return Err(DomainError::invariant("adjustment_id mismatch"));
        }
        Ok(())
    }

    fn ensure_pending(
        &self,
        tenant_id: TenantId,
        adjustment_id: AdjustmentId,
        action: &str,
    ) -> Result<(), DomainError> {
        self.ensure_existing(tenant_id, adjustment_id)?;
        if self.status != AdjustmentStatus::PendingApproval {
            return Err(DomainError::workflow(format!(
                "cannot {action} an adjustment in status {:?}",
                self.status
            )));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateAdjustment) -> Result<Vec<AdjustmentEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("adjustment already exists"));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("adjustment must have at least one line"));
        }

        let mut seen = HashSet::new();
        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, line) in cmd.lines.iter().enumerate() {
            if line.previous_quantity < Decimal::ZERO || line.new_quantity < Decimal::ZERO {
                return Err(DomainError::validation("adjustment quantities cannot be negative"));
            }
            if line.unit_cost.is_some_and(|c| c < Decimal::ZERO) {
                return Err(DomainError::validation("unit cost cannot be negative"));
            }
            if !seen.insert(line.product_id) {
                return Err(DomainError::validation(format!(
                    "product {} appears on more than one line",
                    line.product_id
                )));
            }
            lines.push(AdjustmentLine {
                line_no: (idx + 1) as u32,
                product_id: line.product_id,
                previous_quantity: line.previous_quantity,
                new_quantity: line.new_quantity,
                unit_cost: line.unit_cost,
            });
        }

        Ok(vec![AdjustmentEvent::Created(AdjustmentCreated {
            tenant_id: cmd.tenant_id,
            adjustment_id: cmd.adjustment_id,
            warehouse_id: cmd.warehouse_id,
            adjustment_type: cmd.adjustment_type,
            reason: cmd.reason.clone(),
            lines,
            requested_by: cmd.requested_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_process(&self, cmd: &ProcessAdjustment) -> Result<Vec<AdjustmentEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.adjustment_id)?;
        match self.status {
            AdjustmentStatus::Approved => {}
            AdjustmentStatus::Processed => return Err(DomainError::AlreadyProcessed),
            other => {
                return Err(DomainError::workflow(format!(
                    "cannot process an adjustment in status {other:?}"
                )));
            }
        }
        let warehouse_id = self.warehouse_id.ok_or_else(DomainError::not_found)?;

        Ok(vec![AdjustmentEvent::Processed(AdjustmentProcessed {
            tenant_id: cmd.tenant_id,
            adjustment_id: cmd.adjustment_id,
            warehouse_id,
            postings: self.postings(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
