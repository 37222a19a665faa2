use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{
    Aggregate, AggregateId, AggregateRoot, DomainError, ProductId, TenantId, UserId, WarehouseId,
};
use stockledger_events::Event;

use crate::movement::validate_quantity;
use crate::position::StockKey;

/// Transfer identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub AggregateId);

impl TransferId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for TransferId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Transfer lifecycle.
///
/// ```text
/// Pending ──send──> InTransit ──receive──> PartiallyReceived ──receive──> Received
///    │                  │   └──────────────receive (all lines)───────────────┘
///    └──cancel──> Cancelled <──cancel──┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    InTransit,
    PartiallyReceived,
    Received,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub requested: Decimal,
    pub sent: Decimal,
    pub received: Decimal,
    /// Origin average cost at send time; the destination receives at this cost.
    pub unit_cost: Decimal,
}

impl TransferLine {
    pub fn outstanding(&self) -> Decimal {
        self.sent - self.received
    }

    pub fn is_fully_received(&self) -> bool {
        self.received >= self.sent
    }
}

/// Aggregate root: Transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    id: TransferId,
    tenant_id: Option<TenantId>,
    origin: Option<WarehouseId>,
    destination: Option<WarehouseId>,
    reference: String,
    requested_by: Option<UserId>,
    lines: Vec<TransferLine>,
    status: TransferStatus,
    version: u64,
    created: bool,
}

impl Transfer {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: TransferId) -> Self {
        Self {
            id,
            tenant_id: None,
            origin: None,
            destination: None,
            reference: String::new(),
            requested_by: None,
            lines: Vec::new(),
            status: TransferStatus::Pending,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> TransferId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn origin(&self) -> Option<WarehouseId> {
        self.origin
    }

    pub fn destination(&self) -> Option<WarehouseId> {
        self.destination
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn requested_by(&self) -> Option<UserId> {
        self.requested_by
    }

    pub fn lines(&self) -> &[TransferLine] {
        &self.lines
    }

    pub fn line(&self, line_no: u32) -> Option<&TransferLine> {
        self.lines.iter().find(|l| l.line_no == line_no)
    }

    pub fn status(&self) -> TransferStatus {
        self.status
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Stock keys touched by any action on this transfer (origin and
    /// destination for every line), sorted.
    pub fn stock_keys(&self) -> Vec<StockKey> {
        let (Some(tenant_id), Some(origin), Some(destination)) =
            (self.tenant_id, self.origin, self.destination)
        else {
            return Vec::new();
        };
        let mut keys: Vec<StockKey> = self
            .lines
            .iter()
            .flat_map(|l| {
                [
                    StockKey::new(tenant_id, l.product_id, origin),
                    StockKey::new(tenant_id, l.product_id, destination),
                ]
            })
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

impl AggregateRoot for Transfer {
    type Id = TransferId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransferLine {
    pub product_id: ProductId,
    pub quantity: Decimal,
}

/// Quantity received for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReceipt {
    pub line_no: u32,
    pub quantity: Decimal,
}

/// Command: CreateTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: WarehouseId,
    pub destination: WarehouseId,
    pub reference: String,
    pub lines: Vec<NewTransferLine>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SendTransfer.
///
/// `line_costs` carries the origin average cost per line, read under lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub line_costs: Vec<(u32, Decimal)>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReceiveTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub receipts: Vec<LineReceipt>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelTransfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTransfer {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCommand {
    Create(CreateTransfer),
    Send(SendTransfer),
    Receive(ReceiveTransfer),
    Cancel(CancelTransfer),
}

/// One leg of stock moved for a line (sent, received or reversed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
}

/// Event: TransferCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCreated {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: WarehouseId,
    pub destination: WarehouseId,
    pub reference: String,
    pub lines: Vec<TransferLine>,
    pub requested_by: UserId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferSent (one outbound leg per line at origin).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSent {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: WarehouseId,
    pub legs: Vec<TransferLeg>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferReceived (inbound legs at destination).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceived {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub destination: WarehouseId,
    pub legs: Vec<TransferLeg>,
    pub fully_received: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Event: TransferCancelled. `reversed` is empty when nothing was sent yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub tenant_id: TenantId,
    pub transfer_id: TransferId,
    pub origin: WarehouseId,
    pub reversed: Vec<TransferLeg>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferEvent {
    Created(TransferCreated),
    Sent(TransferSent),
    Received(TransferReceived),
    Cancelled(TransferCancelled),
}

impl Event for TransferEvent {
    fn event_type(&self) -> &'static str {
        match self {
            TransferEvent::Created(_) => "inventory.transfer.created",
            TransferEvent::Sent(_) => "inventory.transfer.sent",
            TransferEvent::Received(_) => "inventory.transfer.received",
            TransferEvent::Cancelled(_) => "inventory.transfer.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            TransferEvent::Created(e) => e.occurred_at,
            TransferEvent::Sent(e) => e.occurred_at,
            TransferEvent::Received(e) => e.occurred_at,
            TransferEvent::Cancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Transfer {
    type Command = TransferCommand;
    type Event = TransferEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            TransferEvent::Created(e) => {
                self.id = e.transfer_id;
                self.tenant_id = Some(e.tenant_id);
                self.origin = Some(e.origin);
                self.destination = Some(e.destination);
                self.reference = e.reference.clone();
                self.requested_by = Some(e.requested_by);
                self.lines = e.lines.clone();
                self.status = TransferStatus::Pending;
                self.created = true;
            }
            TransferEvent::Sent(e) => {
                for leg in &e.legs {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == leg.line_no) {
                        line.sent = leg.quantity;
                        line.unit_cost = leg.unit_cost;
                    }
                }
                self.status = TransferStatus::InTransit;
            }
            TransferEvent::Received(e) => {
                for leg in &e.legs {
                    if let Some(line) = self.lines.iter_mut().find(|l| l.line_no == leg.line_no) {
                        line.received += leg.quantity;
                    }
                }
                self.status = if e.fully_received {
                    TransferStatus::Received
                } else {
                    TransferStatus::PartiallyReceived
                };
            }
            TransferEvent::Cancelled(_) => {
                self.status = TransferStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            TransferCommand::Create(cmd) => self.handle_create(cmd),
            TransferCommand::Send(cmd) => self.handle_send(cmd),
            TransferCommand::Receive(cmd) => self.handle_receive(cmd),
            TransferCommand::Cancel(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Transfer {
    fn ensure_existing(
        &self,
        tenant_id: TenantId,
        transfer_id: TransferId,
    ) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != transfer_id {
            return Err(DomainError::invariant("transfer_id mismatch"));
        }
        Ok(())
    }

    fn wrong_state(&self, action: &str) -> DomainError {
        DomainError::workflow(format!("cannot {action} a transfer in status {:?}", self.status))
    }

    fn handle_create(&self, cmd: &CreateTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("transfer already exists"));
        }
        if cmd.origin == cmd.destination {
            return Err(DomainError::validation(
                "origin and destination warehouses must differ",
            ));
        }
        if cmd.lines.is_empty() {
            return Err(DomainError::validation("transfer must have at least one line"));
        }

        let mut seen = HashSet::new();
        let mut lines = Vec::with_capacity(cmd.lines.len());
        for (idx, line) in cmd.lines.iter().enumerate() {
            validate_quantity(line.quantity)?;
            if !seen.insert(line.product_id) {
                return Err(DomainError::validation(format!(
                    "product {} appears on more than one line",
                    line.product_id
                )));
            }
            lines.push(TransferLine {
                line_no: (idx + 1) as u32,
                product_id: line.product_id,
                requested: line.quantity,
                sent: Decimal::ZERO,
                received: Decimal::ZERO,
                unit_cost: Decimal::ZERO,
            });
        }

        Ok(vec![TransferEvent::Created(TransferCreated {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            origin: cmd.origin,
            destination: cmd.destination,
            reference: cmd.reference.clone(),
            lines,
            requested_by: cmd.requested_by,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_send(&self, cmd: &SendTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.transfer_id)?;
        if self.status != TransferStatus::Pending {
            return Err(self.wrong_state("send"));
        }
        let origin = self.origin.ok_or_else(DomainError::not_found)?;

        let legs = self
            .lines
            .iter()
            .map(|line| {
                let unit_cost = cmd
                    .line_costs
                    .iter()
                    .find(|(no, _)| *no == line.line_no)
                    .map(|(_, cost)| *cost)
                    .unwrap_or(Decimal::ZERO);
                TransferLeg {
                    line_no: line.line_no,
                    product_id: line.product_id,
                    quantity: line.requested,
                    unit_cost,
                }
            })
            .collect();

        Ok(vec![TransferEvent::Sent(TransferSent {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            origin,
            legs,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_receive(&self, cmd: &ReceiveTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.transfer_id)?;
        if !matches!(
            self.status,
            TransferStatus::InTransit | TransferStatus::PartiallyReceived
        ) {
            return Err(self.wrong_state("receive"));
        }
        if cmd.receipts.is_empty() {
            return Err(DomainError::validation("receipt must name at least one line"));
        }
        let destination = self.destination.ok_or_else(DomainError::not_found)?;

        let mut seen = HashSet::new();
        let mut legs = Vec::with_capacity(cmd.receipts.len());
        for receipt in &cmd.receipts {
            let line = self.line(receipt.line_no).ok_or_else(|| {
                DomainError::validation(format!("unknown transfer line {}", receipt.line_no))
            })?;
            if !seen.insert(receipt.line_no) {
                return Err(DomainError::validation(format!(
                    "line {} received twice in one receipt",
                    receipt.line_no
                )));
            }
            validate_quantity(receipt.quantity)?;
            if receipt.quantity > line.outstanding() {
                return Err(DomainError::validation(format!(
                    "line {} over-received: {} outstanding, {} received",
                    line.line_no,
                    line.outstanding(),
                    receipt.quantity
                )));
            }
            legs.push(TransferLeg {
                line_no: line.line_no,
                product_id: line.product_id,
                quantity: receipt.quantity,
                unit_cost: line.unit_cost,
            });
        }

        let fully_received = self.lines.iter().all(|line| {
            let incoming = legs
                .iter()
                .filter(|leg| leg.line_no == line.line_no)
                .map(|leg| leg.quantity)
                .sum::<Decimal>();
            line.received + incoming >= line.sent
        });

        Ok(vec![TransferEvent::Received(TransferReceived {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            destination,
            legs,
            fully_received,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelTransfer) -> Result<Vec<TransferEvent>, DomainError> {
        self.ensure_existing(cmd.tenant_id, cmd.transfer_id)?;
        let origin = self.origin.ok_or_else(DomainError::not_found)?;

        let reversed = match self.status {
            TransferStatus::Pending => Vec::new(),
            TransferStatus::InTransit => self
                .lines
                .iter()
                .filter(|l| l.sent > Decimal::ZERO)
                .map(|l| TransferLeg {
                    line_no: l.line_no,
                    product_id: l.product_id,
                    quantity: l.sent,
                    unit_cost: l.unit_cost,
                })
                .collect(),
            _ => return Err(self.wrong_state("cancel")),
        };

        Ok(vec![TransferEvent::Cancelled(TransferCancelled {
            tenant_id: cmd.tenant_id,
            transfer_id: cmd.transfer_id,
            origin,
            reversed,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use stockledger_events::execute;

    fn test_tenant_id() -> TenantId {
        TenantId::new()
    }

    fn created(tenant_id: TenantId, quantities: &[Decimal]) -> Transfer {
        let transfer_id = TransferId::new(AggregateId::new());
        let mut transfer = Transfer::empty(transfer_id);
        let lines = quantities
            .iter()
            .map(|q| NewTransferLine {
                product_id: ProductId::new(),
                quantity: *q,
            })
            .collect();
        execute(
            &mut transfer,
            &TransferCommand::Create(CreateTransfer {
                tenant_id,
                transfer_id,
                origin: WarehouseId::new(),
                destination: WarehouseId::new(),
                reference: "TR-1".to_string(),
                lines,
                requested_by: UserId::new(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        transfer
    }

    fn send(transfer: &mut Transfer, tenant_id: TenantId) -> Vec<TransferEvent> {
        let line_costs = transfer.lines().iter().map(|l| (l.line_no, dec!(7))).collect();
        let transfer_id = transfer.id_typed();
        execute(
            transfer,
            &TransferCommand::Send(SendTransfer {
                tenant_id,
                transfer_id,
                line_costs,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap()
    }

    fn receive(
        transfer: &Transfer,
        tenant_id: TenantId,
        quantity: Decimal,
    ) -> Result<Vec<TransferEvent>, DomainError> {
        transfer.handle(&TransferCommand::Receive(ReceiveTransfer {
            tenant_id,
            transfer_id: transfer.id_typed(),
            receipts: vec![LineReceipt { line_no: 1, quantity }],
            occurred_at: Utc::now(),
        }))
    }

    #[test]
    fn create_rejects_same_origin_and_destination() {
        let tenant_id = test_tenant_id();
        let transfer_id = TransferId::new(AggregateId::new());
        let warehouse = WarehouseId::new();
        let err = Transfer::empty(transfer_id)
            .handle(&TransferCommand::Create(CreateTransfer {
                tenant_id,
                transfer_id,
                origin: warehouse,
                destination: warehouse,
                reference: String::new(),
                lines: vec![NewTransferLine {
                    product_id: ProductId::new(),
                    quantity: dec!(1),
                }],
                requested_by: UserId::new(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn send_records_costs_and_moves_to_in_transit() {
        let tenant_id = test_tenant_id();
        let mut transfer = created(tenant_id, &[dec!(10), dec!(4)]);
        let events = send(&mut transfer, tenant_id);

        match &events[0] {
            TransferEvent::Sent(e) => {
                assert_eq!(e.legs.len(), 2);
                assert_eq!(e.legs[1].quantity, dec!(4));
                assert_eq!(e.legs[1].unit_cost, dec!(7));
            }
            _ => panic!("Expected TransferSent event"),
        }
        assert_eq!(transfer.status(), TransferStatus::InTransit);
        assert_eq!(transfer.lines()[0].sent, dec!(10));
        assert_eq!(transfer.stock_keys().len(), 4);
    }

    #[test]
    fn partial_then_full_receipt() {
        let tenant_id = test_tenant_id();
        let mut transfer = created(tenant_id, &[dec!(10)]);
        send(&mut transfer, tenant_id);

        let events = receive(&transfer, tenant_id, dec!(6)).unwrap();
        transfer.apply(&events[0]);
        assert_eq!(transfer.status(), TransferStatus::PartiallyReceived);

        let err = receive(&transfer, tenant_id, dec!(5)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let events = receive(&transfer, tenant_id, dec!(4)).unwrap();
        transfer.apply(&events[0]);
        assert_eq!(transfer.status(), TransferStatus::Received);
        assert_eq!(transfer.lines()[0].received, dec!(10));
    }

    #[test]
    fn receive_before_send_is_a_workflow_error() {
        let tenant_id = test_tenant_id();
        let transfer = created(tenant_id, &[dec!(10)]);
        let err = receive(&transfer, tenant_id, dec!(1)).unwrap_err();
        assert!(matches!(err, DomainError::WorkflowState(_)));
    }

    #[test]
    fn cancel_in_transit_reverses_sent_lines() {
        let tenant_id = test_tenant_id();
        let mut transfer = created(tenant_id, &[dec!(3)]);
        send(&mut transfer, tenant_id);

        let cancel = TransferCommand::Cancel(CancelTransfer {
            tenant_id,
            transfer_id: transfer.id_typed(),
            occurred_at: Utc::now(),
        });
        let events = execute(&mut transfer, &cancel).unwrap();
        match &events[0] {
            TransferEvent::Cancelled(e) => {
                assert_eq!(e.reversed.len(), 1);
                assert_eq!(e.reversed[0].quantity, dec!(3));
            }
            _ => panic!("Expected TransferCancelled event"),
        }
        assert!(matches!(transfer.handle(&cancel), Err(DomainError::WorkflowState(_))));
    }

    #[test]
    fn partially_received_transfer_cannot_be_cancelled() {
        let tenant_id = test_tenant_id();
        let mut transfer = created(tenant_id, &[dec!(10)]);
        send(&mut transfer, tenant_id);
        let events = receive(&transfer, tenant_id, dec!(1)).unwrap();
        transfer.apply(&events[0]);

        let err = transfer
            .handle(&TransferCommand::Cancel(CancelTransfer {
                tenant_id,
                transfer_id: transfer.id_typed(),
                occurred_at: Utc::now(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::WorkflowState(_)));
    }
}
