use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockledger_core::{Aggregate, AggregateId, AggregateRoot, DomainError, MovementId, TenantId};
use stockledger_events::Event;

use crate::movement::validate_quantity;
use crate::position::StockKey;

/// Reservation identifier (tenant-scoped via `tenant_id` fields in events/commands).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReservationId(pub AggregateId);

impl ReservationId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ReservationId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Reservation lifecycle: Pending → {Confirmed, Cancelled, Expired}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

/// Aggregate root: Reservation.
///
/// Holds stock on a position without consuming it. While Pending its quantity
/// is counted in the position's `reserved`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    id: ReservationId,
    tenant_id: Option<TenantId>,
    key: Option<StockKey>,
    quantity: Decimal,
    reference: String,
    status: ReservationStatus,
    expires_at: Option<DateTime<Utc>>,
    movement_id: Option<MovementId>,
    version: u64,
    created: bool,
}

impl Reservation {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: ReservationId) -> Self {
        Self {
            id,
            tenant_id: None,
            key: None,
            quantity: Decimal::ZERO,
            reference: String::new(),
            status: ReservationStatus::Pending,
            expires_at: None,
            movement_id: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> ReservationId {
        self.id
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn key(&self) -> Option<StockKey> {
        self.key
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn status(&self) -> ReservationStatus {
        self.status
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Outbound movement posted on confirmation.
    pub fn movement_id(&self) -> Option<MovementId> {
        self.movement_id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.expires_at.is_some_and(|at| at <= now)
    }
}

impl AggregateRoot for Reservation {
    type Id = ReservationId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateReservation {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub key: StockKey,
    pub quantity: Decimal,
    pub reference: String,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmReservation (consumes the hold with an outbound movement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmReservation {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub movement_id: MovementId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelReservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReservation {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ExpireReservation (time-driven sweep).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireReservation {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationCommand {
    Create(CreateReservation),
    Confirm(ConfirmReservation),
    Cancel(CancelReservation),
    Expire(ExpireReservation),
}

/// Event: ReservationCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCreated {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub key: StockKey,
    pub quantity: Decimal,
    pub reference: String,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationConfirmed {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub key: StockKey,
    pub quantity: Decimal,
    pub movement_id: MovementId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationReleased (cancelled or expired; no movement).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub tenant_id: TenantId,
    pub reservation_id: ReservationId,
    pub key: StockKey,
    pub quantity: Decimal,
    pub outcome: ReservationStatus,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationEvent {
    Created(ReservationCreated),
    Confirmed(ReservationConfirmed),
    Released(ReservationReleased),
}

impl Event for ReservationEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ReservationEvent::Created(_) => "inventory.reservation.created",
            ReservationEvent::Confirmed(_) => "inventory.reservation.confirmed",
            ReservationEvent::Released(e) if e.outcome == ReservationStatus::Expired => {
                "inventory.reservation.expired"
            }
            ReservationEvent::Released(_) => "inventory.reservation.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ReservationEvent::Created(e) => e.occurred_at,
            ReservationEvent::Confirmed(e) => e.occurred_at,
            ReservationEvent::Released(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Reservation {
    type Command = ReservationCommand;
    type Event = ReservationEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ReservationEvent::Created(e) => {
                self.id = e.reservation_id;
                self.tenant_id = Some(e.tenant_id);
                self.key = Some(e.key);
                self.quantity = e.quantity;
                self.reference = e.reference.clone();
                self.expires_at = Some(e.expires_at);
                self.status = ReservationStatus::Pending;
                self.created = true;
            }
            ReservationEvent::Confirmed(e) => {
                self.status = ReservationStatus::Confirmed;
                self.movement_id = Some(e.movement_id);
            }
            ReservationEvent::Released(e) => {
                self.status = e.outcome;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            ReservationCommand::Create(cmd) => self.handle_create(cmd),
            ReservationCommand::Confirm(cmd) => self.handle_confirm(cmd),
            ReservationCommand::Cancel(cmd) => self.handle_release(
                cmd.tenant_id,
                cmd.reservation_id,
                ReservationStatus::Cancelled,
                cmd.occurred_at,
            ),
            ReservationCommand::Expire(cmd) => {
                if self.expires_at.is_some_and(|at| at > cmd.occurred_at) {
                    return Err(DomainError::workflow("reservation has not expired yet"));
                }
                self.handle_release(
                    cmd.tenant_id,
                    cmd.reservation_id,
                    ReservationStatus::Expired,
                    cmd.occurred_at,
                )
            }
        }
    }
}

impl Reservation {
    fn ensure_tenant(&self, tenant_id: TenantId) -> Result<(), DomainError> {
        if !self.created {
            return Ok(());
        }
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        Ok(())
    }

    fn ensure_reservation_id(&self, reservation_id: ReservationId) -> Result<(), DomainError> {
        if self.id != reservation_id {
            return Err(DomainError::invariant("reservation_id mismatch"));
        }
        Ok(())
    }

    fn ensure_pending(&self) -> Result<StockKey, DomainError> {
        let key = self.key.ok_or_else(DomainError::not_found)?;
        if self.status != ReservationStatus::Pending {
            return Err(DomainError::workflow(format!(
                "reservation is {:?}, expected Pending",
                self.status
            )));
        }
        Ok(key)
    }

    fn handle_create(&self, cmd: &CreateReservation) -> Result<Vec<ReservationEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("reservation already exists"));
        }
        if cmd.key.tenant_id != cmd.tenant_id {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        validate_quantity(cmd.quantity)?;
        if cmd.expires_at <= cmd.occurred_at {
            return Err(DomainError::validation("expiry must be in the future"));
        }

        Ok(vec![ReservationEvent::Created(ReservationCreated {
            tenant_id: cmd.tenant_id,
            reservation_id: cmd.reservation_id,
            key: cmd.key,
            quantity: cmd.quantity,
            reference: cmd.reference.clone(),
            expires_at: cmd.expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(
        &self,
        cmd: &ConfirmReservation,
    ) -> Result<Vec<ReservationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(cmd.tenant_id)?;
        self.ensure_reservation_id(cmd.reservation_id)?;
        let key = self.ensure_pending()?;

        Ok(vec![ReservationEvent::Confirmed(ReservationConfirmed {
            tenant_id: cmd.tenant_id,
            reservation_id: cmd.reservation_id,
            key,
            quantity: self.quantity,
            movement_id: cmd.movement_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(
        &self,
        tenant_id: TenantId,
        reservation_id: ReservationId,
        outcome: ReservationStatus,
        occurred_at: DateTime<Utc>,
    ) -> Result<Vec<ReservationEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_tenant(tenant_id)?;
        self.ensure_reservation_id(reservation_id)?;
        let key = self.ensure_pending()?;

        Ok(vec![ReservationEvent::Released(ReservationReleased {
            tenant_id,
            reservation_id,
            key,
            quantity: self.quantity,
            outcome,
            occurred_at,
        })])
    }
}
