//! Inventory domain: the stock ledger and its workflows.
//!
//! This crate contains business rules for inventory, implemented purely as
//! deterministic domain logic (no IO, no locking, no storage). Orchestration
//! lives in `stockledger-infra`.

pub mod adjustment;
pub mod costing;
pub mod count;
pub mod lot;
pub mod movement;
pub mod notification;
pub mod position;
pub mod reservation;
pub mod transfer;

pub use adjustment::{
    Adjustment, AdjustmentCommand, AdjustmentEvent, AdjustmentId, AdjustmentLine,
    AdjustmentPosting, AdjustmentStatus, AdjustmentType, ApproveAdjustment, CreateAdjustment,
    NewAdjustmentLine, ProcessAdjustment, RejectAdjustment,
};
pub use costing::{CostingEngine, DEFAULT_COST_SCALE, WeightedAverageCost, round_half_up};
pub use count::{
    CancelPhysicalCount, CountCommand, CountEvent, CountLine, CountStatus, CreatePhysicalCount,
    FinishPhysicalCount, PhysicalCount, PhysicalCountId, ReconcilePhysicalCount, RecordCount,
    StartPhysicalCount,
};
pub use lot::{Lot, LotAllocator, LotStatus};
pub use movement::{
    BalanceSnapshot, Direction, LotAllocation, Movement, MovementRequest, MovementType,
};
pub use notification::{LotExpiryAlert, MovementPosted, StockBelowMinimum, StockEvent};
pub use position::{MovementDraft, NegativeStockPolicy, StockKey, StockPosition};
pub use reservation::{
    CancelReservation, ConfirmReservation, CreateReservation, ExpireReservation, Reservation,
    ReservationCommand, ReservationEvent, ReservationId, ReservationStatus,
};
pub use transfer::{
    CancelTransfer, CreateTransfer, LineReceipt, NewTransferLine, ReceiveTransfer, SendTransfer,
    Transfer, TransferCommand, TransferEvent, TransferId, TransferLeg, TransferLine,
    TransferStatus,
};
