//! Infrastructure layer: locking, storage, idempotency and the ledger
//! services built on top of them.
//!
//! Everything here is synchronous. Services take a `TenantContext` on every
//! call and never infer the tenant from ambient state.

pub mod adjustments;
pub mod alerts;
pub mod catalog;
pub mod config;
pub mod counts;
pub mod error;
pub mod idempotency;
pub mod kardex;
pub mod ledger_store;
pub mod locks;
pub mod movement_processor;
pub mod repository;
pub mod reservations;
pub mod sink;
pub mod transfers;
pub mod unit_of_work;

#[cfg(test)]
mod integration_tests;

pub use adjustments::AdjustmentWorkflow;
pub use alerts::AlertSweep;
pub use catalog::{Catalog, InMemoryCatalog};
pub use config::{ConfigError, LedgerConfig};
pub use counts::PhysicalCountWorkflow;
pub use error::LedgerError;
pub use idempotency::{IdempotencyRecord, IdempotencyScope};
pub use kardex::{KardexEntry, KardexQuery, KardexReport};
pub use ledger_store::{InMemoryLedgerStore, LedgerStore};
pub use locks::{LockError, StockLockManager};
pub use movement_processor::MovementProcessor;
pub use repository::{DocumentRepository, InMemoryRepository};
pub use reservations::ReservationManager;
pub use sink::{NotificationSink, NotifyError};
pub use transfers::TransferWorkflow;
pub use unit_of_work::{PostingLine, UnitOfWork};
