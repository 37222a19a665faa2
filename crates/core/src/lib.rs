//! `stockledger-core`: ids, errors and aggregate building blocks shared by every crate.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod aggregate;
pub mod clock;
pub mod context;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::TenantContext;
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, LotId, MovementId, ProductId, TenantId, UserId, WarehouseId};
