//! Ledger storage boundary.
//!
//! Positions are a cache over the append-only movement log; both are written
//! together in one commit along with touched lots and the idempotency record
//! of the operation.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryLedgerStore;
pub use r#trait::{CommitOutcome, LedgerCommit, LedgerStore, LedgerStoreError, PositionWrite};
