use chrono::{DateTime, Utc};

/// A fact produced by a ledger aggregate or workflow document.
///
/// Workflow documents (transfers, reservations, adjustments, counts) emit
/// these from `handle` and fold them in `apply`. Stock notifications reuse
/// the same trait so they can be wrapped in an `EventEnvelope`.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Dotted, stable name such as `inventory.movement.posted`.
    fn event_type(&self) -> &'static str;

    /// Payload schema version; bump on breaking field changes.
    fn version(&self) -> u32;

    /// Business time taken from the command, never from the wall clock.
    fn occurred_at(&self) -> DateTime<Utc>;
}
