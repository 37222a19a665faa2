//! Notification sink: where committed stock events go.

use serde_json::Value as JsonValue;
use thiserror::Error;

use stockledger_core::AggregateId;
use stockledger_events::{EventBus, EventEnvelope, TenantScoped};
use stockledger_inventory::StockEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("notification publish failed: {0}")]
    Publish(String),
}

/// Receives notifications after the ledger state they describe is committed.
///
/// Failures are reported back but never undo the commit.
pub trait NotificationSink: Send + Sync {
    fn notify(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence_number: u64,
        event: &StockEvent,
    ) -> Result<(), NotifyError>;
}

impl<B> NotificationSink for B
where
    B: EventBus<EventEnvelope<JsonValue>>,
{
    fn notify(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        sequence_number: u64,
        event: &StockEvent,
    ) -> Result<(), NotifyError> {
        let envelope = EventEnvelope::from_event(
            event.tenant_id(),
            aggregate_id,
            aggregate_type,
            sequence_number,
            event,
        )?;
        self.publish(envelope)
            .map_err(|err| NotifyError::Publish(format!("{err:?}")))
    }
}
