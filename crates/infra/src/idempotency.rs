//! Idempotency guard: one logical operation per (tenant, operation, key).
//!
//! Records are written by the ledger store in the same atomic commit as the
//! movements they describe; the guard only looks them up and builds them.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockledger_core::TenantId;
use stockledger_inventory::movement::validate_idempotency_key;

use crate::error::LedgerError;
use crate::ledger_store::LedgerStore;

/// Logical operation names used to scope idempotency keys.
pub mod operations {
    pub const REGISTER_MOVEMENT: &str = "movement.register";
    pub const CONFIRM_RESERVATION: &str = "reservation.confirm";
    pub const SEND_TRANSFER: &str = "transfer.send";
    pub const RECEIVE_TRANSFER: &str = "transfer.receive";
    pub const CANCEL_TRANSFER: &str = "transfer.cancel";
    pub const PROCESS_ADJUSTMENT: &str = "adjustment.process";
    pub const RECONCILE_COUNT: &str = "count.reconcile";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyScope {
    pub tenant_id: TenantId,
    pub operation: String,
    pub key: String,
}

impl IdempotencyScope {
    /// Fails with `Validation` on a blank key.
    pub fn new(
        tenant_id: TenantId,
        operation: &str,
        key: impl Into<String>,
    ) -> Result<Self, LedgerError> {
        let key = key.into();
        validate_idempotency_key(&key)?;
        Ok(Self {
            tenant_id,
            operation: operation.to_string(),
            key,
        })
    }

    /// Key recorded on the movement of line `line_no` of a multi-line action.
    pub fn line_key(&self, line_no: u32) -> String {
        format!("{}#{}", self.key, line_no)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub scope: IdempotencyScope,
    pub result: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new<T: Serialize>(
        scope: IdempotencyScope,
        result: &T,
        recorded_at: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        let result = serde_json::to_value(result).map_err(|e| {
            LedgerError::Store(format!("idempotency result serialization failed: {e}"))
        })?;
        Ok(Self {
            scope,
            result,
            recorded_at,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, LedgerError> {
        serde_json::from_value(self.result.clone()).map_err(|e| {
            LedgerError::IntegrityFault(format!(
                "stored result for {}:{} does not decode: {e}",
                self.scope.operation, self.scope.key
            ))
        })
    }
}

/// Read side of the idempotency records kept by a [`LedgerStore`].
pub struct IdempotencyGuard<'a> {
    store: &'a dyn LedgerStore,
}

impl<'a> IdempotencyGuard<'a> {
    pub fn new(store: &'a dyn LedgerStore) -> Self {
        Self { store }
    }

    /// The original result for `scope`, if the operation already happened.
    pub fn replay<T: DeserializeOwned>(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<T>, LedgerError> {
        match self.store.idempotency_record(scope)? {
            Some(record) => record.decode().map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_key_is_a_validation_error() {
        let err =
            IdempotencyScope::new(TenantId::new(), operations::SEND_TRANSFER, " ").unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn line_keys_are_derived_from_the_action_key() {
        let scope =
            IdempotencyScope::new(TenantId::new(), operations::SEND_TRANSFER, "req-9").unwrap();
        assert_eq!(scope.line_key(2), "req-9#2");
    }

    #[test]
    fn record_round_trips_the_result() {
        let scope =
            IdempotencyScope::new(TenantId::new(), operations::REGISTER_MOVEMENT, "k").unwrap();
        let record = IdempotencyRecord::new(scope, &vec![1u32, 2, 3], Utc::now()).unwrap();
        assert_eq!(record.decode::<Vec<u32>>().unwrap(), vec![1, 2, 3]);
        assert!(matches!(record.decode::<String>(), Err(LedgerError::IntegrityFault(_))));
    }
}
