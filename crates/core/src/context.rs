//! Explicit request context passed into every ledger operation.

use serde::{Deserialize, Serialize};

use crate::id::{TenantId, UserId};

/// Tenant + actor context for one call into the ledger.
///
/// Resolved by the caller (transport/auth layer) and passed explicitly; the
/// ledger never reads the tenant from process-wide state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    tenant_id: TenantId,
    actor: UserId,
}

impl TenantContext {
    pub fn new(tenant_id: TenantId, actor: UserId) -> Self {
        Self { tenant_id, actor }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    /// The user on whose behalf the call is made.
    pub fn actor(&self) -> UserId {
        self.actor
    }

    /// Same tenant, different actor.
    pub fn with_actor(self, actor: UserId) -> Self {
        Self { actor, ..self }
    }
}
