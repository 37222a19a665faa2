//! Versioned, tenant-isolated storage of workflow documents (reservations,
//! transfers, adjustments, physical counts).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use stockledger_core::{AggregateRoot, ExpectedVersion, TenantId};

use crate::ledger_store::LedgerStoreError;

pub trait DocumentRepository<A>: Send + Sync
where
    A: AggregateRoot,
{
    fn load(&self, tenant_id: TenantId, id: &A::Id) -> Result<Option<A>, LedgerStoreError>;

    /// Store `document` if the stored version still matches `expected`.
    fn save(
        &self,
        tenant_id: TenantId,
        document: A,
        expected: ExpectedVersion,
    ) -> Result<(), LedgerStoreError>;

    fn list(&self, tenant_id: TenantId) -> Result<Vec<A>, LedgerStoreError>;
}

impl<A, R> DocumentRepository<A> for Arc<R>
where
    A: AggregateRoot,
    R: DocumentRepository<A> + ?Sized,
{
    fn load(&self, tenant_id: TenantId, id: &A::Id) -> Result<Option<A>, LedgerStoreError> {
        (**self).load(tenant_id, id)
    }

    fn save(
        &self,
        tenant_id: TenantId,
        document: A,
        expected: ExpectedVersion,
    ) -> Result<(), LedgerStoreError> {
        (**self).save(tenant_id, document, expected)
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<A>, LedgerStoreError> {
        (**self).list(tenant_id)
    }
}

/// In-memory tenant-isolated document store for tests/dev.
#[derive(Debug)]
pub struct InMemoryRepository<A: AggregateRoot> {
    inner: RwLock<HashMap<(TenantId, A::Id), A>>,
}

impl<A: AggregateRoot> InMemoryRepository<A> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<A: AggregateRoot> Default for InMemoryRepository<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> DocumentRepository<A> for InMemoryRepository<A>
where
    A: AggregateRoot + Clone + Send + Sync + 'static,
    A::Id: Hash + Send + Sync,
{
    fn load(&self, tenant_id: TenantId, id: &A::Id) -> Result<Option<A>, LedgerStoreError> {
        let map = self.inner.read().map_err(|_| LedgerStoreError::Poisoned)?;
        Ok(map.get(&(tenant_id, id.clone())).cloned())
    }

    fn save(
        &self,
        tenant_id: TenantId,
        document: A,
        expected: ExpectedVersion,
    ) -> Result<(), LedgerStoreError> {
        let mut map = self.inner.write().map_err(|_| LedgerStoreError::Poisoned)?;
        let key = (tenant_id, document.id().clone());
        let current = map.get(&key).map(|d| d.version());
        if !expected.matches(current) {
            return Err(LedgerStoreError::VersionConflict(format!(
                "document {:?}: expected {expected:?}, found {current:?}",
                document.id()
            )));
        }
        map.insert(key, document);
        Ok(())
    }

    fn list(&self, tenant_id: TenantId) -> Result<Vec<A>, LedgerStoreError> {
        let map = self.inner.read().map_err(|_| LedgerStoreError::Poisoned)?;
        Ok(map
            .iter()
            .filter(|((t, _), _)| *t == tenant_id)
            .map(|(_, doc)| doc.clone())
            .collect())
    }
}
