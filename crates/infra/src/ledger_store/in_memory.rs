use std::collections::HashMap;
use std::sync::RwLock;

use stockledger_core::{AggregateRoot, LotId, TenantId};
use stockledger_inventory::{Lot, Movement, StockKey, StockPosition};

use super::r#trait::{CommitOutcome, LedgerCommit, LedgerStore, LedgerStoreError};
use crate::idempotency::{IdempotencyRecord, IdempotencyScope};

#[derive(Debug, Default)]
struct LedgerState {
    positions: HashMap<StockKey, StockPosition>,
    movements: HashMap<StockKey, Vec<Movement>>,
    lots: HashMap<(TenantId, LotId), Lot>,
    idempotency: HashMap<IdempotencyScope, IdempotencyRecord>,
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    state: RwLock<LedgerState>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_tenants(commit: &LedgerCommit) -> Result<(), LedgerStoreError> {
        let tenant_id = commit.tenant_id;
        let foreign = commit
            .positions
            .iter()
            .map(|w| w.position.tenant_id())
            .chain(commit.movements.iter().map(|m| m.tenant_id))
            .chain(commit.lots.iter().map(|l| l.tenant_id))
            .chain(commit.idempotency.iter().map(|r| r.scope.tenant_id))
            .any(|t| t != tenant_id);
        if foreign {
            return Err(LedgerStoreError::TenantIsolation(format!(
                "commit for tenant {tenant_id} contains records of another tenant"
            )));
        }
        Ok(())
    }

    fn check_versions(state: &LedgerState, commit: &LedgerCommit) -> Result<(), LedgerStoreError> {
        for write in &commit.positions {
            let key = write.position.key();
            let current = state.positions.get(&key).map(|p| p.version());
            if !write.expected.matches(current) {
                return Err(LedgerStoreError::VersionConflict(format!(
                    "position {key}: expected {:?}, found {current:?}",
                    write.expected
                )));
            }
        }
        Ok(())
    }

    fn check_sequences(state: &LedgerState, commit: &LedgerCommit) -> Result<(), LedgerStoreError> {
        let mut next: HashMap<StockKey, u64> = HashMap::new();
        for movement in &commit.movements {
            let key = movement.key();
            let expected = next
                .entry(key)
                .or_insert_with(|| state.movements.get(&key).map_or(0, |m| m.len() as u64) + 1);
            if movement.sequence != *expected {
                return Err(LedgerStoreError::InvalidCommit(format!(
                    "movement {} on {key} has sequence {}, expected {}",
                    movement.id, movement.sequence, expected
                )));
            }
            *expected += 1;
        }

        for (key, after_last) in &next {
            let written = commit
                .positions
                .iter()
                .find(|w| w.position.key() == *key)
                .map(|w| w.position.movement_count());
            if written != Some(after_last - 1) {
                return Err(LedgerStoreError::InvalidCommit(format!(
                    "position {key} does not match its appended movements"
                )));
            }
        }
        Ok(())
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn position(&self, key: &StockKey) -> Result<Option<StockPosition>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        Ok(state.positions.get(key).cloned())
    }

    fn positions(&self, tenant_id: TenantId) -> Result<Vec<StockPosition>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        let mut positions: Vec<StockPosition> = state
            .positions
            .values()
            .filter(|p| p.tenant_id() == tenant_id)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.key());
        Ok(positions)
    }

    fn movements(&self, key: &StockKey) -> Result<Vec<Movement>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        Ok(state.movements.get(key).cloned().unwrap_or_default())
    }

    fn lots(&self, key: &StockKey) -> Result<Vec<Lot>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|l| l.key() == *key)
            .cloned()
            .collect();
        lots.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(lots)
    }

    fn tenant_lots(&self, tenant_id: TenantId) -> Result<Vec<Lot>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        let mut lots: Vec<Lot> = state
            .lots
            .values()
            .filter(|l| l.tenant_id == tenant_id)
            .cloned()
            .collect();
        lots.sort_by(|a, b| (a.key(), &a.code).cmp(&(b.key(), &b.code)));
        Ok(lots)
    }

    fn lot(&self, tenant_id: TenantId, lot_id: LotId) -> Result<Option<Lot>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        Ok(state.lots.get(&(tenant_id, lot_id)).cloned())
    }

    fn idempotency_record(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<IdempotencyRecord>, LedgerStoreError> {
        let state = self.state.read().map_err(|_| LedgerStoreError::Poisoned)?;
        Ok(state.idempotency.get(scope).cloned())
    }

    fn commit(&self, commit: LedgerCommit) -> Result<CommitOutcome, LedgerStoreError> {
        Self::check_tenants(&commit)?;

        let mut state = self.state.write().map_err(|_| LedgerStoreError::Poisoned)?;

        if let Some(record) = &commit.idempotency {
            if let Some(existing) = state.idempotency.get(&record.scope) {
                return Ok(CommitOutcome::Duplicate(existing.clone()));
            }
        }
        Self::check_versions(&state, &commit)?;
        Self::check_sequences(&state, &commit)?;

        // All checks passed; apply (append-only for movements).
        for write in commit.positions {
            state.positions.insert(write.position.key(), write.position);
        }
        for movement in commit.movements {
            state.movements.entry(movement.key()).or_default().push(movement);
        }
        for lot in commit.lots {
            state.lots.insert((lot.tenant_id, lot.id), lot);
        }
        if let Some(record) = commit.idempotency {
            state.idempotency.insert(record.scope.clone(), record);
        }

        Ok(CommitOutcome::Committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use stockledger_core::{ExpectedVersion, MovementId, ProductId, WarehouseId};
    use stockledger_inventory::{
        MovementDraft, MovementType, NegativeStockPolicy, WeightedAverageCost,
    };

    use crate::idempotency::operations;
    use crate::ledger_store::PositionWrite;

    fn receipt(position: &mut StockPosition) -> Movement {
        position
            .record(
                MovementDraft {
                    id: MovementId::new(),
                    movement_type: MovementType::EntradaCompra,
                    quantity: dec!(5),
                    unit_cost: dec!(2),
                    reference: "PO".to_string(),
                    idempotency_key: "k".to_string(),
                    lot_id: None,
                    lot_allocations: vec![],
                    occurred_at: Utc::now(),
                    release_reserved: dec!(0),
                },
                &WeightedAverageCost::default(),
                NegativeStockPolicy::Reject,
            )
            .unwrap()
    }

    fn commit_for(
        position: &StockPosition,
        expected: ExpectedVersion,
        movement: Movement,
    ) -> LedgerCommit {
        let mut commit = LedgerCommit::new(position.tenant_id());
        commit.positions.push(PositionWrite {
            position: position.clone(),
            expected,
        });
        commit.movements.push(movement);
        commit
    }

    fn key() -> StockKey {
        StockKey::new(TenantId::new(), ProductId::new(), WarehouseId::new())
    }

    #[test]
    fn commit_appends_and_reads_back() {
        let store = InMemoryLedgerStore::new();
        let mut position = StockPosition::open(key());
        let movement = receipt(&mut position);

        let outcome = store
            .commit(commit_for(&position, ExpectedVersion::NoneYet, movement.clone()))
            .unwrap();

        assert_eq!(outcome, CommitOutcome::Committed);
        assert_eq!(store.position(&position.key()).unwrap(), Some(position.clone()));
        assert_eq!(store.movements(&position.key()).unwrap(), vec![movement]);
    }

    #[test]
    fn stale_version_is_rejected_without_writing() {
        let store = InMemoryLedgerStore::new();
        let mut position = StockPosition::open(key());
        let first = receipt(&mut position);
        store
            .commit(commit_for(&position, ExpectedVersion::NoneYet, first))
            .unwrap();

        let mut stale = position.clone();
        let second = receipt(&mut stale);
        let err = store
            .commit(commit_for(&stale, ExpectedVersion::Exact(0), second))
            .unwrap_err();

        assert!(matches!(err, LedgerStoreError::VersionConflict(_)));
        assert_eq!(store.movements(&position.key()).unwrap().len(), 1);
    }

    #[test]
    fn foreign_tenant_records_are_rejected() {
        let store = InMemoryLedgerStore::new();
        let mut position = StockPosition::open(key());
        let movement = receipt(&mut position);
        let mut commit = commit_for(&position, ExpectedVersion::NoneYet, movement);
        commit.tenant_id = TenantId::new();

        assert!(matches!(
            store.commit(commit),
            Err(LedgerStoreError::TenantIsolation(_))
        ));
    }

    #[test]
    fn duplicate_idempotency_scope_returns_the_first_record() {
        let store = InMemoryLedgerStore::new();
        let k = key();
        let scope =
            IdempotencyScope::new(k.tenant_id, operations::REGISTER_MOVEMENT, "dup").unwrap();

        let mut first = LedgerCommit::new(k.tenant_id);
        first.idempotency = Some(IdempotencyRecord::new(scope.clone(), &1u32, Utc::now()).unwrap());
        store.commit(first).unwrap();

        let mut position = StockPosition::open(k);
        let movement = receipt(&mut position);
        let mut second = commit_for(&position, ExpectedVersion::NoneYet, movement);
        second.idempotency = Some(IdempotencyRecord::new(scope, &2u32, Utc::now()).unwrap());

        match store.commit(second).unwrap() {
            CommitOutcome::Duplicate(record) => assert_eq!(record.decode::<u32>().unwrap(), 1),
            CommitOutcome::Committed => panic!("Expected duplicate outcome"),
        }
        assert!(store.movements(&k).unwrap().is_empty());
    }
}
