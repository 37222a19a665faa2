//! Per-key serialization of stock positions.
//!
//! A mutating operation holds the locks of every `StockKey` it touches for
//! its whole locked section. Keys are taken all-or-nothing in sorted order,
//! so multi-key operations (transfers) cannot deadlock, and operations on
//! disjoint keys never wait on each other.

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

use stockledger_inventory::StockKey;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for {keys} stock lock(s)")]
    Timeout { waited: Duration, keys: usize },
}

#[derive(Debug, Default)]
pub struct StockLockManager {
    held: Mutex<HashSet<StockKey>>,
    released: Condvar,
}

impl StockLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key in `keys` is free (or `timeout` elapses), then
    /// take them all at once.
    pub fn acquire(
        &self,
        keys: &[StockKey],
        timeout: Duration,
    ) -> Result<StockLockGuard<'_>, LockError> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let started = Instant::now();
        let deadline = started + timeout;
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());

        while keys.iter().any(|k| held.contains(k)) {
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    waited: now - started,
                    keys: keys.len(),
                });
            }
            let (guard, _) = self
                .released
                .wait_timeout(held, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
            held = guard;
        }

        held.extend(keys.iter().copied());
        Ok(StockLockGuard { manager: self, keys })
    }

    pub fn is_locked(&self, key: &StockKey) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(key))
            .unwrap_or(false)
    }
}

/// Releases its keys on drop.
#[derive(Debug)]
pub struct StockLockGuard<'a> {
    manager: &'a StockLockManager,
    keys: Vec<StockKey>,
}

impl StockLockGuard<'_> {
    /// Locked keys, sorted.
    pub fn keys(&self) -> &[StockKey] {
        &self.keys
    }

    pub fn covers(&self, key: &StockKey) -> bool {
        self.keys.binary_search(key).is_ok()
    }
}

impl Drop for StockLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.manager.held.lock().unwrap_or_else(|p| p.into_inner());
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.manager.released.notify_all();
    }
}
