//! Registry of live relays.
//!
//! The registry is the only state mutated by more than one task. Every
//! access goes through one mutex, and the mutex is never held while waiting
//! on a relay: `stop_all` snapshots the members, releases the lock, then
//! stops and waits on the snapshot. A relay removing itself concurrently
//! therefore never deadlocks against a shutdown in progress.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::future::join_all;
use tracing::debug;

use super::relay::{RelayHandle, RelayId};

/// Thread-safe set of live relays, keyed by relay id.
#[derive(Default)]
pub struct ConnectionRegistry {
    relays: Mutex<HashMap<RelayId, RelayHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RelayId, RelayHandle>> {
        self.relays.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a relay. Returns false if a relay with the same id is
    /// already present, in which case the registry is unchanged.
    pub fn add(&self, handle: RelayHandle) -> bool {
        let mut relays = self.lock();
        if relays.contains_key(&handle.id()) {
            return false;
        }
        relays.insert(handle.id(), handle);
        true
    }

    /// Remove a relay by id.
    pub fn remove(&self, id: RelayId) -> Option<RelayHandle> {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: RelayId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Handles of the relays registered right now.
    pub fn snapshot(&self) -> Vec<RelayHandle> {
        self.lock().values().cloned().collect()
    }

    /// Stop every relay present at the time of the call and wait until each
    /// has terminated. Relays added after the snapshot are not waited on.
    ///
    /// Returns the number of relays stopped.
    pub async fn stop_all(&self) -> usize {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return 0;
        }

        debug!(count = snapshot.len(), "Stopping relays");
        for handle in &snapshot {
            handle.stop();
        }
        join_all(snapshot.iter().map(|handle| handle.stopped())).await;

        snapshot.len()
    }
}
