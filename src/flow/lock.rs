use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::flow::state::StateKey;

/// Serializes transitions per (contact, flow) inside one process.
///
/// Compare-and-swap on the row version still guards against other
/// processes; the lock only stops local callers from racing each other.
#[derive(Debug, Default)]
pub struct StateLocks {
    locks: DashMap<StateKey, Arc<Mutex<()>>>,
}

impl StateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &StateKey) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drops locks nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
