//! Per-process mutual exclusion.
//!
//! Every transition of a process runs under its lock, so two transitions of
//! the same process never interleave within one engine. Entries are created
//! on demand and dropped again once no one holds or waits for them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct ProcessLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ProcessLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, process_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(process_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Forget the entry of `process_id` when nobody else references it.
    pub fn release_if_idle(&self, process_id: Uuid) {
        self.locks
            .remove_if(&process_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
