//! Per-pod composition locks.
//!
//! A keyed table of async mutexes, one per pod id. Entries are created lazily
//! on first acquire and pruned once no holder or waiter references them, so
//! the table only ever contains pods with in-flight operations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use crate::types::PodId;

type LockTable = HashMap<PodId, Arc<AsyncMutex<()>>>;

/// Keyed lock table serializing hint and capacity mutations per pod.
#[derive(Clone, Default)]
pub struct PodLocks {
    inner: Arc<Mutex<LockTable>>,
}

impl PodLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `pod_id`.
    pub async fn acquire(&self, pod_id: PodId) -> PodLockGuard {
        let entry = self.entry(pod_id);
        let guard = entry.lock_owned().await;
        trace!(pod_id, "composition lock acquired");
        PodLockGuard {
            pod_id,
            guard: Some(guard),
            locks: self.clone(),
        }
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_acquire(&self, pod_id: PodId) -> Option<PodLockGuard> {
        let entry = self.entry(pod_id);
        match entry.try_lock_owned() {
            Ok(guard) => Some(PodLockGuard {
                pod_id,
                guard: Some(guard),
                locks: self.clone(),
            }),
            Err(_) => {
                self.prune(pod_id);
                None
            }
        }
    }

    /// Whether some task currently holds the lock for `pod_id`.
    pub fn is_locked(&self, pod_id: PodId) -> bool {
        let table = self.table();
        table
            .get(&pod_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Number of pods with a live table entry.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, pod_id: PodId) -> Arc<AsyncMutex<()>> {
        let mut table = self.table();
        table.retain(|_, m| Arc::strong_count(m) > 1);
        table.entry(pod_id).or_default().clone()
    }

    fn prune(&self, pod_id: PodId) {
        let mut table = self.table();
        let idle = table
            .get(&pod_id)
            .map(|m| Arc::strong_count(m) == 1)
            .unwrap_or(false);
        if idle {
            table.remove(&pod_id);
        }
    }
}

/// Exclusive access to one pod. Released on drop.
pub struct PodLockGuard {
    pod_id: PodId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: PodLocks,
}

impl PodLockGuard {
    pub fn pod_id(&self) -> PodId {
        self.pod_id
    }
}

impl std::fmt::Debug for PodLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodLockGuard")
            .field("pod_id", &self.pod_id)
            .finish()
    }
}

impl Drop for PodLockGuard {
    fn drop(&mut self) {
        // Release the mutex before checking whether the entry is still in use.
        drop(self.guard.take());
        self.locks.prune(self.pod_id);
        trace!(pod_id = self.pod_id, "composition lock released");
    }
}
