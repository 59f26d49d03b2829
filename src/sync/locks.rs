use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-subscription mutual exclusion.
///
/// Fetch-and-merge and the enrichment write-back both hold the lock for the
/// subscription they touch, so item-list writes for one id never interleave.
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct SubscriptionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl SubscriptionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(id.to_string()).or_default().clone()
    }

    /// Takes the lock for `id` if nobody holds it.
    pub fn try_acquire(&self, id: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(id).try_lock_owned().ok()
    }

    /// Waits for the lock for `id`.
    pub async fn acquire(&self, id: &str) -> OwnedMutexGuard<()> {
        self.slot(id).lock_owned().await
    }

    /// Drops the slot for an id that is no longer tracked.
    ///
    /// A slot still held or awaited elsewhere is kept.
    pub fn forget(&self, id: &str) {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if map.get(id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            map.remove(id);
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
