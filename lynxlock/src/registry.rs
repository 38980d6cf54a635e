use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::handle::LockHandle;
use crate::metrics::LockMetrics;

/// Process-wide set of active handles, keyed by holder identity.
///
/// Entries are weak: a handle dropped while Held simply disappears from
/// renewal consideration and its lease lapses server-side, the same as
/// for a crashed process. Dead entries are culled on the next
/// [`snapshot`](Self::snapshot).
pub(crate) struct LockRegistry {
    handles: DashMap<String, Weak<LockHandle>>,
    metrics: Arc<LockMetrics>,
}

impl LockRegistry {
    pub(crate) fn new(metrics: Arc<LockMetrics>) -> Self {
        Self {
            handles: DashMap::new(),
            metrics,
        }
    }

    pub(crate) fn insert(&self, holder: String, handle: Weak<LockHandle>) {
        self.handles.insert(holder, handle);
    }

    pub(crate) fn remove(&self, holder: &str) -> bool {
        self.handles.remove(holder).is_some()
    }

    /// Upgrade every live entry, dropping the ones whose handle is gone.
    ///
    /// A culled entry was Held when its last `Arc` was dropped; the
    /// lease will expire at its TTL, so it is accounted as an
    /// expiration and no longer active.
    pub(crate) fn snapshot(&self) -> Vec<Arc<LockHandle>> {
        let mut live = Vec::with_capacity(self.handles.len());
        self.handles.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                live.push(handle);
                true
            }
            None => {
                self.metrics.decrement_active_locks();
                self.metrics.increment_expirations();
                false
            }
        });
        live
    }
}
