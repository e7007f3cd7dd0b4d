use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// One async mutex per VPS instance. Held across remote calls, so it must be
/// the tokio mutex; the map itself is only touched briefly.
#[derive(Default)]
pub(crate) struct InstanceLocks {
    inner: parking_lot::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl InstanceLocks {
    fn entry(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.inner.lock().entry(id).or_default().clone()
    }

    pub(crate) async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    pub(crate) fn try_lock(&self, id: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.entry(id).try_lock_owned().ok()
    }

    /// Drop the entry for an instance whose record is gone.
    pub(crate) fn forget(&self, id: Uuid) {
        self.inner.lock().remove(&id);
    }
}
