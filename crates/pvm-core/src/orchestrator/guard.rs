use std::sync::Arc;

use pvm_db::Store;
use pvm_db::models::VpsStatus;
use uuid::Uuid;

use crate::address_pool::AddressPool;
use crate::error::Error;

/// Compensation for an address allocated by an in-progress creation.
///
/// While armed, dropping the guard (the creating future was cancelled)
/// spawns the rollback onto the runtime: release the address if it is still
/// allocated to the owner and mark the instance record, if one was written,
/// as failed. The saga's own failure path runs the same rollback inline
/// via [`AllocationGuard::compensate`].
pub(crate) struct AllocationGuard {
    rollback: Option<Rollback>,
}

struct Rollback {
    addresses: AddressPool,
    store: Arc<dyn Store>,
    address: String,
    owner_id: Uuid,
    vps_id: Option<Uuid>,
}

impl AllocationGuard {
    pub(crate) fn new(
        addresses: AddressPool,
        store: Arc<dyn Store>,
        address: String,
        owner_id: Uuid,
    ) -> Self {
        Self {
            rollback: Some(Rollback {
                addresses,
                store,
                address,
                owner_id,
                vps_id: None,
            }),
        }
    }

    /// The instance record now exists; rollback must mark it failed.
    pub(crate) fn record_created(&mut self, vps_id: Uuid) {
        if let Some(rollback) = &mut self.rollback {
            rollback.vps_id = Some(vps_id);
        }
    }

    /// The saga completed; nothing to undo.
    pub(crate) fn disarm(mut self) {
        self.rollback = None;
    }

    pub(crate) async fn compensate(mut self) {
        if let Some(rollback) = self.rollback.take() {
            rollback.run().await;
        }
    }
}

impl Drop for AllocationGuard {
    fn drop(&mut self) {
        let Some(rollback) = self.rollback.take() else {
            return;
        };
        tracing::warn!(
            address = %rollback.address,
            vps_id = ?rollback.vps_id,
            "creation abandoned, rolling back address allocation"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(rollback.run());
            }
            Err(_) => tracing::error!(
                address = %rollback.address,
                "no runtime to roll back on, address stays allocated"
            ),
        }
    }
}

impl Rollback {
    async fn run(self) {
        match self.addresses.release_owned(&self.address, self.owner_id).await {
            Ok(_) => {}
            Err(Error::Conflict(reason)) => {
                tracing::warn!(address = %self.address, %reason, "address no longer held, skipping release");
            }
            Err(e) => {
                tracing::error!(address = %self.address, error = %e, "failed to release address during rollback");
            }
        }

        if let Some(vps_id) = self.vps_id
            && let Err(e) = self.store.set_vps_status(vps_id, VpsStatus::Failed).await
        {
            tracing::error!(%vps_id, error = %e, "failed to mark vps as failed during rollback");
        }
    }
}
