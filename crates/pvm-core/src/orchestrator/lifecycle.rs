use pvm_db::models::{Vps, VpsStatus};
use uuid::Uuid;

use super::{VpsOrchestrator, vmid_of};
use crate::error::{Error, Result};
use crate::remote::bounded;

fn not_operable(vps: &Vps, action: &str) -> Error {
    Error::Conflict(format!("cannot {action} vps {} while it is {}", vps.id, vps.status))
}

impl VpsOrchestrator {
    /// Stopped → Running. Already running is a no-op.
    pub async fn start_vps(&self, id: Uuid) -> Result<Vps> {
        let _lock = self.locks.lock(id).await;
        let vps = self.store.get_vps(id).await?;
        match vps.status {
            VpsStatus::Running => Ok(vps),
            VpsStatus::Stopped => {
                bounded(
                    self.config.remote_timeout,
                    self.hypervisor.start_vm(&vps.node_name, vmid_of(&vps)),
                )
                .await
                .map_err(Error::remote("start_vm"))?;
                self.transitioned(&vps, VpsStatus::Running).await
            }
            _ => Err(not_operable(&vps, "start")),
        }
    }

    /// Running → Stopped. Already stopped is a no-op.
    pub async fn stop_vps(&self, id: Uuid) -> Result<Vps> {
        let _lock = self.locks.lock(id).await;
        let vps = self.store.get_vps(id).await?;
        match vps.status {
            VpsStatus::Stopped => Ok(vps),
            VpsStatus::Running => {
                bounded(
                    self.config.remote_timeout,
                    self.hypervisor.stop_vm(&vps.node_name, vmid_of(&vps)),
                )
                .await
                .map_err(Error::remote("stop_vm"))?;
                self.transitioned(&vps, VpsStatus::Stopped).await
            }
            _ => Err(not_operable(&vps, "stop")),
        }
    }

    /// Reset a running guest, or boot a stopped one. Ends Running.
    pub async fn restart_vps(&self, id: Uuid) -> Result<Vps> {
        let _lock = self.locks.lock(id).await;
        let vps = self.store.get_vps(id).await?;
        let (node, vmid) = (vps.node_name.as_str(), vmid_of(&vps));
        let limit = self.config.remote_timeout;
        match vps.status {
            VpsStatus::Running => bounded(limit, self.hypervisor.restart_vm(node, vmid))
                .await
                .map_err(Error::remote("restart_vm"))?,
            VpsStatus::Stopped => bounded(limit, self.hypervisor.start_vm(node, vmid))
                .await
                .map_err(Error::remote("start_vm"))?,
            _ => return Err(not_operable(&vps, "restart")),
        }
        self.transitioned(&vps, VpsStatus::Running).await
    }

    /// Tear a guest down and return its address to the pool.
    ///
    /// Remote resources that are already gone are skipped, so a delete that
    /// failed part-way can be retried. A failed remote delete leaves the
    /// record `deleting`.
    pub async fn delete_vps(&self, id: Uuid) -> Result<()> {
        let _lock = self.locks.lock(id).await;
        let mut vps = self.store.get_vps(id).await?;
        let (node, vmid) = (vps.node_name.clone(), vmid_of(&vps));
        let limit = self.config.remote_timeout;

        if !matches!(vps.status, VpsStatus::Stopped | VpsStatus::Failed)
            && let Err(e) = bounded(limit, self.hypervisor.stop_vm(&node, vmid)).await
        {
            tracing::warn!(vps_id = %id, vmid, error = %e, "stop before delete failed, continuing");
        }

        // A failed instance already gave its address back; keep that visible.
        let owns_address = vps.status != VpsStatus::Failed;
        if owns_address && vps.status != VpsStatus::Deleting {
            vps = self.store.set_vps_status(id, VpsStatus::Deleting).await?;
        }

        match bounded(limit, self.hypervisor.delete_vm(&node, vmid)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                tracing::info!(vps_id = %id, vmid, "guest already absent on hypervisor");
            }
            Err(e) => return Err(Error::remote("delete_vm")(e)),
        }

        if owns_address {
            self.release_instance_address(&vps).await?;
        }

        self.store.delete_vps(id).await?;
        self.locks.forget(id);
        tracing::info!(vps_id = %id, vmid, "vps deleted");
        Ok(())
    }

    /// Release the instance's address if it is still allocated to its owner.
    pub(super) async fn release_instance_address(&self, vps: &Vps) -> Result<()> {
        let address = match self.store.get_address_by_id(vps.ip_address_id).await {
            Ok(address) => address,
            Err(pvm_db::Error::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match self.addresses.release_owned(&address.address, vps.owner_id).await {
            Ok(_) => Ok(()),
            Err(Error::Conflict(reason)) => {
                tracing::warn!(vps_id = %vps.id, address = %address.address, %reason, "address not held by vps, leaving it");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn transitioned(&self, vps: &Vps, status: VpsStatus) -> Result<Vps> {
        let updated = self.store.set_vps_status(vps.id, status).await?;
        tracing::info!(vps_id = %vps.id, from = %vps.status, to = %status, "vps status changed");
        Ok(updated)
    }
}
