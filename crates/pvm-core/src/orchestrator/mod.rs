//! VPS lifecycle sagas spanning the record store, the address pool and the
//! hypervisor.

mod create;
mod guard;
mod lifecycle;
mod locks;
mod reconcile;
mod vmid;

use std::sync::Arc;
use std::time::Duration;

use pvm_db::Store;
use pvm_db::models::{Page, Vps};
use pvm_infra::Hypervisor;
use uuid::Uuid;

use crate::address_pool::AddressPool;
use crate::error::Result;

pub use create::{AddressSource, CreateVpsRequest};
pub use reconcile::ReconcileReport;

use locks::InstanceLocks;
use vmid::VmidAllocator;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Storage target for guest disks.
    pub storage: String,
    /// Bridge the guest NIC attaches to.
    pub bridge: String,
    /// Storage holding installer ISOs.
    pub iso_storage: String,
    /// Deadline for every individual hypervisor call.
    pub remote_timeout: Duration,
    /// Lowest VM identifier handed out.
    pub vmid_floor: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            storage: "local-lvm".into(),
            bridge: "vmbr0".into(),
            iso_storage: "local".into(),
            remote_timeout: Duration::from_secs(120),
            vmid_floor: 100,
        }
    }
}

pub struct VpsOrchestrator {
    store: Arc<dyn Store>,
    hypervisor: Arc<dyn Hypervisor>,
    addresses: AddressPool,
    config: OrchestratorConfig,
    locks: InstanceLocks,
    vmids: VmidAllocator,
}

impl VpsOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        hypervisor: Arc<dyn Hypervisor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            addresses: AddressPool::new(store.clone()),
            vmids: VmidAllocator::new(config.vmid_floor),
            locks: InstanceLocks::default(),
            store,
            hypervisor,
            config,
        }
    }

    pub async fn get_vps(&self, id: Uuid) -> Result<Vps> {
        Ok(self.store.get_vps(id).await?)
    }

    pub async fn list_vps(&self, owner_id: Option<Uuid>, page: Page) -> Result<Vec<Vps>> {
        Ok(self.store.list_vps(owner_id, page).await?)
    }
}

/// Record fields are i32 in the store; the hypervisor speaks u32.
fn vmid_of(vps: &Vps) -> u32 {
    u32::try_from(vps.vmid).unwrap_or_default()
}
