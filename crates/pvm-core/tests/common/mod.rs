#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pvm_core::{
    AddressPool, BackupManager, CreatePoolRequest, CreateVpsRequest, IpPool, OrchestratorConfig,
    VpsOrchestrator,
};
use pvm_db::models::{
    AddressChange, AddressCounts, AddressFilter, AddressPrecondition, IpAddress, IpPoolUpdate,
    NewBackup, NewIpPool, NewVps, Page, Vps, VpsBackup, VpsStatus,
};
use pvm_db::{MemoryStore, Result as DbResult, Store};
use pvm_infra::types::{BackupVolume, NodeInfo, TaskRef, VmSpec, VmStatus};
use pvm_infra::{Error, Hypervisor, Result};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub node: String,
    pub status: String,
    pub spec: VmSpec,
}

#[derive(Default)]
struct FakeState {
    vms: BTreeMap<u32, FakeVm>,
    foreign_vmids: Vec<u32>,
    failures: HashMap<&'static str, String>,
    status_failures: HashMap<u32, String>,
    delays: HashMap<&'static str, Duration>,
    backups: Vec<(String, u32, BackupVolume)>,
    calls: Vec<String>,
}

/// Scripted in-memory hypervisor. Operations can be made to fail with a
/// remote error or to stall for a while.
#[derive(Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn fail_on(&self, op: &'static str, message: &str) {
        self.state.lock().failures.insert(op, message.to_owned());
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.state.lock().failures.remove(op);
    }

    pub fn fail_status_of(&self, vmid: u32, message: &str) {
        self.state.lock().status_failures.insert(vmid, message.to_owned());
    }

    pub fn delay(&self, op: &'static str, by: Duration) {
        self.state.lock().delays.insert(op, by);
    }

    /// A guest that exists on the cluster but not in the store.
    pub fn add_foreign_vmid(&self, vmid: u32) {
        self.state.lock().foreign_vmids.push(vmid);
    }

    pub fn set_status(&self, vmid: u32, status: &str) {
        if let Some(vm) = self.state.lock().vms.get_mut(&vmid) {
            vm.status = status.to_owned();
        }
    }

    pub fn remove_vm(&self, vmid: u32) {
        self.state.lock().vms.remove(&vmid);
    }

    pub fn vm(&self, vmid: u32) -> Option<FakeVm> {
        self.state.lock().vms.get(&vmid).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn was_called(&self, op: &str) -> bool {
        self.state.lock().calls.iter().any(|c| c.starts_with(op))
    }

    async fn enter(&self, op: &'static str, target: impl std::fmt::Display) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(format!("{op} {target}"));
            state.delays.get(op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.state.lock().failures.get(op) {
            Some(message) => Err(Error::Task {
                upid: format!("UPID:fake:{op}"),
                exit_status: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn with_vm<T>(&self, vmid: u32, f: impl FnOnce(&mut FakeVm) -> T) -> Result<T> {
        self.state
            .lock()
            .vms
            .get_mut(&vmid)
            .map(f)
            .ok_or_else(|| Error::NotFound(format!("VM {vmid}")))
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        self.enter("list_nodes", "").await?;
        Ok(vec![NodeInfo {
            name: "pve1".into(),
            online: true,
        }])
    }

    async fn list_vmids(&self, _node: Option<&str>) -> Result<Vec<u32>> {
        self.enter("list_vmids", "").await?;
        let state = self.state.lock();
        Ok(state
            .vms
            .keys()
            .copied()
            .chain(state.foreign_vmids.iter().copied())
            .collect())
    }

    async fn create_vm(&self, node: &str, spec: &VmSpec) -> Result<()> {
        self.enter("create_vm", spec.vmid).await?;
        let mut state = self.state.lock();
        if state.vms.contains_key(&spec.vmid) {
            return Err(Error::Task {
                upid: "UPID:fake:create_vm".into(),
                exit_status: format!("VM {} already exists", spec.vmid),
            });
        }
        state.vms.insert(
            spec.vmid,
            FakeVm {
                node: node.to_owned(),
                status: "stopped".into(),
                spec: spec.clone(),
            },
        );
        Ok(())
    }

    async fn start_vm(&self, _node: &str, vmid: u32) -> Result<()> {
        self.enter("start_vm", vmid).await?;
        self.with_vm(vmid, |vm| vm.status = "running".into())
    }

    async fn stop_vm(&self, _node: &str, vmid: u32) -> Result<()> {
        self.enter("stop_vm", vmid).await?;
        self.with_vm(vmid, |vm| vm.status = "stopped".into())
    }

    async fn restart_vm(&self, _node: &str, vmid: u32) -> Result<()> {
        self.enter("restart_vm", vmid).await?;
        self.with_vm(vmid, |vm| vm.status = "running".into())
    }

    async fn delete_vm(&self, _node: &str, vmid: u32) -> Result<()> {
        self.enter("delete_vm", vmid).await?;
        self.state
            .lock()
            .vms
            .remove(&vmid)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("VM {vmid}")))
    }

    async fn vm_status(&self, _node: &str, vmid: u32) -> Result<VmStatus> {
        self.enter("vm_status", vmid).await?;
        if let Some(message) = self.state.lock().status_failures.get(&vmid) {
            return Err(Error::Task {
                upid: "UPID:fake:vm_status".into(),
                exit_status: message.clone(),
            });
        }
        self.with_vm(vmid, |vm| VmStatus {
            status: vm.status.clone(),
        })
    }

    async fn backup_vm(&self, _node: &str, vmid: u32, storage: &str) -> Result<TaskRef> {
        self.enter("backup_vm", vmid).await?;
        self.with_vm(vmid, |_| ())?;
        let mut state = self.state.lock();
        let volid = format!("{storage}:backup/vzdump-qemu-{vmid}-fake.vma.zst");
        state.backups.push((
            storage.to_owned(),
            vmid,
            BackupVolume {
                volid,
                size_bytes: Some(4096),
                created_at: None,
            },
        ));
        Ok(TaskRef(format!("UPID:fake:vzdump:{vmid}")))
    }

    async fn list_backups(&self, _node: &str, storage: &str, vmid: u32) -> Result<Vec<BackupVolume>> {
        self.enter("list_backups", vmid).await?;
        Ok(self
            .state
            .lock()
            .backups
            .iter()
            .filter(|(s, v, _)| s == storage && *v == vmid)
            .map(|(_, _, volume)| volume.clone())
            .collect())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub hypervisor: Arc<FakeHypervisor>,
    pub addresses: AddressPool,
    pub orchestrator: Arc<VpsOrchestrator>,
    pub backups: BackupManager,
}

pub fn harness_with(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let hypervisor = Arc::new(FakeHypervisor::default());
    let remote_timeout = config.remote_timeout;
    Harness {
        addresses: AddressPool::new(store.clone()),
        orchestrator: Arc::new(VpsOrchestrator::new(
            store.clone(),
            hypervisor.clone(),
            config,
        )),
        backups: BackupManager::new(store.clone(), hypervisor.clone(), remote_timeout),
        store,
        hypervisor,
    }
}

pub fn harness() -> Harness {
    harness_with(OrchestratorConfig {
        remote_timeout: Duration::from_secs(5),
        ..Default::default()
    })
}

pub fn pool_request(name: &str, network: &str, gateway: &str) -> CreatePoolRequest {
    CreatePoolRequest {
        name: name.into(),
        network: network.into(),
        gateway: gateway.into(),
        subnet_mask: None,
        dns_servers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
        vlan_id: None,
        notes: None,
    }
}

pub async fn seed_pool(h: &Harness) -> IpPool {
    h.addresses
        .create_pool(&pool_request("lan", "10.0.0.0/24", "10.0.0.1"))
        .await
        .unwrap()
}

pub fn vps_request(owner_id: Uuid, name: &str) -> CreateVpsRequest {
    CreateVpsRequest {
        owner_id,
        name: name.into(),
        node: "pve1".into(),
        cpu_cores: 2,
        memory_mb: 2048,
        disk_gb: 20,
        os_type: "linux".into(),
        os_template: "ubuntu-22.04".into(),
        ..Default::default()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Wraps a [`MemoryStore`] and parks the first write that marks an instance
/// running until [`GatedStore::release`] is called.
pub struct GatedStore {
    pub inner: Arc<MemoryStore>,
    armed: Mutex<bool>,
    reached: tokio::sync::Notify,
    release: tokio::sync::Notify,
}

impl GatedStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            armed: Mutex::new(true),
            reached: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        }
    }

    /// Resolves once the running write is parked.
    pub async fn running_write_parked(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl Store for GatedStore {
    async fn create_pool(&self, pool: &NewIpPool<'_>, addresses: &[String]) -> DbResult<IpPool> {
        self.inner.create_pool(pool, addresses).await
    }

    async fn get_pool(&self, id: Uuid) -> DbResult<IpPool> {
        self.inner.get_pool(id).await
    }

    async fn list_pools(&self, page: Page) -> DbResult<Vec<IpPool>> {
        self.inner.list_pools(page).await
    }

    async fn update_pool(&self, id: Uuid, changes: &IpPoolUpdate) -> DbResult<IpPool> {
        self.inner.update_pool(id, changes).await
    }

    async fn get_address(&self, address: &str) -> DbResult<IpAddress> {
        self.inner.get_address(address).await
    }

    async fn get_address_by_id(&self, id: Uuid) -> DbResult<IpAddress> {
        self.inner.get_address_by_id(id).await
    }

    async fn list_addresses(&self, filter: &AddressFilter, page: Page) -> DbResult<Vec<IpAddress>> {
        self.inner.list_addresses(filter, page).await
    }

    async fn first_available(&self, pool_id: Option<Uuid>) -> DbResult<Option<IpAddress>> {
        self.inner.first_available(pool_id).await
    }

    async fn transition_address(
        &self,
        address: &str,
        expect: &AddressPrecondition,
        change: &AddressChange,
    ) -> DbResult<IpAddress> {
        self.inner.transition_address(address, expect, change).await
    }

    async fn address_counts(&self, pool_id: Option<Uuid>) -> DbResult<AddressCounts> {
        self.inner.address_counts(pool_id).await
    }

    async fn insert_vps(&self, vps: &NewVps<'_>) -> DbResult<Vps> {
        self.inner.insert_vps(vps).await
    }

    async fn get_vps(&self, id: Uuid) -> DbResult<Vps> {
        self.inner.get_vps(id).await
    }

    async fn list_vps(&self, owner_id: Option<Uuid>, page: Page) -> DbResult<Vec<Vps>> {
        self.inner.list_vps(owner_id, page).await
    }

    async fn list_all_vps(&self) -> DbResult<Vec<Vps>> {
        self.inner.list_all_vps().await
    }

    async fn set_vps_status(&self, id: Uuid, status: VpsStatus) -> DbResult<Vps> {
        let park = status == VpsStatus::Running && std::mem::take(&mut *self.armed.lock());
        if park {
            self.reached.notify_one();
            self.release.notified().await;
        }
        self.inner.set_vps_status(id, status).await
    }

    async fn delete_vps(&self, id: Uuid) -> DbResult<()> {
        self.inner.delete_vps(id).await
    }

    async fn list_vmids(&self) -> DbResult<Vec<u32>> {
        self.inner.list_vmids().await
    }

    async fn insert_backup(&self, backup: &NewBackup<'_>) -> DbResult<VpsBackup> {
        self.inner.insert_backup(backup).await
    }

    async fn list_backups(&self, vps_id: Uuid, page: Page) -> DbResult<Vec<VpsBackup>> {
        self.inner.list_backups(vps_id, page).await
    }
}
