use std::time::Duration;

use async_trait::async_trait;
use pve_api::{Credentials, Params, PveClient, StatusAction, Upid};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::types::{BackupVolume, NodeInfo, OsFamily, OsInstall, TaskRef, VmSpec, VmStatus};
use crate::{Error, Hypervisor, Result};

/// Proxmox VE hypervisor backed by the `pve-api` client.
///
/// Task-returning calls (create, clone, power actions, delete) block until the
/// task finishes so callers observe the guest in its new state.
pub struct ProxmoxHypervisor {
    client: PveClient,
    template_storage: String,
    task_timeout: Duration,
    poll_interval: Duration,
}

impl ProxmoxHypervisor {
    pub fn new(client: PveClient, task_timeout: Duration) -> Self {
        Self {
            client,
            template_storage: "local".into(),
            task_timeout,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_template_storage(mut self, storage: impl Into<String>) -> Self {
        self.template_storage = storage.into();
        self
    }

    /// Create from env vars:
    ///
    /// - `PVE_HOST` (required)
    /// - `PVE_PORT` (default: `8006`)
    /// - `PVE_USER` (default: `"root@pam"`)
    /// - `PVE_TOKEN_NAME` + `PVE_TOKEN_VALUE`, or `PVE_PASSWORD`
    /// - `PVE_VERIFY_TLS` (default: `true`)
    /// - `PVE_TASK_TIMEOUT_SECS` (default: `90`)
    /// - `PVE_TEMPLATE_STORAGE` (default: `"local"`)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let host = std::env::var("PVE_HOST").map_err(|_| Error::MissingEnv("PVE_HOST".into()))?;
        let port = std::env::var("PVE_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8006);
        let user = std::env::var("PVE_USER").unwrap_or_else(|_| "root@pam".into());

        let token_name = std::env::var("PVE_TOKEN_NAME").ok().filter(|s| !s.is_empty());
        let token_value = std::env::var("PVE_TOKEN_VALUE").ok().filter(|s| !s.is_empty());
        let credentials = match (token_name, token_value) {
            (Some(token_name), Some(token_value)) => Credentials::ApiToken {
                user,
                token_name,
                token_value,
            },
            _ => Credentials::Password {
                user,
                password: std::env::var("PVE_PASSWORD").map_err(|_| {
                    Error::MissingEnv("PVE_TOKEN_NAME/PVE_TOKEN_VALUE or PVE_PASSWORD".into())
                })?,
            },
        };

        let verify_tls = std::env::var("PVE_VERIFY_TLS")
            .map(|s| !matches!(s.as_str(), "0" | "false" | "no"))
            .unwrap_or(true);

        let task_timeout = std::env::var("PVE_TASK_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(90));

        let template_storage =
            std::env::var("PVE_TEMPLATE_STORAGE").unwrap_or_else(|_| "local".into());

        let client = PveClient::new(format!("https://{host}:{port}"), credentials, verify_tls)?;

        Ok(Self::new(client, task_timeout).with_template_storage(template_storage))
    }

    /// Poll a task until it stops, failing on a non-OK exit status.
    async fn wait_for_task(&self, node: &str, upid: &Upid) -> Result<()> {
        let deadline = Instant::now() + self.task_timeout;
        loop {
            let status = self.client.task_status(node, upid).await?;
            if !status.is_running() {
                if status.succeeded() {
                    return Ok(());
                }
                let exit_status = status.exitstatus.unwrap_or_else(|| "unknown".into());
                if exit_status.to_ascii_lowercase().contains("does not exist") {
                    return Err(Error::NotFound(exit_status));
                }
                return Err(Error::Task {
                    upid: upid.0.clone(),
                    exit_status,
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(self.task_timeout));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn power(&self, node: &str, vmid: u32, action: StatusAction) -> Result<()> {
        let upid = self.client.qemu_status_action(node, vmid, action).await?;
        self.wait_for_task(node, &upid).await
    }

    /// Find a template guest on `node` by name.
    async fn resolve_template(&self, node: &str, name: &str) -> Result<u32> {
        self.client
            .qemu_list(node)
            .await?
            .into_iter()
            .find(|vm| vm.is_template() && vm.name.as_deref() == Some(name))
            .map(|vm| vm.vmid)
            .ok_or_else(|| Error::Template(format!("{name} on node {node}")))
    }

    /// `net0` descriptor. Proxmox rate limits are in MB/s.
    pub(crate) fn net0(spec: &VmSpec) -> String {
        let mut net = format!("virtio,bridge={}", spec.network.bridge);
        if let Some(vlan) = spec.network.vlan {
            net.push_str(&format!(",tag={vlan}"));
        }
        if let Some(mbps) = spec.network.rate_limit_mbps.filter(|m| *m > 0) {
            net.push_str(&format!(",rate={}", f64::from(mbps) / 8.0));
        }
        net
    }

    pub(crate) fn ipconfig0(spec: &VmSpec) -> String {
        format!(
            "ip={}/{},gw={}",
            spec.network.address, spec.network.prefix_len, spec.network.gateway
        )
    }

    fn ostype(family: OsFamily) -> &'static str {
        match family {
            OsFamily::Linux => "l26",
            OsFamily::Windows => "win10",
        }
    }

    /// Settings shared by fresh guests and applied to clones after cloning.
    pub(crate) fn hardware_params(spec: &VmSpec) -> Params {
        let mut params = Params::new()
            .set("name", &spec.name)
            .set("cores", spec.cores)
            .set("memory", spec.memory_mb)
            .set("ostype", Self::ostype(spec.os_family))
            .set("net0", Self::net0(spec))
            .set("ipconfig0", Self::ipconfig0(spec));
        if let Some(ns) = spec.nameserver {
            params.insert("nameserver", ns);
        }
        params
    }

    /// Parameters for `POST /nodes/{node}/qemu` (non-clone installs).
    pub(crate) fn create_params(&self, spec: &VmSpec) -> Params {
        let mut params = Self::hardware_params(spec)
            .set("vmid", spec.vmid)
            .set("scsihw", "virtio-scsi-pci");

        match &spec.install {
            OsInstall::NamedTemplate { template } => {
                let volume = if template.contains(':') {
                    template.clone()
                } else {
                    format!("{}:import/{template}.qcow2", self.template_storage)
                };
                params.insert("scsi0", format!("{}:0,import-from={volume}", spec.storage));
                params.insert("ide2", format!("{}:cloudinit", spec.storage));
                params.insert("boot", "order=scsi0");
            }
            OsInstall::IsoBoot { iso, device } => {
                params.insert("scsi0", format!("{}:{}", spec.storage, spec.disk_gb));
                params.insert(device.clone(), format!("{iso},media=cdrom"));
                params.insert("boot", format!("order={device};scsi0"));
            }
            OsInstall::CloneFromTemplate { .. } => {}
        }
        params
    }

    pub(crate) fn clone_params(spec: &VmSpec) -> Params {
        Params::new()
            .set("newid", spec.vmid)
            .set("name", &spec.name)
            .set("full", 1)
            .set("storage", &spec.storage)
    }
}

#[async_trait]
impl Hypervisor for ProxmoxHypervisor {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>> {
        let nodes = self.client.nodes().await?;
        Ok(nodes
            .into_iter()
            .map(|n| NodeInfo {
                online: n.status.as_deref() == Some("online"),
                name: n.node,
            })
            .collect())
    }

    async fn list_vmids(&self, node: Option<&str>) -> Result<Vec<u32>> {
        if let Some(node) = node {
            let vms = self.client.qemu_list(node).await?;
            return Ok(vms.into_iter().map(|vm| vm.vmid).collect());
        }

        let mut vmids = Vec::new();
        for node in self.list_nodes().await? {
            match self.client.qemu_list(&node.name).await {
                Ok(vms) => vmids.extend(vms.into_iter().map(|vm| vm.vmid)),
                Err(e) => warn!(node = %node.name, error = %e, "proxmox: failed to list guests on node"),
            }
        }
        Ok(vmids)
    }

    async fn create_vm(&self, node: &str, spec: &VmSpec) -> Result<()> {
        match &spec.install {
            OsInstall::CloneFromTemplate { template } => {
                let source = self.resolve_template(node, template).await?;
                let upid = self
                    .client
                    .qemu_clone(node, source, &Self::clone_params(spec))
                    .await?;
                self.wait_for_task(node, &upid).await?;
                self.client
                    .qemu_update_config(node, spec.vmid, &Self::hardware_params(spec))
                    .await?;
            }
            OsInstall::NamedTemplate { .. } | OsInstall::IsoBoot { .. } => {
                let upid = self.client.qemu_create(node, &self.create_params(spec)).await?;
                self.wait_for_task(node, &upid).await?;
            }
        }

        info!(node, vmid = spec.vmid, name = %spec.name, "proxmox: guest created");
        Ok(())
    }

    async fn start_vm(&self, node: &str, vmid: u32) -> Result<()> {
        self.power(node, vmid, StatusAction::Start).await?;
        info!(node, vmid, "proxmox: guest started");
        Ok(())
    }

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<()> {
        self.power(node, vmid, StatusAction::Stop).await?;
        info!(node, vmid, "proxmox: guest stopped");
        Ok(())
    }

    async fn restart_vm(&self, node: &str, vmid: u32) -> Result<()> {
        self.power(node, vmid, StatusAction::Reset).await?;
        info!(node, vmid, "proxmox: guest reset");
        Ok(())
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<()> {
        let upid = self.client.qemu_delete(node, vmid).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound(format!("guest {vmid} on node {node}"))
            } else {
                Error::Proxmox(e)
            }
        })?;
        self.wait_for_task(node, &upid).await?;
        info!(node, vmid, "proxmox: guest destroyed");
        Ok(())
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus> {
        let status = self.client.qemu_current_status(node, vmid).await.map_err(|e| {
            if e.is_not_found() {
                Error::NotFound(format!("guest {vmid} on node {node}"))
            } else {
                Error::Proxmox(e)
            }
        })?;
        Ok(VmStatus {
            status: status.status,
        })
    }

    async fn backup_vm(&self, node: &str, vmid: u32, storage: &str) -> Result<TaskRef> {
        let params = Params::new()
            .set("vmid", vmid)
            .set("storage", storage)
            .set("compress", "zstd")
            .set("mode", "snapshot");
        let upid = self.client.vzdump(node, &params).await?;
        info!(node, vmid, storage, upid = %upid, "proxmox: backup started");
        Ok(TaskRef(upid.0))
    }

    async fn list_backups(&self, node: &str, storage: &str, vmid: u32) -> Result<Vec<BackupVolume>> {
        let marker = format!("vzdump-qemu-{vmid}-");
        let volumes = self
            .client
            .storage_content(node, storage, Some("backup"))
            .await?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.vmid == Some(vmid) || v.volid.contains(&marker))
            .map(|v| BackupVolume {
                volid: v.volid,
                size_bytes: v.size,
                created_at: v.ctime,
            })
            .collect())
    }
}
