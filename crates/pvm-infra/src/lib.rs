pub mod proxmox;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use types::{BackupVolume, NodeInfo, TaskRef, VmSpec, VmStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("proxmox error: {0}")]
    Proxmox(#[from] pve_api::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("task {upid} failed: {exit_status}")]
    Task { upid: String, exit_status: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("template not found: {0}")]
    Template(String),

    #[error("missing env var: {0}")]
    MissingEnv(String),
}

impl Error {
    /// Whether the remote resource is already absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Proxmox(e) => e.is_not_found(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Narrow interface to the hypervisor cluster.
///
/// Implementations own their connection/session lifecycle; callers only see
/// these operations, so a test double can stand in for the real cluster.
/// Failures carry the remote system's error text verbatim.
#[async_trait]
pub trait Hypervisor: Send + Sync + 'static {
    async fn list_nodes(&self) -> Result<Vec<NodeInfo>>;

    /// VM identifiers in use on `node`, or across every node when `None`.
    async fn list_vmids(&self, node: Option<&str>) -> Result<Vec<u32>>;

    async fn create_vm(&self, node: &str, spec: &VmSpec) -> Result<()>;

    async fn start_vm(&self, node: &str, vmid: u32) -> Result<()>;

    async fn stop_vm(&self, node: &str, vmid: u32) -> Result<()>;

    async fn restart_vm(&self, node: &str, vmid: u32) -> Result<()>;

    async fn delete_vm(&self, node: &str, vmid: u32) -> Result<()>;

    async fn vm_status(&self, node: &str, vmid: u32) -> Result<VmStatus>;

    /// Kick off a backup into `storage`. Returns once the task is accepted.
    async fn backup_vm(&self, node: &str, vmid: u32, storage: &str) -> Result<TaskRef>;

    /// Backup archives of `vmid` present on `storage`.
    async fn list_backups(&self, node: &str, storage: &str, vmid: u32) -> Result<Vec<BackupVolume>>;
}

/// Build the cluster hypervisor from environment variables.
pub fn build_hypervisor() -> Result<Arc<dyn Hypervisor>> {
    dotenvy::dotenv().ok();

    let hypervisor = proxmox::ProxmoxHypervisor::from_env()?;
    tracing::info!("registered Proxmox VE hypervisor");
    Ok(Arc::new(hypervisor))
}
