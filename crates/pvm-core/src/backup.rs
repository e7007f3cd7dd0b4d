use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pvm_db::Store;
use pvm_db::models::{NewBackup, Page, VpsBackup, VpsStatus};
use pvm_infra::Hypervisor;
use pvm_infra::types::BackupVolume;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::remote::bounded;

/// `{vmid}-{YYYYmmddHHMMSS}`.
pub fn backup_id(vmid: u32, at: DateTime<Utc>) -> String {
    format!("{vmid}-{}", at.format("%Y%m%d%H%M%S"))
}

/// Archive name the hypervisor writes for a zstd-compressed vzdump.
pub fn backup_file_name(vmid: u32, at: DateTime<Utc>) -> String {
    format!("vzdump-qemu-{vmid}-{}.vma.zst", at.format("%Y_%m_%d-%H_%M_%S"))
}

pub struct BackupManager {
    store: Arc<dyn Store>,
    hypervisor: Arc<dyn Hypervisor>,
    remote_timeout: Duration,
}

impl BackupManager {
    pub fn new(store: Arc<dyn Store>, hypervisor: Arc<dyn Hypervisor>, remote_timeout: Duration) -> Self {
        Self {
            store,
            hypervisor,
            remote_timeout,
        }
    }

    /// Back the guest up into `storage` and record it.
    ///
    /// The hypervisor does not report the archive size when it accepts the
    /// job, so `file_size` is stored empty; [`remote_backups`](Self::remote_backups)
    /// lists the real sizes.
    pub async fn create_backup(
        &self,
        vps_id: Uuid,
        storage: &str,
        is_auto: bool,
        notes: Option<&str>,
    ) -> Result<VpsBackup> {
        let vps = self.store.get_vps(vps_id).await?;
        if !matches!(vps.status, VpsStatus::Running | VpsStatus::Stopped) {
            return Err(Error::Conflict(format!(
                "cannot back up vps {vps_id} while it is {}",
                vps.status
            )));
        }
        let vmid = u32::try_from(vps.vmid).unwrap_or_default();

        let task = bounded(
            self.remote_timeout,
            self.hypervisor.backup_vm(&vps.node_name, vmid, storage),
        )
        .await
        .map_err(Error::remote("backup_vm"))?;

        let now = Utc::now();
        let backup_id = backup_id(vmid, now);
        let file_name = backup_file_name(vmid, now);
        let backup = self
            .store
            .insert_backup(&NewBackup {
                vps_id,
                backup_id: &backup_id,
                file_name: &file_name,
                file_size: None,
                is_auto,
                notes,
                created_at: now,
            })
            .await?;

        tracing::info!(%vps_id, vmid, backup_id = %backup.backup_id, task = %task.0, is_auto, "backup recorded");
        Ok(backup)
    }

    pub async fn list_backups(&self, vps_id: Uuid, page: Page) -> Result<Vec<VpsBackup>> {
        self.store.get_vps(vps_id).await?;
        Ok(self.store.list_backups(vps_id, page).await?)
    }

    /// Archives of the guest actually present on `storage`, with sizes.
    pub async fn remote_backups(&self, vps_id: Uuid, storage: &str) -> Result<Vec<BackupVolume>> {
        let vps = self.store.get_vps(vps_id).await?;
        let vmid = u32::try_from(vps.vmid).unwrap_or_default();
        bounded(
            self.remote_timeout,
            self.hypervisor.list_backups(&vps.node_name, storage, vmid),
        )
        .await
        .map_err(Error::remote("list_backups"))
    }
}
