use pvm_db::models::{Vps, VpsStatus};
use serde::Serialize;

use super::{VpsOrchestrator, vmid_of};
use crate::error::Result;
use crate::remote::bounded;

/// Outcome of one reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub checked: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

fn status_from_remote(status: &str) -> Option<VpsStatus> {
    match status {
        "running" => Some(VpsStatus::Running),
        "stopped" => Some(VpsStatus::Stopped),
        _ => None,
    }
}

enum Outcome {
    Unchanged,
    Updated,
    Skipped,
    Failed,
}

impl VpsOrchestrator {
    /// Overwrite local status with what the hypervisor reports.
    ///
    /// Instances mid-saga (locked, `creating`, `deleting`) and terminal
    /// `failed` instances are left alone. A failure fetching one instance's
    /// status, including a guest the node no longer reports, is logged and
    /// counted without touching the record; the sweep always covers the rest.
    pub async fn reconcile_status(&self) -> Result<ReconcileReport> {
        let all = self.store.list_all_vps().await?;
        let mut report = ReconcileReport::default();

        for vps in &all {
            report.checked += 1;
            match self.reconcile_one(vps).await {
                Outcome::Unchanged => {}
                Outcome::Updated => report.updated += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }

        tracing::info!(
            checked = report.checked,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "reconciliation sweep finished"
        );
        Ok(report)
    }

    async fn reconcile_one(&self, listed: &Vps) -> Outcome {
        if !settled(listed.status) {
            return Outcome::Skipped;
        }
        let Some(_lock) = self.locks.try_lock(listed.id) else {
            tracing::debug!(vps_id = %listed.id, "vps busy, skipping");
            return Outcome::Skipped;
        };

        // Re-read under the lock; the listing may be stale.
        let vps = match self.store.get_vps(listed.id).await {
            Ok(vps) if settled(vps.status) => vps,
            Ok(_) | Err(pvm_db::Error::NotFound { .. }) => return Outcome::Skipped,
            Err(e) => {
                tracing::warn!(vps_id = %listed.id, error = %e, "failed to reload vps");
                return Outcome::Failed;
            }
        };

        let remote = bounded(
            self.config.remote_timeout,
            self.hypervisor.vm_status(&vps.node_name, vmid_of(&vps)),
        )
        .await;

        let status = match remote {
            Ok(remote) => match status_from_remote(&remote.status) {
                Some(status) => status,
                None => {
                    tracing::warn!(vps_id = %vps.id, status = %remote.status, "unrecognised remote status");
                    return Outcome::Skipped;
                }
            },
            Err(e) => {
                tracing::warn!(vps_id = %vps.id, vmid = vps.vmid, error = %e, "failed to fetch remote status");
                return Outcome::Failed;
            }
        };

        if status == vps.status {
            return Outcome::Unchanged;
        }
        match self.store.set_vps_status(vps.id, status).await {
            Ok(_) => {
                tracing::info!(vps_id = %vps.id, from = %vps.status, to = %status, "status reconciled");
                Outcome::Updated
            }
            Err(e) => {
                tracing::warn!(vps_id = %vps.id, error = %e, "failed to store reconciled status");
                Outcome::Failed
            }
        }
    }
}

fn settled(status: VpsStatus) -> bool {
    matches!(status, VpsStatus::Running | VpsStatus::Stopped)
}
