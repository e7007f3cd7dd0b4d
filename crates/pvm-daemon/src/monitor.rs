use std::sync::Arc;
use std::time::Duration;

use pvm_core::VpsOrchestrator;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Spawn the recurring reconciliation sweep. The loop exits once `shutdown`
/// flips to `true`; a sweep already running finishes first.
pub fn spawn_reconciler(
    orchestrator: Arc<VpsOrchestrator>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = orchestrator.reconcile_status().await {
                        tracing::error!(error = %e, "reconciliation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    })
}
