mod config;
mod monitor;

use std::sync::Arc;

use pvm_core::{AddressPool, CreatePoolRequest, ErrorKind, VpsOrchestrator};
use pvm_db::PgStore;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;
use crate::monitor::spawn_reconciler;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = DaemonConfig::from_env();

    // Database
    let db = pvm_db::create_pool(&config.database_url)
        .await
        .expect("failed to connect to database");

    pvm_db::run_migrations(&db)
        .await
        .expect("failed to run migrations");

    let store = Arc::new(PgStore::new(db));

    // Hypervisor
    let hypervisor = pvm_infra::build_hypervisor().expect("failed to build hypervisor client");

    let addresses = AddressPool::new(store.clone());
    let orchestrator = Arc::new(VpsOrchestrator::new(
        store,
        hypervisor,
        config.orchestrator.clone(),
    ));

    if let Some(pool) = &config.bootstrap_pool {
        bootstrap_pool(&addresses, pool).await;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = spawn_reconciler(orchestrator, config.reconcile_interval_secs, shutdown_rx);
    tracing::info!(interval_secs = config.reconcile_interval_secs, "pvm daemon started");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for shutdown signal");
    tracing::info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler.await {
        tracing::error!(error = %e, "reconciler task panicked");
    }
}

async fn bootstrap_pool(addresses: &AddressPool, pool: &CreatePoolRequest) {
    match addresses.create_pool(pool).await {
        Ok(created) => tracing::info!(pool_id = %created.id, name = %created.name, "bootstrap pool created"),
        Err(e) if e.kind() == ErrorKind::Conflict => {
            tracing::info!(name = %pool.name, "bootstrap pool already present");
        }
        Err(e) => panic!("failed to create bootstrap pool {}: {e}", pool.name),
    }
}
