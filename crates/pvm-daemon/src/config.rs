use std::env;
use std::time::Duration;

use pvm_core::{CreatePoolRequest, OrchestratorConfig};

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub database_url: String,
    pub reconcile_interval_secs: u64,
    pub orchestrator: OrchestratorConfig,
    /// Pool created at start-up when it does not exist yet.
    pub bootstrap_pool: Option<CreatePoolRequest>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = OrchestratorConfig::default();
        let remote_timeout_secs: u64 = var("PVM_REMOTE_TIMEOUT_SECS")
            .unwrap_or_else(|| "120".into())
            .parse()
            .expect("PVM_REMOTE_TIMEOUT_SECS must be a valid u64");

        Self {
            database_url: var("DATABASE_URL").expect("DATABASE_URL must be set"),
            reconcile_interval_secs: var("RECONCILE_INTERVAL_SECS")
                .unwrap_or_else(|| "60".into())
                .parse()
                .expect("RECONCILE_INTERVAL_SECS must be a valid u64"),
            orchestrator: OrchestratorConfig {
                storage: var("PVM_STORAGE").unwrap_or(defaults.storage),
                bridge: var("PVM_BRIDGE").unwrap_or(defaults.bridge),
                iso_storage: var("PVM_ISO_STORAGE").unwrap_or(defaults.iso_storage),
                remote_timeout: Duration::from_secs(remote_timeout_secs),
                vmid_floor: var("PVM_VMID_FLOOR")
                    .map(|v| v.parse().expect("PVM_VMID_FLOOR must be a valid u32"))
                    .unwrap_or(defaults.vmid_floor),
            },
            bootstrap_pool: bootstrap_pool(&var),
        }
    }
}

fn bootstrap_pool(var: &impl Fn(&str) -> Option<String>) -> Option<CreatePoolRequest> {
    let name = var("PVM_BOOTSTRAP_POOL_NAME")?;
    Some(CreatePoolRequest {
        name,
        network: var("PVM_BOOTSTRAP_NETWORK")
            .expect("PVM_BOOTSTRAP_NETWORK must be set with PVM_BOOTSTRAP_POOL_NAME"),
        gateway: var("PVM_BOOTSTRAP_GATEWAY")
            .expect("PVM_BOOTSTRAP_GATEWAY must be set with PVM_BOOTSTRAP_POOL_NAME"),
        subnet_mask: var("PVM_BOOTSTRAP_SUBNET_MASK"),
        dns_servers: var("PVM_BOOTSTRAP_DNS")
            .map(|dns| {
                dns.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        vlan_id: None,
        notes: Some("created at daemon start-up".into()),
    })
}
