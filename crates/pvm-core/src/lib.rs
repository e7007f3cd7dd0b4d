//! Orchestration core: the address inventory, VPS lifecycle sagas and
//! backups, over a [`pvm_db::Store`] and a [`pvm_infra::Hypervisor`].

pub mod address_pool;
pub mod backup;
pub mod error;
pub mod network;
pub mod orchestrator;

mod remote;

pub use address_pool::{AddressPool, Assignment, CreatePoolRequest, PoolStatistics, PoolUpdate};
pub use backup::BackupManager;
pub use error::{Error, ErrorKind, Result};
pub use orchestrator::{
    AddressSource, CreateVpsRequest, OrchestratorConfig, ReconcileReport, VpsOrchestrator,
};
pub use pvm_db::models::{
    AddressFilter, AddressStatus, IpAddress, IpPool, Page as Pagination, Vps, VpsBackup, VpsStatus,
};
