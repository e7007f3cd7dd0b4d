use std::net::Ipv4Addr;

use pvm_db::models::{AddressStatus, IpAddress, IpPool, NewVps, Vps, VpsStatus};
use pvm_infra::types::{NetworkInterface, OsFamily, OsInstall, VmSpec};
use uuid::Uuid;

use super::guard::AllocationGuard;
use super::{OrchestratorConfig, VpsOrchestrator};
use crate::address_pool::Assignment;
use crate::error::{Error, Result};
use crate::network;
use crate::remote::bounded;

const DEFAULT_BANDWIDTH_MBPS: u32 = 1000;
const VMID_ATTEMPTS: u32 = 3;

/// Where the new guest's address comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressSource {
    /// First available address in any active pool.
    #[default]
    Any,
    /// First available address in this pool.
    Pool(Uuid),
    /// This specific address record, which must be available.
    Allocation(Uuid),
}

#[derive(Debug, Clone, Default)]
pub struct CreateVpsRequest {
    pub owner_id: Uuid,
    pub name: String,
    pub node: String,
    pub cpu_cores: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
    /// `linux` or `windows`.
    pub os_type: String,
    pub os_template: String,
    pub bandwidth_mbps: Option<u32>,
    pub notes: Option<String>,
    pub config: Option<serde_json::Value>,
    pub address: AddressSource,
}

/// Fields of a request after validation, already in store types.
struct Validated {
    os_family: OsFamily,
    cpu_cores: i32,
    memory_mb: i32,
    disk_gb: i32,
    bandwidth_mbps: i32,
}

fn positive(field: &str, value: u32) -> Result<i32> {
    match i32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(Error::validation(format!("{field} must be between 1 and {}", i32::MAX))),
    }
}

impl CreateVpsRequest {
    fn validate(&self) -> Result<Validated> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name must not be empty"));
        }
        if self.node.trim().is_empty() {
            return Err(Error::validation("node must not be empty"));
        }
        if self.os_template.trim().is_empty() {
            return Err(Error::validation("os_template must not be empty"));
        }
        let os_family = OsFamily::parse(&self.os_type).ok_or_else(|| {
            Error::validation(format!("os_type: '{}' is not linux or windows", self.os_type))
        })?;
        let bandwidth = self.bandwidth_mbps.unwrap_or(DEFAULT_BANDWIDTH_MBPS);

        Ok(Validated {
            os_family,
            cpu_cores: positive("cpu_cores", self.cpu_cores)?,
            memory_mb: positive("memory_mb", self.memory_mb)?,
            disk_gb: positive("disk_gb", self.disk_gb)?,
            bandwidth_mbps: i32::try_from(bandwidth)
                .map_err(|_| Error::validation("bandwidth_mbps is too large"))?,
        })
    }
}

/// Clone-able cloud images clone from a template guest; other Linux
/// templates import a named image; Windows boots its installer ISO.
pub(crate) fn install_method(config: &OrchestratorConfig, os: OsFamily, template: &str) -> OsInstall {
    match os {
        OsFamily::Linux => {
            let lower = template.to_ascii_lowercase();
            if lower.contains("ubuntu") || lower.contains("debian") {
                OsInstall::CloneFromTemplate {
                    template: format!("template-{template}"),
                }
            } else {
                OsInstall::NamedTemplate {
                    template: format!("template-{template}"),
                }
            }
        }
        OsFamily::Windows => OsInstall::IsoBoot {
            iso: format!("{}:iso/windows-{template}.iso", config.iso_storage),
            device: "ide2".into(),
        },
    }
}

impl VpsOrchestrator {
    /// Create and boot a guest.
    ///
    /// Allocates the address, writes the record as `creating`, then creates
    /// and starts the VM. If either remote call fails, times out, or the
    /// future is dropped part-way, the address is released and the record
    /// ends `failed`.
    pub async fn create_vps(&self, req: &CreateVpsRequest) -> Result<Vps> {
        let valid = req.validate()?;

        let mut reservation = self.reserve_vmid().await?;

        let candidate = self.resolve_address(req.address).await?;
        let pool = self.store.get_pool(candidate.pool_id).await?;

        let address = self
            .addresses
            .allocate(
                &candidate.address,
                Assignment {
                    owner_id: Some(req.owner_id),
                    hostname: Some(req.name.clone()),
                    ..Default::default()
                },
            )
            .await?;
        let mut guard = AllocationGuard::new(
            self.addresses.clone(),
            self.store.clone(),
            address.address.clone(),
            req.owner_id,
        );

        let vps_id = Uuid::new_v4();
        let _lock = self.locks.lock(vps_id).await;

        // The unique vmid column is the final claim on an identifier; a
        // collision with a creation that finished concurrently picks again.
        let config = req.config.clone().unwrap_or_else(|| serde_json::json!({}));
        let mut attempt = 1;
        let vmid = loop {
            let vmid = reservation.vmid();
            let inserted = match i32::try_from(vmid) {
                Ok(stored_vmid) => self
                    .store
                    .insert_vps(&NewVps {
                        id: vps_id,
                        vmid: stored_vmid,
                        name: &req.name,
                        node_name: &req.node,
                        owner_id: req.owner_id,
                        status: VpsStatus::Creating,
                        cpu_cores: valid.cpu_cores,
                        memory_mb: valid.memory_mb,
                        disk_gb: valid.disk_gb,
                        bandwidth_mbps: valid.bandwidth_mbps,
                        os_type: valid.os_family.as_str(),
                        os_template: &req.os_template,
                        ip_address_id: address.id,
                        notes: req.notes.as_deref(),
                        config: &config,
                    })
                    .await
                    .map_err(Error::from),
                Err(_) => Err(Error::ResourceExhausted(format!(
                    "vm identifier {vmid} is out of range"
                ))),
            };

            match inserted {
                Ok(_) => break vmid,
                Err(Error::Conflict(reason)) if attempt < VMID_ATTEMPTS => {
                    tracing::warn!(vmid, %reason, "vm identifier already claimed, picking another");
                    attempt += 1;
                    match self.reserve_vmid().await {
                        Ok(next) => reservation = next,
                        Err(e) => {
                            guard.compensate().await;
                            return Err(e);
                        }
                    }
                }
                Err(e) => {
                    guard.compensate().await;
                    return Err(e);
                }
            }
        };
        guard.record_created(vps_id);

        tracing::info!(%vps_id, vmid, node = %req.node, address = %address.address, "creating vps");

        let spec = match self.vm_spec(req, &valid, vmid, &address, &pool) {
            Ok(spec) => spec,
            Err(e) => {
                guard.compensate().await;
                return Err(e);
            }
        };

        if let Err(e) = self.provision(&req.node, &spec).await {
            tracing::warn!(%vps_id, vmid, error = %e, "vps creation failed, rolling back");
            guard.compensate().await;
            return Err(e);
        }

        // The guest is up; from here on the allocation belongs to it.
        guard.disarm();
        drop(reservation);

        // Detached so a caller dropping this future cannot strand the record in `creating`.
        let store = self.store.clone();
        let finish = tokio::spawn(async move { store.set_vps_status(vps_id, VpsStatus::Running).await });
        let vps = match finish.await {
            Ok(stored) => stored?,
            // The handle is never aborted; only a panic in the write lands here.
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        };
        tracing::info!(%vps_id, vmid, "vps running");
        Ok(vps)
    }

    async fn reserve_vmid(&self) -> Result<super::vmid::VmidReservation> {
        let remote = match bounded(self.config.remote_timeout, self.hypervisor.list_vmids(None)).await {
            Ok(ids) => Some(ids),
            Err(e) => {
                tracing::warn!(error = %e, "cluster vmid listing failed, falling back to local records");
                None
            }
        };
        let local = self.store.list_vmids().await?;
        Ok(self.vmids.reserve(remote.as_deref(), &local))
    }

    async fn resolve_address(&self, source: AddressSource) -> Result<IpAddress> {
        match source {
            AddressSource::Allocation(id) => {
                let address = self.store.get_address_by_id(id).await?;
                if address.status != AddressStatus::Available {
                    return Err(Error::Conflict(format!(
                        "address {} is {}",
                        address.address, address.status
                    )));
                }
                Ok(address)
            }
            AddressSource::Pool(pool_id) => {
                self.addresses.get_pool(pool_id).await?;
                self.addresses
                    .get_available(Some(pool_id))
                    .await?
                    .ok_or_else(|| {
                        Error::ResourceExhausted(format!("no available address in pool {pool_id}"))
                    })
            }
            AddressSource::Any => self
                .addresses
                .get_available(None)
                .await?
                .ok_or_else(|| Error::ResourceExhausted("no available address in any pool".into())),
        }
    }

    fn vm_spec(
        &self,
        req: &CreateVpsRequest,
        valid: &Validated,
        vmid: u32,
        address: &IpAddress,
        pool: &IpPool,
    ) -> Result<VmSpec> {
        let ip = network::parse_ipv4("address", &address.address)?;
        let gateway = network::parse_ipv4("gateway", &pool.gateway)?;
        let prefix_len = network::prefix_len(&pool.subnet_mask)?;
        let nameserver = pool
            .dns_servers
            .first()
            .and_then(|dns| dns.parse::<Ipv4Addr>().ok());

        Ok(VmSpec {
            vmid,
            name: req.name.clone(),
            cores: req.cpu_cores,
            memory_mb: req.memory_mb,
            disk_gb: req.disk_gb,
            storage: self.config.storage.clone(),
            os_family: valid.os_family,
            network: NetworkInterface {
                bridge: self.config.bridge.clone(),
                address: ip,
                prefix_len,
                gateway,
                vlan: pool.vlan_id.and_then(|v| u16::try_from(v).ok()),
                rate_limit_mbps: (valid.bandwidth_mbps > 0).then_some(valid.bandwidth_mbps as u32),
            },
            nameserver,
            install: install_method(&self.config, valid.os_family, &req.os_template),
        })
    }

    async fn provision(&self, node: &str, spec: &VmSpec) -> Result<()> {
        let limit = self.config.remote_timeout;
        bounded(limit, self.hypervisor.create_vm(node, spec))
            .await
            .map_err(Error::remote("create_vm"))?;
        bounded(limit, self.hypervisor.start_vm(node, spec.vmid))
            .await
            .map_err(Error::remote("start_vm"))?;
        Ok(())
    }
}
