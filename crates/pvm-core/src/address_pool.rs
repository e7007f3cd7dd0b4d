use std::sync::Arc;

use pvm_db::Store;
use pvm_db::models::{
    AddressChange, AddressFilter, AddressPrecondition, AddressStatus, IpAddress, IpPool,
    IpPoolUpdate, NewIpPool, Page,
};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::network::{self, MIN_POOL_PREFIX};

/// Input for [`AddressPool::create_pool`].
#[derive(Debug, Clone, Default)]
pub struct CreatePoolRequest {
    pub name: String,
    /// `a.b.c.d/len`, `a.b.c.d/mask`, or a bare network address paired with `subnet_mask`.
    pub network: String,
    pub gateway: String,
    pub subnet_mask: Option<String>,
    pub dns_servers: Vec<String>,
    pub vlan_id: Option<u16>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolUpdate {
    pub name: Option<String>,
    pub dns_servers: Option<Vec<String>>,
    pub vlan_id: Option<u16>,
    pub notes: Option<String>,
    pub is_active: Option<bool>,
}

/// Who and what an allocated address is assigned to.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    pub owner_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PoolStatistics {
    pub total: i64,
    pub available: i64,
    pub allocated: i64,
    pub reserved: i64,
    pub available_percent: f64,
    pub allocated_percent: f64,
    pub reserved_percent: f64,
}

fn percent(part: i64, total: i64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 * 10_000.0 / total as f64).round() / 100.0
}

fn validate_vlan(vlan: u16) -> Result<i32> {
    if (1..=4094).contains(&vlan) {
        Ok(i32::from(vlan))
    } else {
        Err(Error::validation(format!("vlan_id: {vlan} is outside 1-4094")))
    }
}

fn normalize_dns(servers: &[String]) -> Result<Vec<String>> {
    servers
        .iter()
        .map(|s| network::parse_ipv4("dns_servers", s).map(|ip| ip.to_string()))
        .collect()
}

/// Address inventory. Every status change goes through a compare-and-set in
/// the store, so concurrent callers never both win the same address.
#[derive(Clone)]
pub struct AddressPool {
    store: Arc<dyn Store>,
}

impl AddressPool {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create_pool(&self, req: &CreatePoolRequest) -> Result<IpPool> {
        let name = req.name.trim();
        if name.is_empty() {
            return Err(Error::validation("name must not be empty"));
        }

        let net = network::parse_network(&req.network, req.subnet_mask.as_deref())?;
        if net.prefix() < MIN_POOL_PREFIX {
            return Err(Error::validation(format!(
                "network: /{} is larger than the /{MIN_POOL_PREFIX} limit",
                net.prefix()
            )));
        }

        let gateway = network::parse_ipv4("gateway", &req.gateway)?;
        let hosts: Vec<_> = network::usable_hosts(net).collect();
        if !hosts.contains(&gateway) {
            return Err(Error::validation(format!(
                "gateway: {gateway} is not a usable host in {net}"
            )));
        }

        let dns_servers = normalize_dns(&req.dns_servers)?;
        let vlan_id = req.vlan_id.map(validate_vlan).transpose()?;

        let addresses: Vec<String> = hosts
            .into_iter()
            .filter(|ip| *ip != gateway)
            .map(|ip| ip.to_string())
            .collect();
        let network = net.to_string();
        let subnet_mask = net.mask().to_string();
        let gateway = gateway.to_string();

        let pool = self
            .store
            .create_pool(
                &NewIpPool {
                    name,
                    network: &network,
                    gateway: &gateway,
                    subnet_mask: &subnet_mask,
                    dns_servers: &dns_servers,
                    vlan_id,
                    notes: req.notes.as_deref(),
                },
                &addresses,
            )
            .await?;

        tracing::info!(
            pool_id = %pool.id,
            name = %pool.name,
            network = %pool.network,
            addresses = addresses.len(),
            "address pool created"
        );
        Ok(pool)
    }

    pub async fn get_pool(&self, id: Uuid) -> Result<IpPool> {
        Ok(self.store.get_pool(id).await?)
    }

    pub async fn list_pools(&self, page: Page) -> Result<Vec<IpPool>> {
        Ok(self.store.list_pools(page).await?)
    }

    /// Administrative changes. The network, gateway and mask are fixed once
    /// addresses have been materialized.
    pub async fn update_pool(&self, id: Uuid, update: &PoolUpdate) -> Result<IpPool> {
        let name = match &update.name {
            Some(name) if name.trim().is_empty() => {
                return Err(Error::validation("name must not be empty"));
            }
            Some(name) => Some(name.trim().to_owned()),
            None => None,
        };
        let changes = IpPoolUpdate {
            name,
            dns_servers: update.dns_servers.as_deref().map(normalize_dns).transpose()?,
            vlan_id: update.vlan_id.map(validate_vlan).transpose()?,
            notes: update.notes.clone(),
            is_active: update.is_active,
        };

        let pool = self.store.update_pool(id, &changes).await?;
        tracing::info!(pool_id = %pool.id, is_active = pool.is_active, "address pool updated");
        Ok(pool)
    }

    /// Advisory: the returned address may be taken by the time the caller
    /// tries to [`allocate`](Self::allocate) it.
    pub async fn get_available(&self, pool_id: Option<Uuid>) -> Result<Option<IpAddress>> {
        Ok(self.store.first_available(pool_id).await?)
    }

    pub async fn get_address(&self, address: &str) -> Result<IpAddress> {
        let ip = network::parse_ipv4("address", address)?;
        Ok(self.store.get_address(&ip.to_string()).await?)
    }

    pub async fn list_addresses(&self, filter: &AddressFilter, page: Page) -> Result<Vec<IpAddress>> {
        Ok(self.store.list_addresses(filter, page).await?)
    }

    /// Available → Allocated.
    pub async fn allocate(&self, address: &str, assignment: Assignment) -> Result<IpAddress> {
        if let Some(mac) = &assignment.mac_address {
            network::validate_mac(mac)?;
        }
        let change = AddressChange {
            status: AddressStatus::Allocated,
            owner_id: assignment.owner_id,
            hostname: assignment.hostname,
            mac_address: assignment.mac_address,
            notes: assignment.notes,
        };
        let allocated = self
            .transition(
                address,
                AddressPrecondition::status_in(&[AddressStatus::Available]),
                change,
            )
            .await?;

        tracing::info!(
            address = %allocated.address,
            owner_id = ?allocated.owner_id,
            hostname = ?allocated.hostname,
            "address allocated"
        );
        Ok(allocated)
    }

    /// Available → Reserved.
    pub async fn reserve(&self, address: &str, notes: Option<String>) -> Result<IpAddress> {
        let change = AddressChange {
            notes,
            status: AddressStatus::Reserved,
            ..AddressChange::released()
        };
        let reserved = self
            .transition(
                address,
                AddressPrecondition::status_in(&[AddressStatus::Available]),
                change,
            )
            .await?;

        tracing::info!(address = %reserved.address, "address reserved");
        Ok(reserved)
    }

    /// Allocated | Reserved → Available, clearing the assignment. Releasing an
    /// address that is already available is a conflict.
    pub async fn release(&self, address: &str) -> Result<IpAddress> {
        let released = self
            .transition(
                address,
                AddressPrecondition::status_in(&[AddressStatus::Allocated, AddressStatus::Reserved]),
                AddressChange::released(),
            )
            .await?;

        tracing::info!(address = %released.address, "address released");
        Ok(released)
    }

    /// Release only while the address is still allocated to `owner_id`.
    pub(crate) async fn release_owned(&self, address: &str, owner_id: Uuid) -> Result<IpAddress> {
        let released = self
            .transition(
                address,
                AddressPrecondition::status_in(&[AddressStatus::Allocated]).owned_by(owner_id),
                AddressChange::released(),
            )
            .await?;

        tracing::info!(address = %released.address, %owner_id, "address released");
        Ok(released)
    }

    pub async fn statistics(&self, pool_id: Option<Uuid>) -> Result<PoolStatistics> {
        if let Some(id) = pool_id {
            self.store.get_pool(id).await?;
        }
        let counts = self.store.address_counts(pool_id).await?;
        Ok(PoolStatistics {
            total: counts.total,
            available: counts.available,
            allocated: counts.allocated,
            reserved: counts.reserved,
            available_percent: percent(counts.available, counts.total),
            allocated_percent: percent(counts.allocated, counts.total),
            reserved_percent: percent(counts.reserved, counts.total),
        })
    }

    async fn transition(
        &self,
        address: &str,
        expect: AddressPrecondition,
        change: AddressChange,
    ) -> Result<IpAddress> {
        let ip = network::parse_ipv4("address", address)?;
        Ok(self
            .store
            .transition_address(&ip.to_string(), &expect, &change)
            .await?)
    }
}
