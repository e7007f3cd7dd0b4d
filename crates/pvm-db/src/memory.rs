//! In-process [`Store`] used by tests and local tooling.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::models::{
    AddressChange, AddressCounts, AddressFilter, AddressPrecondition, AddressStatus, IpAddress,
    IpPool, IpPoolUpdate, NewBackup, NewIpPool, NewVps, Page, Vps, VpsBackup, VpsStatus,
};
use crate::store::Store;
use crate::{Error, Result};

/// Addresses sort numerically; anything unparsable goes last.
type AddressKey = (u32, String);

fn address_key(address: &str) -> AddressKey {
    let numeric = address
        .parse::<Ipv4Addr>()
        .map(u32::from)
        .unwrap_or(u32::MAX);
    (numeric, address.to_owned())
}

fn window<T>(items: impl Iterator<Item = T>, page: Page) -> Vec<T> {
    items
        .skip(usize::try_from(page.offset).unwrap_or(0))
        .take(usize::try_from(page.limit).unwrap_or(0))
        .collect()
}

#[derive(Default)]
struct State {
    pools: HashMap<Uuid, IpPool>,
    addresses: BTreeMap<AddressKey, IpAddress>,
    vps: HashMap<Uuid, Vps>,
    backups: Vec<VpsBackup>,
}

/// Every operation runs under one lock, so each is atomic the same way a
/// single statement or transaction is in PostgreSQL.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_pool(&self, pool: &NewIpPool<'_>, addresses: &[String]) -> Result<IpPool> {
        let mut state = self.state.lock();

        if state.pools.values().any(|p| p.name == pool.name) {
            return Err(Error::Conflict(format!("pool {} already exists", pool.name)));
        }
        if let Some(taken) = addresses
            .iter()
            .find(|a| state.addresses.contains_key(&address_key(a)))
        {
            return Err(Error::Conflict(format!("address {taken} already exists")));
        }

        let now = Utc::now();
        let created = IpPool {
            id: Uuid::new_v4(),
            name: pool.name.to_owned(),
            network: pool.network.to_owned(),
            gateway: pool.gateway.to_owned(),
            subnet_mask: pool.subnet_mask.to_owned(),
            dns_servers: pool.dns_servers.to_vec(),
            vlan_id: pool.vlan_id,
            notes: pool.notes.map(str::to_owned),
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        for address in addresses {
            state.addresses.insert(
                address_key(address),
                IpAddress {
                    id: Uuid::new_v4(),
                    pool_id: created.id,
                    address: address.clone(),
                    status: AddressStatus::Available,
                    owner_id: None,
                    hostname: None,
                    mac_address: None,
                    notes: None,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        state.pools.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_pool(&self, id: Uuid) -> Result<IpPool> {
        self.state
            .lock()
            .pools
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("pool", id))
    }

    async fn list_pools(&self, page: Page) -> Result<Vec<IpPool>> {
        let state = self.state.lock();
        let mut pools: Vec<_> = state.pools.values().cloned().collect();
        pools.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(window(pools.into_iter(), page))
    }

    async fn update_pool(&self, id: Uuid, changes: &IpPoolUpdate) -> Result<IpPool> {
        let mut state = self.state.lock();

        if let Some(name) = &changes.name
            && state.pools.values().any(|p| p.id != id && &p.name == name)
        {
            return Err(Error::Conflict(format!("pool {name} already exists")));
        }

        let pool = state
            .pools
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("pool", id))?;
        if let Some(name) = &changes.name {
            pool.name = name.clone();
        }
        if let Some(dns) = &changes.dns_servers {
            pool.dns_servers = dns.clone();
        }
        if let Some(vlan) = changes.vlan_id {
            pool.vlan_id = Some(vlan);
        }
        if let Some(notes) = &changes.notes {
            pool.notes = Some(notes.clone());
        }
        if let Some(active) = changes.is_active {
            pool.is_active = active;
        }
        pool.updated_at = Utc::now();
        Ok(pool.clone())
    }

    async fn get_address(&self, address: &str) -> Result<IpAddress> {
        self.state
            .lock()
            .addresses
            .get(&address_key(address))
            .cloned()
            .ok_or_else(|| Error::not_found("address", address))
    }

    async fn get_address_by_id(&self, id: Uuid) -> Result<IpAddress> {
        self.state
            .lock()
            .addresses
            .values()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("address", id))
    }

    async fn list_addresses(&self, filter: &AddressFilter, page: Page) -> Result<Vec<IpAddress>> {
        let state = self.state.lock();
        Ok(window(
            state.addresses.values().filter(|a| filter.matches(a)).cloned(),
            page,
        ))
    }

    async fn first_available(&self, pool_id: Option<Uuid>) -> Result<Option<IpAddress>> {
        let state = self.state.lock();
        Ok(state
            .addresses
            .values()
            .filter(|a| a.status == AddressStatus::Available)
            .filter(|a| pool_id.is_none_or(|p| a.pool_id == p))
            .find(|a| state.pools.get(&a.pool_id).is_some_and(|p| p.is_active))
            .cloned())
    }

    async fn transition_address(
        &self,
        address: &str,
        expect: &AddressPrecondition,
        change: &AddressChange,
    ) -> Result<IpAddress> {
        let mut state = self.state.lock();
        let row = state
            .addresses
            .get_mut(&address_key(address))
            .ok_or_else(|| Error::not_found("address", address))?;

        if !expect.holds(row) {
            return Err(Error::Conflict(format!(
                "address {address} is {}, expected one of {:?}",
                row.status, expect.from
            )));
        }

        row.status = change.status;
        row.owner_id = change.owner_id;
        row.hostname = change.hostname.clone();
        row.mac_address = change.mac_address.clone();
        row.notes = change.notes.clone();
        row.updated_at = Utc::now();
        Ok(row.clone())
    }

    async fn address_counts(&self, pool_id: Option<Uuid>) -> Result<AddressCounts> {
        let state = self.state.lock();
        let mut counts = AddressCounts::default();
        for address in state
            .addresses
            .values()
            .filter(|a| pool_id.is_none_or(|p| a.pool_id == p))
        {
            counts.total += 1;
            match address.status {
                AddressStatus::Available => counts.available += 1,
                AddressStatus::Allocated => counts.allocated += 1,
                AddressStatus::Reserved => counts.reserved += 1,
            }
        }
        Ok(counts)
    }

    async fn insert_vps(&self, vps: &NewVps<'_>) -> Result<Vps> {
        let mut state = self.state.lock();

        if state.vps.contains_key(&vps.id) {
            return Err(Error::Conflict(format!("vps {} already exists", vps.id)));
        }
        if state.vps.values().any(|v| v.vmid == vps.vmid) {
            return Err(Error::Conflict(format!("vps {} already exists", vps.vmid)));
        }

        let now = Utc::now();
        let created = Vps {
            id: vps.id,
            vmid: vps.vmid,
            name: vps.name.to_owned(),
            node_name: vps.node_name.to_owned(),
            owner_id: vps.owner_id,
            status: vps.status,
            cpu_cores: vps.cpu_cores,
            memory_mb: vps.memory_mb,
            disk_gb: vps.disk_gb,
            bandwidth_mbps: vps.bandwidth_mbps,
            os_type: vps.os_type.to_owned(),
            os_template: vps.os_template.to_owned(),
            ip_address_id: vps.ip_address_id,
            notes: vps.notes.map(str::to_owned),
            config: vps.config.clone(),
            created_at: now,
            updated_at: now,
            last_backup_at: None,
        };
        state.vps.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_vps(&self, id: Uuid) -> Result<Vps> {
        self.state
            .lock()
            .vps
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("vps", id))
    }

    async fn list_vps(&self, owner_id: Option<Uuid>, page: Page) -> Result<Vec<Vps>> {
        let state = self.state.lock();
        let mut all: Vec<_> = state
            .vps
            .values()
            .filter(|v| owner_id.is_none_or(|o| v.owner_id == o))
            .cloned()
            .collect();
        all.sort_by_key(|v| (v.created_at, v.id));
        Ok(window(all.into_iter(), page))
    }

    async fn list_all_vps(&self) -> Result<Vec<Vps>> {
        let state = self.state.lock();
        let mut all: Vec<_> = state.vps.values().cloned().collect();
        all.sort_by_key(|v| (v.created_at, v.id));
        Ok(all)
    }

    async fn set_vps_status(&self, id: Uuid, status: VpsStatus) -> Result<Vps> {
        let mut state = self.state.lock();
        let vps = state
            .vps
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("vps", id))?;
        vps.status = status;
        vps.updated_at = Utc::now();
        Ok(vps.clone())
    }

    async fn delete_vps(&self, id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        state
            .vps
            .remove(&id)
            .ok_or_else(|| Error::not_found("vps", id))?;
        state.backups.retain(|b| b.vps_id != id);
        Ok(())
    }

    async fn list_vmids(&self) -> Result<Vec<u32>> {
        let state = self.state.lock();
        Ok(state
            .vps
            .values()
            .filter_map(|v| u32::try_from(v.vmid).ok())
            .collect())
    }

    async fn insert_backup(&self, backup: &NewBackup<'_>) -> Result<VpsBackup> {
        let mut state = self.state.lock();

        if state.backups.iter().any(|b| b.backup_id == backup.backup_id) {
            return Err(Error::Conflict(format!(
                "backup {} already exists",
                backup.backup_id
            )));
        }
        let vps = state
            .vps
            .get_mut(&backup.vps_id)
            .ok_or_else(|| Error::not_found("vps", backup.vps_id))?;
        vps.last_backup_at = Some(backup.created_at);
        vps.updated_at = Utc::now();

        let created = VpsBackup {
            id: Uuid::new_v4(),
            vps_id: backup.vps_id,
            backup_id: backup.backup_id.to_owned(),
            file_name: backup.file_name.to_owned(),
            file_size: backup.file_size,
            is_auto: backup.is_auto,
            notes: backup.notes.map(str::to_owned),
            created_at: backup.created_at,
        };
        state.backups.push(created.clone());
        Ok(created)
    }

    async fn list_backups(&self, vps_id: Uuid, page: Page) -> Result<Vec<VpsBackup>> {
        let state = self.state.lock();
        let mut backups: Vec<_> = state
            .backups
            .iter()
            .filter(|b| b.vps_id == vps_id)
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(window(backups.into_iter(), page))
    }
}
