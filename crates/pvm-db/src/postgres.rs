use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{
    AddressChange, AddressCounts, AddressFilter, AddressPrecondition, IpAddress, IpPool,
    IpPoolUpdate, NewBackup, NewIpPool, NewVps, Page, Vps, VpsBackup, VpsStatus,
};
use crate::store::Store;
use crate::{Error, Result};

/// PostgreSQL-backed [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_pool(&self, pool: &NewIpPool<'_>, addresses: &[String]) -> Result<IpPool> {
        IpPool::insert_with_addresses(&self.pool, pool, addresses)
            .await
            .map_err(|e| Error::classify(e, "pool", pool.name))
    }

    async fn get_pool(&self, id: Uuid) -> Result<IpPool> {
        IpPool::get_by_id(&self.pool, id)
            .await
            .map_err(|e| Error::classify(e, "pool", id))
    }

    async fn list_pools(&self, page: Page) -> Result<Vec<IpPool>> {
        Ok(IpPool::list(&self.pool, page).await?)
    }

    async fn update_pool(&self, id: Uuid, changes: &IpPoolUpdate) -> Result<IpPool> {
        IpPool::update(&self.pool, id, changes)
            .await
            .map_err(|e| Error::classify(e, "pool", id))
    }

    async fn get_address(&self, address: &str) -> Result<IpAddress> {
        IpAddress::get_by_address(&self.pool, address)
            .await
            .map_err(|e| Error::classify(e, "address", address))
    }

    async fn get_address_by_id(&self, id: Uuid) -> Result<IpAddress> {
        IpAddress::get_by_id(&self.pool, id)
            .await
            .map_err(|e| Error::classify(e, "address", id))
    }

    async fn list_addresses(&self, filter: &AddressFilter, page: Page) -> Result<Vec<IpAddress>> {
        Ok(IpAddress::list(&self.pool, filter, page).await?)
    }

    async fn first_available(&self, pool_id: Option<Uuid>) -> Result<Option<IpAddress>> {
        Ok(IpAddress::first_available(&self.pool, pool_id).await?)
    }

    async fn transition_address(
        &self,
        address: &str,
        expect: &AddressPrecondition,
        change: &AddressChange,
    ) -> Result<IpAddress> {
        if let Some(updated) = IpAddress::transition(&self.pool, address, expect, change).await? {
            return Ok(updated);
        }

        // Nothing matched: either the row is gone or the precondition failed.
        let current = self.get_address(address).await?;
        Err(Error::Conflict(format!(
            "address {address} is {}, expected one of {:?}",
            current.status, expect.from
        )))
    }

    async fn address_counts(&self, pool_id: Option<Uuid>) -> Result<AddressCounts> {
        Ok(IpAddress::counts(&self.pool, pool_id).await?)
    }

    async fn insert_vps(&self, vps: &NewVps<'_>) -> Result<Vps> {
        Vps::insert(&self.pool, vps)
            .await
            .map_err(|e| Error::classify(e, "vps", vps.vmid))
    }

    async fn get_vps(&self, id: Uuid) -> Result<Vps> {
        Vps::get_by_id(&self.pool, id)
            .await
            .map_err(|e| Error::classify(e, "vps", id))
    }

    async fn list_vps(&self, owner_id: Option<Uuid>, page: Page) -> Result<Vec<Vps>> {
        Ok(Vps::list(&self.pool, owner_id, page).await?)
    }

    async fn list_all_vps(&self) -> Result<Vec<Vps>> {
        Ok(Vps::list_all(&self.pool).await?)
    }

    async fn set_vps_status(&self, id: Uuid, status: VpsStatus) -> Result<Vps> {
        Vps::set_status(&self.pool, id, status)
            .await
            .map_err(|e| Error::classify(e, "vps", id))
    }

    async fn delete_vps(&self, id: Uuid) -> Result<()> {
        if Vps::delete(&self.pool, id).await? {
            Ok(())
        } else {
            Err(Error::not_found("vps", id))
        }
    }

    async fn list_vmids(&self) -> Result<Vec<u32>> {
        let vmids = Vps::vmids(&self.pool).await?;
        Ok(vmids.into_iter().filter_map(|v| u32::try_from(v).ok()).collect())
    }

    async fn insert_backup(&self, backup: &NewBackup<'_>) -> Result<VpsBackup> {
        VpsBackup::insert_and_touch(&self.pool, backup)
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => Error::not_found("vps", backup.vps_id),
                other => Error::classify(other, "backup", backup.backup_id),
            })
    }

    async fn list_backups(&self, vps_id: Uuid, page: Page) -> Result<Vec<VpsBackup>> {
        Ok(VpsBackup::list_for_vps(&self.pool, vps_id, page).await?)
    }
}
