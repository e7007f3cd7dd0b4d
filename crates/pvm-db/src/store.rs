use async_trait::async_trait;
use uuid::Uuid;

use crate::Result;
use crate::models::{
    AddressChange, AddressCounts, AddressFilter, AddressPrecondition, IpAddress, IpPool,
    IpPoolUpdate, NewBackup, NewIpPool, NewVps, Page, Vps, VpsBackup, VpsStatus,
};

/// Durable record store for pools, addresses, instances and backups.
///
/// Every method is one atomic unit against the backing store. Callers that
/// need a multi-step saga compose these and compensate on failure.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // Pools
    async fn create_pool(&self, pool: &NewIpPool<'_>, addresses: &[String]) -> Result<IpPool>;
    async fn get_pool(&self, id: Uuid) -> Result<IpPool>;
    async fn list_pools(&self, page: Page) -> Result<Vec<IpPool>>;
    async fn update_pool(&self, id: Uuid, changes: &IpPoolUpdate) -> Result<IpPool>;

    // Addresses
    async fn get_address(&self, address: &str) -> Result<IpAddress>;
    async fn get_address_by_id(&self, id: Uuid) -> Result<IpAddress>;
    async fn list_addresses(&self, filter: &AddressFilter, page: Page) -> Result<Vec<IpAddress>>;

    /// Lowest available address in an active pool, optionally restricted to one pool.
    async fn first_available(&self, pool_id: Option<Uuid>) -> Result<Option<IpAddress>>;

    /// Compare-and-set on one address row.
    ///
    /// `NotFound` when the address does not exist, `Conflict` when `expect`
    /// does not hold at the moment of the write.
    async fn transition_address(
        &self,
        address: &str,
        expect: &AddressPrecondition,
        change: &AddressChange,
    ) -> Result<IpAddress>;

    async fn address_counts(&self, pool_id: Option<Uuid>) -> Result<AddressCounts>;

    // Instances
    async fn insert_vps(&self, vps: &NewVps<'_>) -> Result<Vps>;
    async fn get_vps(&self, id: Uuid) -> Result<Vps>;
    async fn list_vps(&self, owner_id: Option<Uuid>, page: Page) -> Result<Vec<Vps>>;
    async fn list_all_vps(&self) -> Result<Vec<Vps>>;
    async fn set_vps_status(&self, id: Uuid, status: VpsStatus) -> Result<Vps>;
    async fn delete_vps(&self, id: Uuid) -> Result<()>;
    async fn list_vmids(&self) -> Result<Vec<u32>>;

    // Backups
    /// Insert the backup and set the instance's `last_backup_at` in one unit.
    async fn insert_backup(&self, backup: &NewBackup<'_>) -> Result<VpsBackup>;
    async fn list_backups(&self, vps_id: Uuid, page: Page) -> Result<Vec<VpsBackup>>;
}
