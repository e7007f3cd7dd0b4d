use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Offset/limit window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: i64,
    pub limit: i64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

// ── IpPool ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IpPool {
    pub id: Uuid,
    pub name: String,
    pub network: String,
    pub gateway: String,
    pub subnet_mask: String,
    pub dns_servers: Vec<String>,
    pub vlan_id: Option<i32>,
    pub notes: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewIpPool<'a> {
    pub name: &'a str,
    pub network: &'a str,
    pub gateway: &'a str,
    pub subnet_mask: &'a str,
    pub dns_servers: &'a [String],
    pub vlan_id: Option<i32>,
    pub notes: Option<&'a str>,
}

/// Administrative changes to a pool; `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct IpPoolUpdate {
    pub name: Option<String>,
    pub dns_servers: Option<Vec<String>>,
    pub vlan_id: Option<i32>,
    pub notes: Option<String>,
    pub is_active: Option<bool>,
}

impl IpPool {
    /// Insert the pool and one `available` row per address in a single transaction.
    pub async fn insert_with_addresses(
        pool: &PgPool,
        new: &NewIpPool<'_>,
        addresses: &[String],
    ) -> sqlx::Result<Self> {
        let mut tx = pool.begin().await?;

        let created: Self = sqlx::query_as(
            r#"INSERT INTO ip_pools (name, network, gateway, subnet_mask, dns_servers, vlan_id, notes)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(new.name)
        .bind(new.network)
        .bind(new.gateway)
        .bind(new.subnet_mask)
        .bind(new.dns_servers)
        .bind(new.vlan_id)
        .bind(new.notes)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO ip_addresses (pool_id, address) SELECT $1, unnest($2::text[])")
            .bind(created.id)
            .bind(addresses)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(created)
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM ip_pools WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub async fn list(pool: &PgPool, page: Page) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM ip_pools ORDER BY name OFFSET $1 LIMIT $2")
            .bind(page.offset)
            .bind(page.limit)
            .fetch_all(pool)
            .await
    }

    pub async fn update(pool: &PgPool, id: Uuid, changes: &IpPoolUpdate) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"UPDATE ip_pools
               SET name        = COALESCE($2, name),
                   dns_servers = COALESCE($3, dns_servers),
                   vlan_id     = COALESCE($4, vlan_id),
                   notes       = COALESCE($5, notes),
                   is_active   = COALESCE($6, is_active)
               WHERE id = $1
               RETURNING *"#,
        )
        .bind(id)
        .bind(changes.name.as_deref())
        .bind(changes.dns_servers.as_deref())
        .bind(changes.vlan_id)
        .bind(changes.notes.as_deref())
        .bind(changes.is_active)
        .fetch_one(pool)
        .await
    }
}

// ── IpAddress ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "address_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Available,
    Allocated,
    Reserved,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Allocated => "allocated",
            Self::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: Uuid,
    pub pool_id: Uuid,
    pub address: String,
    pub status: AddressStatus,
    pub owner_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The full set of mutable fields written by a status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressChange {
    pub status: AddressStatus,
    pub owner_id: Option<Uuid>,
    pub hostname: Option<String>,
    pub mac_address: Option<String>,
    pub notes: Option<String>,
}

impl AddressChange {
    /// Back to `available` with every assignment field cleared.
    pub fn released() -> Self {
        Self {
            status: AddressStatus::Available,
            owner_id: None,
            hostname: None,
            mac_address: None,
            notes: None,
        }
    }
}

/// What must hold for a transition to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressPrecondition {
    pub from: Vec<AddressStatus>,
    pub owner_id: Option<Uuid>,
}

impl AddressPrecondition {
    pub fn status_in(from: &[AddressStatus]) -> Self {
        Self {
            from: from.to_vec(),
            owner_id: None,
        }
    }

    pub fn owned_by(mut self, owner_id: Uuid) -> Self {
        self.owner_id = Some(owner_id);
        self
    }

    pub fn holds(&self, address: &IpAddress) -> bool {
        self.from.contains(&address.status)
            && self.owner_id.is_none_or(|owner| address.owner_id == Some(owner))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    pub pool_id: Option<Uuid>,
    pub status: Option<AddressStatus>,
    pub owner_id: Option<Uuid>,
}

impl AddressFilter {
    pub fn matches(&self, address: &IpAddress) -> bool {
        self.pool_id.is_none_or(|p| address.pool_id == p)
            && self.status.is_none_or(|s| address.status == s)
            && self.owner_id.is_none_or(|o| address.owner_id == Some(o))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct AddressCounts {
    pub total: i64,
    pub available: i64,
    pub allocated: i64,
    pub reserved: i64,
}

impl IpAddress {
    pub async fn get_by_address(pool: &PgPool, address: &str) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM ip_addresses WHERE address = $1")
            .bind(address)
            .fetch_one(pool)
            .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM ip_addresses WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// First `available` address in an active pool, lowest address first.
    pub async fn first_available(pool: &PgPool, pool_id: Option<Uuid>) -> sqlx::Result<Option<Self>> {
        sqlx::query_as(
            r#"SELECT a.* FROM ip_addresses a
               JOIN ip_pools p ON p.id = a.pool_id
               WHERE a.status = 'available'
                 AND p.is_active
                 AND ($1::uuid IS NULL OR a.pool_id = $1)
               ORDER BY a.address::inet
               LIMIT 1"#,
        )
        .bind(pool_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn list(pool: &PgPool, filter: &AddressFilter, page: Page) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as(
            r#"SELECT * FROM ip_addresses
               WHERE ($1::uuid IS NULL OR pool_id = $1)
                 AND ($2::address_status IS NULL OR status = $2)
                 AND ($3::uuid IS NULL OR owner_id = $3)
               ORDER BY address::inet
               OFFSET $4 LIMIT $5"#,
        )
        .bind(filter.pool_id)
        .bind(filter.status)
        .bind(filter.owner_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(pool)
        .await
    }

    /// Conditional update: applies `change` only if `expect` holds for the
    /// current row, in one statement. `None` means no row matched.
    pub async fn transition(
        pool: &PgPool,
        address: &str,
        expect: &AddressPrecondition,
        change: &AddressChange,
    ) -> sqlx::Result<Option<Self>> {
        let from: Vec<&str> = expect.from.iter().map(AddressStatus::as_str).collect();
        sqlx::query_as(
            r#"UPDATE ip_addresses
               SET status      = $2,
                   owner_id    = $3,
                   hostname    = $4,
                   mac_address = $5,
                   notes       = $6
               WHERE address = $1
                 AND status::text = ANY($7)
                 AND ($8::uuid IS NULL OR owner_id = $8)
               RETURNING *"#,
        )
        .bind(address)
        .bind(change.status)
        .bind(change.owner_id)
        .bind(change.hostname.as_deref())
        .bind(change.mac_address.as_deref())
        .bind(change.notes.as_deref())
        .bind(from)
        .bind(expect.owner_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn counts(pool: &PgPool, pool_id: Option<Uuid>) -> sqlx::Result<AddressCounts> {
        sqlx::query_as(
            r#"SELECT COUNT(*)                                     AS total,
                      COUNT(*) FILTER (WHERE status = 'available') AS available,
                      COUNT(*) FILTER (WHERE status = 'allocated') AS allocated,
                      COUNT(*) FILTER (WHERE status = 'reserved')  AS reserved
               FROM ip_addresses
               WHERE ($1::uuid IS NULL OR pool_id = $1)"#,
        )
        .bind(pool_id)
        .fetch_one(pool)
        .await
    }
}

// ── Vps ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "vps_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum VpsStatus {
    Creating,
    Stopped,
    Running,
    Failed,
    Deleting,
}

impl VpsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for VpsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Vps {
    pub id: Uuid,
    pub vmid: i32,
    pub name: String,
    pub node_name: String,
    pub owner_id: Uuid,
    pub status: VpsStatus,
    pub cpu_cores: i32,
    pub memory_mb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub os_type: String,
    pub os_template: String,
    pub ip_address_id: Uuid,
    pub notes: Option<String>,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_backup_at: Option<DateTime<Utc>>,
}

pub struct NewVps<'a> {
    pub id: Uuid,
    pub vmid: i32,
    pub name: &'a str,
    pub node_name: &'a str,
    pub owner_id: Uuid,
    pub status: VpsStatus,
    pub cpu_cores: i32,
    pub memory_mb: i32,
    pub disk_gb: i32,
    pub bandwidth_mbps: i32,
    pub os_type: &'a str,
    pub os_template: &'a str,
    pub ip_address_id: Uuid,
    pub notes: Option<&'a str>,
    pub config: &'a serde_json::Value,
}

impl Vps {
    pub async fn insert(pool: &PgPool, vps: &NewVps<'_>) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO vps_instances (id, vmid, name, node_name, owner_id, status, cpu_cores, memory_mb,
                                          disk_gb, bandwidth_mbps, os_type, os_template, ip_address_id, notes, config)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
               RETURNING *"#,
        )
        .bind(vps.id)
        .bind(vps.vmid)
        .bind(vps.name)
        .bind(vps.node_name)
        .bind(vps.owner_id)
        .bind(vps.status)
        .bind(vps.cpu_cores)
        .bind(vps.memory_mb)
        .bind(vps.disk_gb)
        .bind(vps.bandwidth_mbps)
        .bind(vps.os_type)
        .bind(vps.os_template)
        .bind(vps.ip_address_id)
        .bind(vps.notes)
        .bind(sqlx::types::Json(vps.config))
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Self> {
        sqlx::query_as("SELECT * FROM vps_instances WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
    }

    pub async fn list(pool: &PgPool, owner_id: Option<Uuid>, page: Page) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as(
            r#"SELECT * FROM vps_instances
               WHERE ($1::uuid IS NULL OR owner_id = $1)
               ORDER BY created_at, id
               OFFSET $2 LIMIT $3"#,
        )
        .bind(owner_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(pool)
        .await
    }

    pub async fn list_all(pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM vps_instances ORDER BY created_at, id")
            .fetch_all(pool)
            .await
    }

    pub async fn set_status(pool: &PgPool, id: Uuid, status: VpsStatus) -> sqlx::Result<Self> {
        sqlx::query_as("UPDATE vps_instances SET status = $1 WHERE id = $2 RETURNING *")
            .bind(status)
            .bind(id)
            .fetch_one(pool)
            .await
    }

    /// Returns `false` when no row existed.
    pub async fn delete(pool: &PgPool, id: Uuid) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM vps_instances WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn vmids(pool: &PgPool) -> sqlx::Result<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as("SELECT vmid FROM vps_instances")
            .fetch_all(pool)
            .await?;
        Ok(rows.into_iter().map(|(vmid,)| vmid).collect())
    }
}

// ── VpsBackup ───────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct VpsBackup {
    pub id: Uuid,
    pub vps_id: Uuid,
    pub backup_id: String,
    pub file_name: String,
    /// Bytes; `None` until the archive size is known.
    pub file_size: Option<i64>,
    pub is_auto: bool,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct NewBackup<'a> {
    pub vps_id: Uuid,
    pub backup_id: &'a str,
    pub file_name: &'a str,
    pub file_size: Option<i64>,
    pub is_auto: bool,
    pub notes: Option<&'a str>,
    pub created_at: DateTime<Utc>,
}

impl VpsBackup {
    /// Insert the backup row and stamp the instance's `last_backup_at` atomically.
    pub async fn insert_and_touch(pool: &PgPool, backup: &NewBackup<'_>) -> sqlx::Result<Self> {
        let mut tx = pool.begin().await?;

        let touched = sqlx::query("UPDATE vps_instances SET last_backup_at = $1 WHERE id = $2")
            .bind(backup.created_at)
            .bind(backup.vps_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }

        let created = sqlx::query_as(
            r#"INSERT INTO vps_backups (vps_id, backup_id, file_name, file_size, is_auto, notes, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)
               RETURNING *"#,
        )
        .bind(backup.vps_id)
        .bind(backup.backup_id)
        .bind(backup.file_name)
        .bind(backup.file_size)
        .bind(backup.is_auto)
        .bind(backup.notes)
        .bind(backup.created_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(created)
    }

    pub async fn list_for_vps(pool: &PgPool, vps_id: Uuid, page: Page) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as(
            r#"SELECT * FROM vps_backups
               WHERE vps_id = $1
               ORDER BY created_at DESC
               OFFSET $2 LIMIT $3"#,
        )
        .bind(vps_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(pool)
        .await
    }
}
