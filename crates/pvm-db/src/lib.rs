pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::Store;

use sqlx::PgPool;
use sqlx::postgres::{PgDatabaseError, PgPoolOptions};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Map a driver error, turning missing rows and unique violations into
    /// their domain counterparts.
    ///
    /// A unique violation is named after the constraint that fired, which
    /// may belong to another table than `entity` (a pool insert can collide
    /// on an address row).
    pub(crate) fn classify(err: sqlx::Error, entity: &'static str, key: impl ToString) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::not_found(entity, key),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                let detail = db
                    .try_downcast_ref::<PgDatabaseError>()
                    .and_then(|pg| pg.detail())
                    .and_then(conflicting_value);
                match (db.constraint().and_then(unique_owner), detail) {
                    (Some(owner), Some(value)) => Self::Conflict(format!("{owner} {value} already exists")),
                    (Some(owner), None) if owner != entity => Self::Conflict(format!("{owner} already exists")),
                    _ => Self::Conflict(format!("{entity} {} already exists", key.to_string())),
                }
            }
            other => Self::Database(other),
        }
    }
}

/// Entity guarded by a unique constraint from the migrations.
fn unique_owner(constraint: &str) -> Option<&'static str> {
    match constraint {
        "ip_pools_name_key" => Some("pool"),
        "ip_addresses_address_key" => Some("address"),
        "vps_instances_pkey" | "vps_instances_vmid_key" => Some("vps"),
        "vps_backups_backup_id_key" => Some("backup"),
        _ => None,
    }
}

/// Value out of a Postgres unique-violation detail: `Key (col)=(value) already exists.`
fn conflicting_value(detail: &str) -> Option<&str> {
    let (_, rest) = detail.split_once(")=(")?;
    let (value, _) = rest.rsplit_once(") already exists")?;
    Some(value)
}

/// Create a connection pool to PostgreSQL.
pub async fn create_pool(database_url: &str) -> std::result::Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &PgPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
