//! The daemon's `SQLite` database: notifications and usage watermarks.

use std::path::Path;

use sqlx::{Pool, Sqlite};
use tracing::debug;

pub use drover_core::db::DatabaseError;

/// Handle to the daemon database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    /// Open the database file at `path`, creating it and applying the schema.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(drover_core::db::open_pool(path).await?).await
    }

    /// Fresh in-memory database.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(drover_core::db::open_pool_in_memory().await?).await
    }

    async fn migrated(pool: Pool<Sqlite>) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        debug!("Schema up to date");
        Ok(Self { pool })
    }

    pub const fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
