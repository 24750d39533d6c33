//! `SQLite` pool helpers shared by the daemon storage layer.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const FILE_POOL_SIZE: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot prepare database location: {0}")]
    Io(String),

    #[error("Cannot connect to database: {0}")]
    Connection(String),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("Query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

fn options(url: &str) -> Result<SqliteConnectOptions, DatabaseError> {
    Ok(SqliteConnectOptions::from_str(url)
        .map_err(|e| DatabaseError::Connection(e.to_string()))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT))
}

async fn connect(options: SqliteConnectOptions, size: u32) -> Result<Pool<Sqlite>, DatabaseError> {
    SqlitePoolOptions::new()
        .max_connections(size)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Open, creating if needed, the database file at `path` (WAL mode, 5 s busy
/// timeout). Missing parent directories are created.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }
    let url = format!("sqlite:{}?mode=rwc", path.display());
    let pool = connect(options(&url)?, FILE_POOL_SIZE).await?;
    info!(path = %path.display(), "Database opened");
    Ok(pool)
}

/// In-memory database. A single connection, since each `:memory:`
/// connection would otherwise see its own empty database.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    connect(options("sqlite::memory:")?, 1).await
}

/// Seconds since the Unix epoch.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_current() {
        // 2024-01-01T00:00:00Z
        assert!(unix_timestamp() > 1_704_067_200);
    }

    #[tokio::test]
    async fn file_pool_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("drover.db");
        let pool = open_pool(&path).await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn memory_pool_answers_queries() {
        let pool = open_pool_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT 41 + 1").fetch_one(&pool).await.unwrap();
        assert_eq!(row.0, 42);
    }
}
