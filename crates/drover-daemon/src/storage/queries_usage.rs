//! Usage watermark queries.

use drover_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::UsageWatermark;

impl Database {
    // =========================================================================
    // Usage watermark queries
    // =========================================================================

    /// Current watermark for `key`, 0 when never set.
    pub async fn watermark(&self, key: &str) -> Result<i64, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM usage_state WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map_or(0, |r| r.0))
    }

    /// Raise the watermark to `value` if it is higher than the stored one.
    ///
    /// Returns `true` when the stored value changed. A single conditional
    /// upsert, so concurrent writers can never lower the watermark.
    pub async fn raise_watermark(&self, key: &str, value: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO usage_state (key, value, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at \
             WHERE excluded.value > usage_state.value",
        )
        .bind(key)
        .bind(value)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Clear a watermark. Returns `true` if one existed.
    pub async fn clear_watermark(&self, key: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM usage_state WHERE key = ?")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All stored watermarks, ordered by key.
    pub async fn list_watermarks(&self) -> Result<Vec<UsageWatermark>, DatabaseError> {
        let rows = sqlx::query_as::<_, UsageWatermark>("SELECT * FROM usage_state ORDER BY key")
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }
}
