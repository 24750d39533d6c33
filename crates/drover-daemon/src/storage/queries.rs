//! Notification queries.

use super::db::{Database, DatabaseError};
use super::models::{NotificationReader, StoredNotification};
use crate::notify::NotificationRecord;

impl Database {
    // =========================================================================
    // Notification queries
    // =========================================================================

    /// Append a notification.
    ///
    /// Returns `false` when a record with the same idempotency key already
    /// exists; the existing row is left untouched.
    pub async fn insert_notification(
        &self,
        record: &NotificationRecord,
    ) -> Result<bool, DatabaseError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| DatabaseError::Query(format!("payload encoding: {e}")))?;

        let result = sqlx::query(
            "INSERT INTO notifications \
             (type, source, channel_id, title, payload, idempotency_key, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(idempotency_key) DO NOTHING",
        )
        .bind(record.kind.as_str())
        .bind(&record.source)
        .bind(record.channel_id.as_deref())
        .bind(&record.title)
        .bind(payload)
        .bind(&record.idempotency_key)
        .bind(record.created_at)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Notifications the given reader has not seen yet, oldest first.
    pub async fn unseen_notifications(
        &self,
        reader: NotificationReader,
        limit: i64,
    ) -> Result<Vec<StoredNotification>, DatabaseError> {
        let sql = format!(
            "SELECT * FROM notifications WHERE {} = 0 ORDER BY id ASC LIMIT ?",
            reader.seen_column()
        );
        let rows = sqlx::query_as::<_, StoredNotification>(&sql)
            .bind(limit)
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }

    /// Mark notifications as seen by one reader. Returns the number updated.
    pub async fn mark_notifications_seen(
        &self,
        reader: NotificationReader,
        ids: &[i64],
    ) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE notifications SET {} = 1 WHERE id IN ({placeholders})",
            reader.seen_column()
        );
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query.execute(self.pool()).await?;
        Ok(result.rows_affected())
    }

    /// Keep only the newest `keep_count` notifications. Returns rows deleted.
    pub async fn prune_notifications(&self, keep_count: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE id NOT IN \
             (SELECT id FROM notifications ORDER BY id DESC LIMIT ?)",
        )
        .bind(keep_count)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Most recent notifications, newest first.
    pub async fn recent_notifications(
        &self,
        limit: i64,
    ) -> Result<Vec<StoredNotification>, DatabaseError> {
        let rows = sqlx::query_as::<_, StoredNotification>(
            "SELECT * FROM notifications ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::notify::NotificationType;
    use serde_json::json;

    fn record(key: &str) -> NotificationRecord {
        NotificationRecord::new(
            NotificationType::TaskCompletion,
            "Task completed: demo",
            Some("chan-1".into()),
            json!({"task_id": "t-1"}),
            key,
        )
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_key() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.insert_notification(&record("k1")).await.unwrap());
        assert!(!db.insert_notification(&record("k1")).await.unwrap());
        assert!(db.insert_notification(&record("k2")).await.unwrap());

        let rows = db.recent_notifications(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "task_completion");
        assert_eq!(rows[0].source, "orchestrator");
        assert_eq!(rows[0].channel_id.as_deref(), Some("chan-1"));
    }

    #[tokio::test]
    async fn readers_have_independent_seen_flags() {
        let db = Database::open_in_memory().await.unwrap();
        db.insert_notification(&record("a")).await.unwrap();
        db.insert_notification(&record("b")).await.unwrap();

        let unseen = db
            .unseen_notifications(NotificationReader::Bot, 10)
            .await
            .unwrap();
        assert_eq!(unseen.len(), 2);
        let first = unseen[0].id;

        let updated = db
            .mark_notifications_seen(NotificationReader::Bot, &[first])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let bot = db
            .unseen_notifications(NotificationReader::Bot, 10)
            .await
            .unwrap();
        let proxy = db
            .unseen_notifications(NotificationReader::Proxy, 10)
            .await
            .unwrap();
        assert_eq!(bot.len(), 1);
        assert_eq!(proxy.len(), 2);
        assert_eq!(
            db.mark_notifications_seen(NotificationReader::Proxy, &[])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn prune_keeps_newest() {
        let db = Database::open_in_memory().await.unwrap();
        for i in 0..5 {
            db.insert_notification(&record(&format!("k{i}"))).await.unwrap();
        }
        assert_eq!(db.prune_notifications(2).await.unwrap(), 3);
        let rows = db.recent_notifications(10).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.idempotency_key.as_str()).collect();
        assert_eq!(keys, vec!["k4", "k3"]);
    }
}
