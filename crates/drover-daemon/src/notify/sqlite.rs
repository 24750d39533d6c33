use async_trait::async_trait;

use super::{NotificationRecord, NotificationSink, SinkError};
use crate::storage::Database;

#[async_trait]
impl NotificationSink for Database {
    async fn append(&self, record: &NotificationRecord) -> Result<bool, SinkError> {
        Ok(self.insert_notification(record).await?)
    }
}
