//! Outcome and alert notifications.
//!
//! Records are handed to a [`NotificationEmitter`], which writes them to a
//! [`NotificationSink`] from a background task. The daemon's sink is the
//! `notifications` table in the local database.

pub mod emitter;
mod sqlite;

use async_trait::async_trait;
use drover_core::db::unix_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::DatabaseError;

pub use emitter::{EmitterConfig, NotificationEmitter, RetryPolicy};

/// Kind of notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// A worker run reached a terminal state.
    TaskCompletion,
    /// A usage bucket crossed a new threshold.
    UsageAlert,
}

impl NotificationType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskCompletion => "task_completion",
            Self::UsageAlert => "usage_alert",
        }
    }

    /// Component that produces this kind of record.
    pub const fn source(self) -> &'static str {
        match self {
            Self::TaskCompletion => "orchestrator",
            Self::UsageAlert => "usage_monitor",
        }
    }
}

/// A notification ready to be appended to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub source: String,
    pub title: String,
    pub channel_id: Option<String>,
    pub payload: Value,
    /// Sink-side deduplication key.
    pub idempotency_key: String,
    pub created_at: i64,
}

impl NotificationRecord {
    pub fn new(
        kind: NotificationType,
        title: impl Into<String>,
        channel_id: Option<String>,
        payload: Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source: kind.source().to_string(),
            title: title.into(),
            channel_id,
            payload,
            idempotency_key: idempotency_key.into(),
            created_at: unix_timestamp(),
        }
    }
}

/// Errors from a notification sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Notification sink unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Append-only store of notification records.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Append a record. Returns `false` if the idempotency key was already
    /// present and nothing was written.
    async fn append(&self, record: &NotificationRecord) -> Result<bool, SinkError>;
}
