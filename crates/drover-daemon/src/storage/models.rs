//! Database models for the drover daemon.

use serde::{Deserialize, Serialize};

/// Notification row as stored.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StoredNotification {
    pub id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub channel_id: Option<String>,
    pub title: String,
    pub payload: String,
    pub idempotency_key: String,
    pub seen_by_bot: bool,
    pub seen_by_proxy: bool,
    pub created_at: i64,
}

/// Downstream consumer of notifications; each has its own "seen" flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationReader {
    /// The chat bot that posts notifications to channels.
    Bot,
    /// The proxy that relays notifications to the assistant session.
    Proxy,
}

impl NotificationReader {
    pub(crate) const fn seen_column(self) -> &'static str {
        match self {
            Self::Bot => "seen_by_bot",
            Self::Proxy => "seen_by_proxy",
        }
    }
}

/// Usage watermark row.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageWatermark {
    pub key: String,
    pub value: i64,
    pub updated_at: i64,
}
