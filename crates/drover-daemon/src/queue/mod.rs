//! Task queue access.
//!
//! The orchestrator only needs three things from a queue: the list of ready
//! tasks, an atomic claim, and a way to close a task. [`TaskQueue`] captures
//! that surface; [`BeadsQueue`] drives the `bd` CLI and [`MemoryQueue`] keeps
//! everything in process.

mod beads;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

pub use beads::BeadsQueue;
pub use memory::{CloseRecord, MemoryQueue, TaskState};

/// Prefix of the label that selects the worker model.
const MODEL_LABEL_PREFIX: &str = "model:";

/// A unit of work from the queue.
///
/// Decoded leniently: unknown fields are ignored and `null` or missing
/// optional fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub description: String,
    /// Lower is more urgent.
    #[serde(default, deserialize_with = "lenient_priority")]
    pub priority: Option<i64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: Vec<String>,
    /// Channel that should receive this task's outcome.
    #[serde(default, alias = "channel_id")]
    pub channel_binding: Option<String>,
}

impl Task {
    /// Model requested through a `model:<name>` label.
    pub fn model(&self) -> Option<&str> {
        parse_model_from_labels(&self.labels)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept `1`, `"1"` or `"P1"`; anything else is no priority.
fn lenient_priority<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<serde_json::Value>::deserialize(deserializer)? {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => {
            let s = s.trim();
            s.strip_prefix(['P', 'p']).unwrap_or(s).parse().ok()
        }
        _ => None,
    })
}

/// Extract the model from labels like `model:opus`.
///
/// The first `model:` label wins. A blank name there means the default model,
/// even if a later label names one.
pub fn parse_model_from_labels<S: AsRef<str>>(labels: &[S]) -> Option<&str> {
    labels
        .iter()
        .find_map(|label| label.as_ref().strip_prefix(MODEL_LABEL_PREFIX))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// How a task leaves the orchestrator's hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Completed,
    Failed,
    /// Hand the task back to the ready pool.
    Released,
}

impl CloseStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Released => "released",
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from a task queue backend.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The backend could not be reached or answered with garbage. Transient.
    #[error("Task queue unavailable: {0}")]
    Unavailable(String),

    /// The backend rejected a command.
    #[error("Task queue command failed: {0}")]
    Command(String),
}

/// Narrow interface to the external task queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Ready, unassigned tasks in priority order.
    async fn list_ready(&self) -> Result<Vec<Task>, QueueError>;

    /// Atomically claim a task. `Ok(false)` means another actor owns it.
    async fn claim(&self, task_id: &str) -> Result<bool, QueueError>;

    /// Record the final state of a task.
    async fn close(
        &self,
        task_id: &str,
        status: CloseStatus,
        summary: &str,
    ) -> Result<(), QueueError>;

    /// Full details for one task, if it exists.
    async fn show(&self, task_id: &str) -> Result<Option<Task>, QueueError>;

    /// Prepare the backend before first use.
    async fn ensure_initialized(&self) -> Result<(), QueueError> {
        Ok(())
    }
}
