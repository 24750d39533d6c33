//! In-process task queue.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{CloseStatus, QueueError, Task, TaskQueue};

/// Lifecycle of a task inside [`MemoryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Claimed,
    Closed(CloseStatus),
}

/// A close call as observed by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRecord {
    pub task_id: String,
    pub status: CloseStatus,
    pub summary: String,
}

#[derive(Default)]
struct Inner {
    tasks: Vec<(Task, TaskState)>,
    closes: Vec<CloseRecord>,
}

/// Task queue held in memory, with atomic claims.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a queue holding `tasks`, all ready.
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: tasks.into_iter().map(|t| (t, TaskState::Ready)).collect(),
                closes: Vec::new(),
            }),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Add a ready task.
    pub async fn push(&self, task: Task) {
        self.inner.lock().await.tasks.push((task, TaskState::Ready));
    }

    /// Simulate a backend outage: listing and claiming fail while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Current state of a task.
    pub async fn state(&self, task_id: &str) -> Option<TaskState> {
        self.inner
            .lock()
            .await
            .tasks
            .iter()
            .find(|(t, _)| t.id == task_id)
            .map(|(_, s)| *s)
    }

    /// Every close call so far, in order.
    pub async fn closes(&self) -> Vec<CloseRecord> {
        self.inner.lock().await.closes.clone()
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(QueueError::Unavailable("memory queue offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn list_ready(&self) -> Result<Vec<Task>, QueueError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut ready: Vec<Task> = inner
            .tasks
            .iter()
            .filter(|(_, s)| *s == TaskState::Ready)
            .map(|(t, _)| t.clone())
            .collect();
        ready.sort_by_key(|t| t.priority.unwrap_or(i64::MAX));
        Ok(ready)
    }

    async fn claim(&self, task_id: &str) -> Result<bool, QueueError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.tasks.iter_mut().find(|(t, _)| t.id == task_id) {
            Some((_, state)) if *state == TaskState::Ready => {
                *state = TaskState::Claimed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn close(
        &self,
        task_id: &str,
        status: CloseStatus,
        summary: &str,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        let Some((_, state)) = inner.tasks.iter_mut().find(|(t, _)| t.id == task_id) else {
            return Err(QueueError::Command(format!("no such task: {task_id}")));
        };
        *state = match status {
            CloseStatus::Released => TaskState::Ready,
            other => TaskState::Closed(other),
        };
        inner.closes.push(CloseRecord {
            task_id: task_id.to_string(),
            status,
            summary: summary.to_string(),
        });
        Ok(())
    }

    async fn show(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        Ok(self
            .inner
            .lock()
            .await
            .tasks
            .iter()
            .find(|(t, _)| t.id == task_id)
            .map(|(t, _)| t.clone()))
    }
}
