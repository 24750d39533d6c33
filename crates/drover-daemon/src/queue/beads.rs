//! `bd` (beads) CLI queue backend.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{CloseStatus, QueueError, Task, TaskQueue};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest close reason passed on the command line.
const MAX_REASON_CHARS: usize = 500;

/// Task queue backed by the `bd` command line tool.
pub struct BeadsQueue {
    bin: PathBuf,
    /// Directory holding the `.beads` database; commands run here.
    dir: PathBuf,
}

impl BeadsQueue {
    pub fn new(bin: impl Into<PathBuf>, dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn run(&self, args: &[&str], timeout: Duration) -> Result<Output, QueueError> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(QueueError::Unavailable(
                format!("{} not found - is beads installed?", self.bin.display()),
            )),
            Ok(Err(e)) => Err(QueueError::Unavailable(format!(
                "failed to run {}: {e}",
                self.bin.display()
            ))),
            Err(_) => Err(QueueError::Unavailable(format!(
                "{} {} timed out after {}s",
                self.bin.display(),
                args.first().copied().unwrap_or_default(),
                timeout.as_secs()
            ))),
        }
    }
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl TaskQueue for BeadsQueue {
    async fn list_ready(&self) -> Result<Vec<Task>, QueueError> {
        let output = self
            .run(
                &["ready", "--unassigned", "--sort", "priority", "--json"],
                LIST_TIMEOUT,
            )
            .await?;

        if !output.status.success() {
            return Err(QueueError::Unavailable(format!(
                "bd ready failed: {}",
                stderr_text(&output)
            )));
        }

        parse_task_list(&String::from_utf8_lossy(&output.stdout))
    }

    async fn claim(&self, task_id: &str) -> Result<bool, QueueError> {
        let output = self
            .run(&["update", task_id, "--claim"], COMMAND_TIMEOUT)
            .await?;

        if output.status.success() {
            return Ok(true);
        }
        debug!(task_id, stderr = %stderr_text(&output), "Claim rejected");
        Ok(false)
    }

    async fn close(
        &self,
        task_id: &str,
        status: CloseStatus,
        summary: &str,
    ) -> Result<(), QueueError> {
        let output = match status {
            CloseStatus::Completed | CloseStatus::Failed => {
                let reason = close_reason(status, summary);
                self.run(&["close", task_id, "--reason", &reason], COMMAND_TIMEOUT)
                    .await?
            }
            CloseStatus::Released => self.run(&["reopen", task_id], COMMAND_TIMEOUT).await?,
        };

        if output.status.success() {
            Ok(())
        } else {
            Err(QueueError::Command(format!(
                "close {task_id} as {status}: {}",
                stderr_text(&output)
            )))
        }
    }

    async fn show(&self, task_id: &str) -> Result<Option<Task>, QueueError> {
        let output = self
            .run(&["show", task_id, "--json"], COMMAND_TIMEOUT)
            .await?;

        if !output.status.success() {
            debug!(task_id, stderr = %stderr_text(&output), "bd show failed");
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| QueueError::Unavailable(format!("unparseable bd show output: {e}")))?;

        // `bd show` answers with an array of one element.
        let value = match value {
            Value::Array(items) => match items.into_iter().next() {
                Some(first) => first,
                None => return Ok(None),
            },
            Value::Null => return Ok(None),
            other => other,
        };

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| QueueError::Unavailable(format!("bad task in bd show output: {e}")))
    }

    async fn ensure_initialized(&self) -> Result<(), QueueError> {
        if self.dir.join(".beads").exists() {
            return Ok(());
        }

        info!(dir = %self.dir.display(), "Initializing beads");
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| QueueError::Command(format!("create {}: {e}", self.dir.display())))?;

        let output = self.run(&["init"], INIT_TIMEOUT).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(QueueError::Command(format!(
                "bd init failed: {}",
                stderr_text(&output)
            )))
        }
    }
}

fn close_reason(status: CloseStatus, summary: &str) -> String {
    let summary = summary.trim();
    let mut reason = if summary.is_empty() {
        status.as_str().to_string()
    } else {
        format!("{status}: {summary}")
    };
    if let Some((cut, _)) = reason.char_indices().nth(MAX_REASON_CHARS) {
        reason.truncate(cut);
        reason.push_str("...");
    }
    reason
}

/// Parse `bd ready --json` output: a JSON array or one object per line.
///
/// Entries that are not valid tasks are skipped; output that is not JSON at
/// all is an error.
pub(crate) fn parse_task_list(stdout: &str) -> Result<Vec<Task>, QueueError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }

    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)
            .map_err(|e| QueueError::Unavailable(format!("unparseable bd ready output: {e}")))?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()
            .map_err(|e| QueueError::Unavailable(format!("unparseable bd ready output: {e}")))?
    };

    Ok(values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Task>(value) {
            Ok(task) if !task.id.is_empty() => Some(task),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Skipping malformed task entry");
                None
            }
        })
        .collect())
}
