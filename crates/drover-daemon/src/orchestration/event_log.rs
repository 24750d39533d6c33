//! Per-run agent log files.
//!
//! Each run writes `<log_dir>/agent_<task>_<YYYYmmdd_HHMMSS>.log`: a header
//! describing the run, the raw worker output, and a footer with the outcome.
//! The body is kept under a line ceiling by dropping its oldest lines.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const SEPARATOR: &str = "============================================================";

/// What the log header records about a run.
#[derive(Debug, Clone)]
pub struct LogHeader<'a> {
    pub task_id: &'a str,
    pub title: &'a str,
    pub priority: Option<i64>,
    pub model: Option<&'a str>,
    pub run_id: &'a str,
    pub prompt: &'a str,
}

/// What the log footer records about a run.
#[derive(Debug, Clone)]
pub struct LogFooter<'a> {
    pub outcome: &'a str,
    pub summary: &'a str,
    pub duration: &'a str,
    pub exit_code: Option<i32>,
}

/// Append-only log for one worker run.
pub struct EventLog {
    path: PathBuf,
    file: File,
    body_lines: usize,
    max_lines: usize,
}

impl EventLog {
    /// Create the log file and write its header.
    pub async fn create(log_dir: &Path, header: &LogHeader<'_>, max_lines: usize) -> io::Result<Self> {
        tokio::fs::create_dir_all(log_dir).await?;

        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = log_dir.join(format!("agent_{}_{stamp}.log", file_safe(header.task_id)));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let text = format!(
            "Task: {} - {}\nPriority: P{}\nModel: {}\nRun: {}\nStarted: {}\nPrompt:\n{}\n{SEPARATOR}\n\n",
            header.task_id,
            header.title,
            header.priority.unwrap_or(2),
            header.model.unwrap_or("default"),
            header.run_id,
            chrono::Local::now().to_rfc3339(),
            header.prompt,
        );
        file.write_all(text.as_bytes()).await?;

        Ok(Self {
            path,
            file,
            body_lines: 0,
            max_lines: max_lines.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line of worker stdout.
    pub async fn stdout_line(&mut self, line: &str) -> io::Result<()> {
        self.append_line(line).await
    }

    /// Append one line of worker stderr.
    pub async fn stderr_line(&mut self, line: &str) -> io::Result<()> {
        self.append_line(&format!("[stderr] {line}")).await
    }

    /// Write the footer and flush.
    pub async fn finish(&mut self, footer: &LogFooter<'_>) -> io::Result<()> {
        let exit = footer
            .exit_code
            .map_or_else(|| "none".to_string(), |c| c.to_string());
        let text = format!(
            "\n{SEPARATOR}\nOutcome: {}\nSummary: {}\nCompleted: {}\nDuration: {}\nExit code: {exit}\n",
            footer.outcome,
            footer.summary,
            chrono::Local::now().to_rfc3339(),
            footer.duration,
        );
        self.file.write_all(text.as_bytes()).await?;
        self.file.flush().await
    }

    async fn append_line(&mut self, line: &str) -> io::Result<()> {
        self.file.write_all(line.as_bytes()).await?;
        self.file.write_all(b"\n").await?;
        self.body_lines += 1;

        // 25% slack so compaction stays rare.
        if self.body_lines > self.max_lines + self.max_lines / 4 {
            self.compact().await?;
        }
        Ok(())
    }

    /// Rewrite the file with the header and the newest `max_lines` body lines.
    async fn compact(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        let content = tokio::fs::read_to_string(&self.path).await?;

        let marker = format!("{SEPARATOR}\n\n");
        let (header, body) = content
            .find(&marker)
            .map_or(("", content.as_str()), |i| content.split_at(i + marker.len()));

        let lines: Vec<&str> = body.lines().collect();
        let keep = &lines[lines.len().saturating_sub(self.max_lines)..];

        let mut rewritten = String::with_capacity(header.len() + body.len());
        rewritten.push_str(header);
        for line in keep {
            rewritten.push_str(line);
            rewritten.push('\n');
        }

        let tmp = self.path.with_extension("log.tmp");
        tokio::fs::write(&tmp, rewritten).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        self.file = OpenOptions::new().append(true).open(&self.path).await?;
        debug!(
            path = %self.path.display(),
            dropped = lines.len() - keep.len(),
            "Compacted agent log"
        );
        self.body_lines = keep.len();
        Ok(())
    }
}

fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Delete the oldest agent logs so at most `keep` remain. Returns the number removed.
pub async fn prune_logs(log_dir: &Path, keep: usize) -> io::Result<usize> {
    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
    let mut entries = tokio::fs::read_dir(log_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("agent_") && name.ends_with(".log")) {
            continue;
        }
        let modified = entry.metadata().await?.modified()?;
        logs.push((modified, entry.path()));
    }

    if logs.len() <= keep {
        return Ok(0);
    }

    logs.sort();
    let excess = logs.len() - keep;
    for (_, path) in logs.iter().take(excess) {
        tokio::fs::remove_file(path).await?;
        debug!(path = %path.display(), "Removed old agent log");
    }
    Ok(excess)
}
