//! Configuration resolution for drover.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`--config`, or `$XDG_CONFIG_HOME/drover/settings.json`)
//! 3. Environment variables (`ORCHESTRATOR_*`)
//! 4. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete drover configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub usage: UsageConfig,
}

/// Scheduler and queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum concurrently running worker agents.
    pub concurrency: usize,
    /// Seconds between queue polls.
    pub poll_interval_secs: u64,
    /// Root directory: the queue lives here, logs and state files below it.
    pub working_dir: PathBuf,
    /// Path to the task queue CLI.
    pub queue_bin: PathBuf,
    /// Default notification channel for task outcomes.
    pub notify_channel: Option<String>,
    /// Agent log files kept on disk.
    pub max_log_files: usize,
    /// Line ceiling per agent log.
    pub max_log_lines: usize,
    /// Database file (defaults to `<working_dir>/drover.db`).
    pub database_path: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            poll_interval_secs: 30,
            working_dir: default_working_dir(),
            queue_bin: PathBuf::from("bd"),
            notify_channel: None,
            max_log_files: 50,
            max_log_lines: 5_000,
            database_path: None,
        }
    }
}

/// Worker agent invocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Path to the worker executable.
    pub bin: PathBuf,
    /// Model used when a task carries no `model:` label.
    pub default_model: Option<String>,
    /// Per-run deadline in seconds.
    pub timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL.
    pub grace_period_secs: u64,
    /// Worker cwd, relative to the working dir.
    pub agent_subdir: PathBuf,
    /// Tools pre-approved for the worker.
    pub allowed_tools: Vec<String>,
    /// Turn limit passed to the worker.
    pub max_turns: u32,
    /// Optional file whose content is appended to the worker's system prompt.
    pub system_prompt_file: Option<PathBuf>,
    /// Environment variables forwarded to the worker; everything else is dropped.
    pub env_passthrough: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bin: PathBuf::from("claude"),
            default_model: None,
            timeout_secs: 1_800,
            grace_period_secs: 5,
            agent_subdir: PathBuf::from("workspace"),
            allowed_tools: ["Read", "Write", "Edit", "Bash", "Glob", "Grep", "TodoWrite"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_turns: 9_999,
            system_prompt_file: None,
            env_passthrough: [
                "HOME",
                "PATH",
                "USER",
                "LANG",
                "LC_ALL",
                "TERM",
                "TMPDIR",
                "ANTHROPIC_API_KEY",
                "ANTHROPIC_BASE_URL",
                "CLAUDE_CONFIG_DIR",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// A monitored usage bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageBucket {
    /// Key in the reporter output (`<key>_percent`, `<key>_resets`).
    pub key: String,
    /// Human-readable label used in alerts.
    pub label: String,
}

/// Usage monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    /// Seconds between scheduled usage checks.
    pub poll_interval_secs: u64,
    /// Seconds between polls of the force-check trigger file.
    pub force_check_interval_secs: u64,
    /// Channel for usage alerts (falls back to the orchestrator channel).
    pub notify_channel: Option<String>,
    /// Usage reporter script.
    pub script_path: PathBuf,
    /// Alert thresholds in percent, applied to every bucket.
    pub thresholds: Vec<u32>,
    /// Buckets to monitor.
    pub buckets: Vec<UsageBucket>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3_600,
            force_check_interval_secs: 30,
            notify_channel: None,
            script_path: PathBuf::from("/app/scripts/get_usage.sh"),
            thresholds: (1..=10).map(|step| step * 10).collect(),
            buckets: vec![
                UsageBucket {
                    key: "week_all".to_string(),
                    label: "Weekly usage (all models)".to_string(),
                },
                UsageBucket {
                    key: "week_sonnet".to_string(),
                    label: "Weekly usage (Sonnet)".to_string(),
                },
            ],
        }
    }
}

impl Config {
    /// Directory holding per-run agent logs.
    pub fn log_dir(&self) -> PathBuf {
        self.orchestrator.working_dir.join("orchestrator_logs")
    }

    /// Working directory handed to worker agents.
    pub fn agent_working_dir(&self) -> PathBuf {
        self.orchestrator
            .working_dir
            .join(&self.worker.agent_subdir)
    }

    /// JSON array of task IDs whose runs should be cancelled.
    pub fn cancel_file(&self) -> PathBuf {
        self.orchestrator.working_dir.join("cancel_tasks.json")
    }

    /// Snapshot of the latest usage sample.
    pub fn usage_data_file(&self) -> PathBuf {
        self.orchestrator.working_dir.join("usage_data.json")
    }

    /// Trigger file requesting an immediate usage check.
    pub fn usage_force_check_file(&self) -> PathBuf {
        self.orchestrator.working_dir.join("usage_force_check")
    }

    /// Database path, explicit or under the working dir.
    pub fn database_path(&self) -> PathBuf {
        self.orchestrator
            .database_path
            .clone()
            .unwrap_or_else(|| self.orchestrator.working_dir.join("drover.db"))
    }

    /// Channel for usage alerts.
    pub fn usage_channel(&self) -> Option<&str> {
        self.usage
            .notify_channel
            .as_deref()
            .or(self.orchestrator.notify_channel.as_deref())
    }

    /// Reject configurations the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.poll_interval_secs == 0 {
            return Err(Error::Config("poll interval must be positive".into()));
        }
        if self.worker.timeout_secs == 0 {
            return Err(Error::Config("agent timeout must be positive".into()));
        }
        if self.worker.bin.as_os_str().is_empty() {
            return Err(Error::Config("worker binary must not be empty".into()));
        }
        if self.orchestrator.queue_bin.as_os_str().is_empty() {
            return Err(Error::Config("queue binary must not be empty".into()));
        }
        if self.orchestrator.max_log_lines == 0 {
            return Err(Error::Config("max log lines must be positive".into()));
        }
        if self.usage.poll_interval_secs == 0 || self.usage.force_check_interval_secs == 0 {
            return Err(Error::Config("usage intervals must be positive".into()));
        }
        if let Some(bad) = self.usage.thresholds.iter().find(|t| !(1..=100).contains(*t)) {
            return Err(Error::Config(format!(
                "usage threshold {bad} is outside 1..=100"
            )));
        }
        Ok(())
    }
}

/// Load configuration with layered resolution.
///
/// An explicit `path` must exist; without one, the global settings file is
/// used when present.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match global_config_path() {
            Some(global) if global.exists() => load_config_file(&global)?,
            _ => Config::default(),
        },
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global config file path (`$XDG_CONFIG_HOME/drover/settings.json`).
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("drover").join("settings.json"))
}

fn default_working_dir() -> PathBuf {
    dirs::home_dir().map_or_else(|| std::env::temp_dir().join("drover"), |h| h.join(".drover"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Apply `ORCHESTRATOR_*` overrides read through `lookup`.
///
/// Unparseable numeric values are ignored.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let number = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

    if let Some(n) = number("ORCHESTRATOR_CONCURRENCY") {
        config.orchestrator.concurrency = usize::try_from(n).unwrap_or(usize::MAX);
    }
    if let Some(n) = number("ORCHESTRATOR_POLL_INTERVAL") {
        config.orchestrator.poll_interval_secs = n;
    }
    if let Some(dir) = lookup("ORCHESTRATOR_WORKING_DIR") {
        config.orchestrator.working_dir = PathBuf::from(dir);
    }
    if let Some(bin) = lookup("ORCHESTRATOR_QUEUE_BIN") {
        config.orchestrator.queue_bin = PathBuf::from(bin);
    }
    if let Some(channel) = lookup("ORCHESTRATOR_NOTIFY_CHANNEL") {
        config.orchestrator.notify_channel = non_empty(channel);
    }
    if let Some(n) = number("ORCHESTRATOR_MAX_LOG_FILES") {
        config.orchestrator.max_log_files = usize::try_from(n).unwrap_or(usize::MAX);
    }
    if let Some(n) = number("ORCHESTRATOR_MAX_LOG_LINES") {
        config.orchestrator.max_log_lines = usize::try_from(n).unwrap_or(usize::MAX);
    }
    if let Some(bin) = lookup("ORCHESTRATOR_WORKER_BIN") {
        config.worker.bin = PathBuf::from(bin);
    }
    if let Some(model) = lookup("ORCHESTRATOR_DEFAULT_MODEL") {
        config.worker.default_model = non_empty(model);
    }
    if let Some(n) = number("ORCHESTRATOR_AGENT_TIMEOUT") {
        config.worker.timeout_secs = n;
    }
    if let Some(n) = number("ORCHESTRATOR_GRACE_PERIOD") {
        config.worker.grace_period_secs = n;
    }
    if let Some(file) = lookup("AGENT_SYSTEM_PROMPT_FILE") {
        config.worker.system_prompt_file = non_empty(file).map(PathBuf::from);
    }
    if let Some(n) = number("ORCHESTRATOR_USAGE_POLL_INTERVAL") {
        config.usage.poll_interval_secs = n;
    }
    if let Some(channel) = lookup("ORCHESTRATOR_USAGE_NOTIFY_CHANNEL") {
        config.usage.notify_channel = non_empty(channel);
    }
    if let Some(script) = lookup("ORCHESTRATOR_USAGE_SCRIPT") {
        config.usage.script_path = PathBuf::from(script);
    }
    if let Some(list) = lookup("ORCHESTRATOR_USAGE_THRESHOLDS") {
        let thresholds: Vec<u32> = list
            .split(',')
            .filter_map(|t| t.trim().parse().ok())
            .collect();
        if !thresholds.is_empty() {
            config.usage.thresholds = thresholds;
        }
    }
    if let Some(list) = lookup("ORCHESTRATOR_USAGE_BUCKETS") {
        let buckets = parse_buckets(&list);
        if !buckets.is_empty() {
            config.usage.buckets = buckets;
        }
    }
}

/// Parse `key=Label,key2=Label 2`. A bare key uses itself as the label.
fn parse_buckets(list: &str) -> Vec<UsageBucket> {
    list.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (key, label) = entry.split_once('=').unwrap_or((entry, entry));
            Some(UsageBucket {
                key: key.trim().to_string(),
                label: label.trim().to_string(),
            })
        })
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
