//! Usage reporters.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::debug;

use super::UsageError;

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// One usage reading: a flat JSON object with `<bucket>_percent` and
/// optional `<bucket>_resets` keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSample {
    fields: Map<String, Value>,
}

impl UsageSample {
    pub const fn new(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Usage percentage for `bucket`. Numeric strings are accepted.
    pub fn percent(&self, bucket: &str) -> Option<f64> {
        match self.fields.get(&format!("{bucket}_percent"))? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Raw reset timestamp for `bucket`, if non-empty.
    pub fn resets(&self, bucket: &str) -> Option<&str> {
        self.fields
            .get(&format!("{bucket}_resets"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Timestamp the reporter attached to the sample.
    pub fn timestamp(&self) -> Option<&str> {
        self.fields.get("timestamp").and_then(Value::as_str)
    }
}

/// Source of usage samples.
#[async_trait]
pub trait UsageReporter: Send + Sync {
    /// Take a sample. `Ok(None)` means no reporter is available right now.
    async fn sample(&self) -> Result<Option<UsageSample>, UsageError>;
}

/// Runs `bash <script>` and parses its stdout as a JSON object.
#[derive(Debug, Clone)]
pub struct ScriptReporter {
    script: PathBuf,
    working_dir: PathBuf,
    timeout: Duration,
}

impl ScriptReporter {
    pub fn new(script: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            working_dir: working_dir.into(),
            timeout: SCRIPT_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl UsageReporter for ScriptReporter {
    async fn sample(&self) -> Result<Option<UsageSample>, UsageError> {
        if !self.script.exists() {
            debug!(script = %self.script.display(), "Usage script not found, skipping check");
            return Ok(None);
        }

        let output = Command::new("bash")
            .arg(&self.script)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| UsageError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| UsageError::Script(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UsageError::Script(stderr.trim().to_string()));
        }

        let fields: Map<String, Value> = serde_json::from_slice(&output.stdout)
            .map_err(|e| UsageError::Parse(e.to_string()))?;
        Ok(Some(UsageSample::new(fields)))
    }
}
