//! Worker agent runner.
//!
//! [`AgentRunner::run`] drives one worker process for one task:
//! - spawns the worker with a cleaned environment (stdin closed)
//! - streams stdout NDJSON events and stderr lines into the run's log
//! - enforces the run deadline (SIGTERM -> grace period -> SIGKILL)
//! - honours cooperative cancellation through a [`CancelHandle`]
//! - folds exit status and the final `result` event into a typed outcome

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use drover_core::Config;
use drover_core::ndjson::{self, WorkerEvent, WorkerResult};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Split};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::event_log::{EventLog, LogFooter, LogHeader};
use super::prompt::load_system_prompt;

/// Settings shared by every run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub worker_bin: PathBuf,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    /// Appended to the worker's system prompt.
    pub system_prompt: Option<String>,
    /// Environment variables copied from the daemon into the worker.
    pub env_passthrough: Vec<String>,
    /// Time between SIGTERM and SIGKILL, and the time a worker may linger
    /// after its final event.
    pub grace_period: Duration,
    pub log_dir: PathBuf,
    pub max_log_lines: usize,
}

impl RunnerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_bin: config.worker.bin.clone(),
            allowed_tools: config.worker.allowed_tools.clone(),
            max_turns: config.worker.max_turns,
            system_prompt: load_system_prompt(config.worker.system_prompt_file.as_deref()),
            env_passthrough: config.worker.env_passthrough.clone(),
            grace_period: Duration::from_secs(config.worker.grace_period_secs),
            log_dir: config.log_dir(),
            max_log_lines: config.orchestrator.max_log_lines,
        }
    }
}

/// One run to execute.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub task_id: String,
    pub run_id: String,
    pub title: String,
    pub priority: Option<i64>,
    pub prompt: String,
    pub working_dir: PathBuf,
    pub model: Option<String>,
    pub timeout: Duration,
}

/// Why a run was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Someone asked for this task to stop.
    Requested,
    /// The orchestrator is shutting down.
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Cancellation handle for one run. The first reason given wins.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop. A no-op once the run has finished.
    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn reason(&self) -> CancelReason {
        self.reason.get().copied().unwrap_or(CancelReason::Requested)
    }
}

/// What a finished run produced, whatever its outcome.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub summary: String,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub tool_uses: usize,
    pub log_file: Option<PathBuf>,
}

/// Ways a run can fail.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("worker crashed ({})", crash_label(.report))]
    WorkerCrash { report: RunReport },

    #[error("worker reported an error: {}", summary_of(.report))]
    WorkerError { report: RunReport },

    #[error("worker timed out after {}", timeout_label(.timeout))]
    Timeout { timeout: Duration, report: RunReport },

    #[error("run cancelled ({reason})")]
    Cancelled {
        reason: CancelReason,
        report: RunReport,
    },
}

impl RunError {
    /// Partial report, when the worker got far enough to produce one.
    pub const fn report(&self) -> Option<&RunReport> {
        match self {
            Self::SpawnFailed { .. } => None,
            Self::WorkerCrash { report }
            | Self::WorkerError { report }
            | Self::Timeout { report, .. }
            | Self::Cancelled { report, .. } => Some(report),
        }
    }

    /// Terminal run state this error represents.
    pub const fn state(&self) -> RunState {
        match self {
            Self::SpawnFailed { .. } | Self::WorkerCrash { .. } | Self::WorkerError { .. } => {
                RunState::Failed
            }
            Self::Timeout { .. } => RunState::TimedOut,
            Self::Cancelled { .. } => RunState::Cancelled,
        }
    }
}

/// Lifecycle of an agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Claimed,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RunState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

fn crash_label(report: &RunReport) -> String {
    exit_label(&report.exit_code)
}

fn summary_of(report: &RunReport) -> &str {
    &report.summary
}

fn timeout_label(timeout: &Duration) -> String {
    format_duration(*timeout)
}

#[allow(clippy::ref_option)]
fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit code {c}"))
}

/// Render a duration as `12s`, `3m 04s` or `1h 02m 03s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Why the supervision loop stopped.
enum Stop {
    Exited(std::io::Result<ExitStatus>),
    Timeout,
    Cancelled(CancelReason),
    /// Result event seen, but the worker did not exit within the grace period.
    Lingered,
}

/// Spawns and supervises worker processes.
#[derive(Debug, Clone)]
pub struct AgentRunner {
    config: Arc<RunnerConfig>,
}

impl AgentRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn build_command(&self, request: &RunRequest) -> Command {
        let mut cmd = Command::new(&self.config.worker_bin);
        cmd.current_dir(&request.working_dir)
            .arg("-p")
            .arg(&request.prompt)
            .arg("--max-turns")
            .arg(self.config.max_turns.to_string());

        if !self.config.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").args(&self.config.allowed_tools);
        }

        cmd.arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");

        if let Some(ref system_prompt) = self.config.system_prompt {
            cmd.arg("--append-system-prompt").arg(system_prompt);
        }
        if let Some(ref model) = request.model {
            cmd.arg("--model").arg(model);
        }

        cmd.env_clear();
        for key in &self.config.env_passthrough {
            if let Some(value) = std::env::var_os(key) {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so termination reaches the worker's children too.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }

    /// Run one worker to a terminal outcome.
    #[allow(clippy::too_many_lines)]
    pub async fn run(&self, request: RunRequest, cancel: CancelHandle) -> Result<RunReport, RunError> {
        let started = Instant::now();

        let header = LogHeader {
            task_id: &request.task_id,
            title: &request.title,
            priority: request.priority,
            model: request.model.as_deref(),
            run_id: &request.run_id,
            prompt: &request.prompt,
        };
        let mut log = match EventLog::create(&self.config.log_dir, &header, self.config.max_log_lines).await {
            Ok(log) => Some(log),
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "Could not create agent log");
                None
            }
        };
        let log_file = log.as_ref().map(|l| l.path().to_path_buf());

        if cancel.is_cancelled() {
            let report = RunReport {
                summary: "cancelled before start".to_string(),
                log_file,
                ..RunReport::default()
            };
            finish_log(log.as_mut(), RunState::Cancelled.as_str(), &report).await;
            return Err(RunError::Cancelled {
                reason: cancel.reason(),
                report,
            });
        }

        let mut child = match self.build_command(&request).spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("{}: {e}", self.config.worker_bin.display());
                warn!(task_id = %request.task_id, error = %reason, "Worker spawn failed");
                let report = RunReport {
                    summary: reason.clone(),
                    log_file,
                    ..RunReport::default()
                };
                finish_log(log.as_mut(), RunState::Failed.as_str(), &report).await;
                return Err(RunError::SpawnFailed { reason });
            }
        };

        info!(
            task_id = %request.task_id,
            run_id = %request.run_id,
            pid = ?child.id(),
            model = request.model.as_deref().unwrap_or("default"),
            "Worker started"
        );

        let mut stdout = child.stdout.take().map(LineReader::new);
        let mut stderr = child.stderr.take().map(LineReader::new);

        let deadline = tokio::time::sleep(request.timeout);
        tokio::pin!(deadline);
        // Armed by the result event or by process exit.
        let linger = tokio::time::sleep(Duration::MAX);
        tokio::pin!(linger);
        let mut linger_armed = false;

        let mut result: Option<WorkerResult> = None;
        let mut tool_uses = 0usize;
        let mut exit: Option<std::io::Result<ExitStatus>> = None;

        let stop = loop {
            if stdout.is_none()
                && stderr.is_none()
                && let Some(status) = exit.take()
            {
                break Stop::Exited(status);
            }

            tokio::select! {
                biased;

                () = cancel.token.cancelled() => break Stop::Cancelled(cancel.reason()),
                () = &mut deadline => break Stop::Timeout,
                () = &mut linger, if linger_armed => {
                    break match exit.take() {
                        Some(status) => Stop::Exited(status),
                        None => Stop::Lingered,
                    };
                }
                status = child.wait(), if exit.is_none() => {
                    exit = Some(status);
                    if !linger_armed {
                        linger.as_mut().reset(tokio::time::Instant::now() + self.config.grace_period);
                        linger_armed = true;
                    }
                }
                line = next_line(&mut stdout), if stdout.is_some() => match line {
                    Some(line) => {
                        if let Some(log) = log.as_mut()
                            && let Err(e) = log.stdout_line(&line).await
                        {
                            debug!(error = %e, "Agent log write failed");
                        }
                        match ndjson::parse_line(&line) {
                            Ok(WorkerEvent::Result(r)) => {
                                debug!(task_id = %request.task_id, success = r.success, "Worker result event");
                                result = Some(r);
                                if !linger_armed {
                                    linger.as_mut().reset(tokio::time::Instant::now() + self.config.grace_period);
                                    linger_armed = true;
                                }
                            }
                            Ok(event) => {
                                for tool in event.tool_uses() {
                                    tool_uses += 1;
                                    debug!(task_id = %request.task_id, tool = %tool.name, "Worker tool use");
                                }
                            }
                            Err(_) => {}
                        }
                    }
                    None => stdout = None,
                },
                line = next_line(&mut stderr), if stderr.is_some() => match line {
                    Some(line) => {
                        debug!(task_id = %request.task_id, "stderr: {}", line);
                        if let Some(log) = log.as_mut()
                            && let Err(e) = log.stderr_line(&line).await
                        {
                            debug!(error = %e, "Agent log write failed");
                        }
                    }
                    None => stderr = None,
                },
            }
        };

        // A worker that already exited keeps its own outcome.
        let stop = match (stop, exit) {
            (Stop::Timeout | Stop::Cancelled(_) | Stop::Lingered, Some(status)) => {
                Stop::Exited(status)
            }
            (stop, _) => stop,
        };

        let (exit_code, terminated) = match &stop {
            Stop::Exited(Ok(status)) => (status.code(), false),
            Stop::Exited(Err(e)) => {
                warn!(task_id = %request.task_id, error = %e, "Waiting on worker failed");
                (None, false)
            }
            Stop::Timeout | Stop::Cancelled(_) | Stop::Lingered => {
                let status = terminate_process(&mut child, self.config.grace_period).await;
                (status.and_then(|s| s.code()), true)
            }
        };

        let mut report = RunReport {
            exit_code,
            duration: started.elapsed(),
            summary: String::new(),
            cost_usd: result.as_ref().and_then(|r| r.cost_usd),
            num_turns: result.as_ref().and_then(|r| r.num_turns),
            tool_uses,
            log_file,
        };

        let outcome = match stop {
            Stop::Timeout => {
                report.summary = format!("timed out after {}", format_duration(request.timeout));
                Err(RunError::Timeout {
                    timeout: request.timeout,
                    report,
                })
            }
            Stop::Cancelled(reason) => {
                report.summary = format!("cancelled ({reason})");
                Err(RunError::Cancelled { reason, report })
            }
            Stop::Exited(_) | Stop::Lingered => classify(result.as_ref(), exit_code, terminated, report),
        };

        let fallback = RunReport::default();
        let (label, report) = match &outcome {
            Ok(report) => (RunState::Completed.as_str(), report),
            Err(e) => (e.state().as_str(), e.report().unwrap_or(&fallback)),
        };
        finish_log(log.as_mut(), label, report).await;

        info!(
            task_id = %request.task_id,
            run_id = %request.run_id,
            outcome = label,
            exit_code = ?exit_code,
            duration = %format_duration(started.elapsed()),
            "Worker finished"
        );

        outcome
    }
}

/// Consecutive read failures after which a stream counts as closed.
const MAX_READ_ERRORS: u32 = 8;

/// Line reader over a worker pipe that tolerates non-UTF-8 output.
///
/// Invalid bytes are replaced rather than ending the stream, so the pipe
/// stays open and later events are still seen.
struct LineReader<R> {
    segments: Split<BufReader<R>>,
    errors: u32,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            segments: BufReader::new(inner).split(b'\n'),
            errors: 0,
        }
    }

    /// Next line without its terminator; `None` at end of stream.
    async fn next_line(&mut self) -> Option<String> {
        loop {
            match self.segments.next_segment().await {
                Ok(Some(mut bytes)) => {
                    self.errors = 0;
                    if bytes.last() == Some(&b'\r') {
                        bytes.pop();
                    }
                    return Some(match String::from_utf8(bytes) {
                        Ok(line) => line,
                        Err(e) => {
                            debug!("Worker output is not valid UTF-8, decoding lossily");
                            String::from_utf8_lossy(e.as_bytes()).into_owned()
                        }
                    });
                }
                Ok(None) => return None,
                Err(e) => {
                    self.errors += 1;
                    debug!(error = %e, attempt = self.errors, "Worker pipe read failed");
                    if self.errors >= MAX_READ_ERRORS {
                        return None;
                    }
                }
            }
        }
    }
}

async fn next_line<R: AsyncRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Option<String> {
    match reader {
        Some(reader) => reader.next_line().await,
        None => None,
    }
}

/// Fold the worker's result event and exit status into an outcome.
fn classify(
    result: Option<&WorkerResult>,
    exit_code: Option<i32>,
    terminated: bool,
    mut report: RunReport,
) -> Result<RunReport, RunError> {
    match result {
        Some(r) if !r.success => {
            report.summary = r.summary();
            Err(RunError::WorkerError { report })
        }
        // Killed after lingering past its result: the result stands.
        Some(r) if terminated || exit_code == Some(0) => {
            report.summary = r.summary();
            Ok(report)
        }
        Some(_) => {
            report.summary = format!(
                "worker exited with {} after reporting success",
                exit_label(&exit_code)
            );
            Err(RunError::WorkerError { report })
        }
        None if exit_code == Some(0) => {
            report.summary = "worker exited without a result event".to_string();
            Ok(report)
        }
        None => {
            report.summary = format!("worker crashed ({})", exit_label(&exit_code));
            Err(RunError::WorkerCrash { report })
        }
    }
}

async fn finish_log(log: Option<&mut EventLog>, outcome: &str, report: &RunReport) {
    let Some(log) = log else {
        return;
    };
    let footer = LogFooter {
        outcome,
        summary: &report.summary,
        duration: &format_duration(report.duration),
        exit_code: report.exit_code,
    };
    if let Err(e) = log.finish(&footer).await {
        debug!(error = %e, "Agent log footer write failed");
    }
}

/// Two-phase termination: SIGTERM to the worker's process group, wait
/// `grace`, then SIGKILL.
async fn terminate_process(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status.ok();
    }

    warn!("Grace period expired, sending SIGKILL");
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let _ = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) };
        }
    }
    let _ = child.kill().await;
    child.wait().await.ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn worker_result(success: bool, text: &str) -> WorkerResult {
        WorkerResult {
            success,
            result: Some(text.to_string()),
            ..WorkerResult::default()
        }
    }

    #[test]
    fn clean_exit_with_success_completes() {
        let r = worker_result(true, "done");
        let report = classify(Some(&r), Some(0), false, RunReport::default()).unwrap();
        assert_eq!(report.summary, "done");
    }

    #[test]
    fn error_result_fails_regardless_of_exit() {
        let r = worker_result(false, "rate limited");
        for code in [Some(0), Some(1), None] {
            let err = classify(Some(&r), code, false, RunReport::default()).unwrap_err();
            assert!(matches!(err, RunError::WorkerError { .. }));
            assert_eq!(err.report().unwrap().summary, "rate limited");
        }
    }

    #[test]
    fn nonzero_exit_after_success_fails() {
        let r = worker_result(true, "done");
        let err = classify(Some(&r), Some(3), false, RunReport::default()).unwrap_err();
        assert_eq!(
            err.report().unwrap().summary,
            "worker exited with exit code 3 after reporting success"
        );
    }

    #[test]
    fn lingering_after_success_still_completes() {
        let r = worker_result(true, "done");
        assert!(classify(Some(&r), None, true, RunReport::default()).is_ok());
    }

    #[test]
    fn no_result_event() {
        assert!(classify(None, Some(0), false, RunReport::default()).is_ok());

        let err = classify(None, Some(2), false, RunReport::default()).unwrap_err();
        assert!(matches!(err, RunError::WorkerCrash { .. }));
        assert_eq!(err.to_string(), "worker crashed (exit code 2)");

        let err = classify(None, None, false, RunReport::default()).unwrap_err();
        assert_eq!(err.to_string(), "worker crashed (killed by signal)");
    }

    #[test]
    fn durations_render_compactly() {
        assert_eq!(format_duration(Duration::from_secs(12)), "12s");
        assert_eq!(format_duration(Duration::from_secs(184)), "3m 04s");
        assert_eq!(format_duration(Duration::from_secs(3723)), "1h 02m 03s");
    }

    #[test]
    fn first_cancel_reason_wins() {
        let handle = CancelHandle::new();
        handle.cancel(CancelReason::Shutdown);
        handle.cancel(CancelReason::Requested);
        assert!(handle.is_cancelled());
        assert_eq!(handle.reason(), CancelReason::Shutdown);
    }

    #[cfg(unix)]
    mod process {
        use super::super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;

        fn script(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("worker.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn runner(dir: &Path, bin: PathBuf) -> AgentRunner {
            AgentRunner::new(RunnerConfig {
                worker_bin: bin,
                allowed_tools: vec!["Read".into(), "Bash".into()],
                max_turns: 5,
                system_prompt: None,
                env_passthrough: vec!["PATH".into()],
                grace_period: Duration::from_millis(300),
                log_dir: dir.join("logs"),
                max_log_lines: 1_000,
            })
        }

        fn request(dir: &Path, timeout: Duration) -> RunRequest {
            RunRequest {
                task_id: "t-1".into(),
                run_id: "r-1".into(),
                title: "Test".into(),
                priority: Some(1),
                prompt: "hello".into(),
                working_dir: dir.to_path_buf(),
                model: Some("sonnet".into()),
                timeout,
            }
        }

        #[tokio::test]
        async fn passes_arguments_and_parses_result() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                r#"echo "args: $*" >&2
echo '{"type":"system","subtype":"init"}'
echo 'not json'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{}}]}}'
echo '{"type":"result","subtype":"success","is_error":false,"num_turns":2,"total_cost_usd":0.1,"result":"ok"}'"#,
            );
            let runner = runner(dir.path(), bin);
            let report = runner
                .run(request(dir.path(), Duration::from_secs(10)), CancelHandle::new())
                .await
                .unwrap();

            assert_eq!(report.exit_code, Some(0));
            assert_eq!(report.summary, "ok");
            assert_eq!(report.num_turns, Some(2));
            assert_eq!(report.tool_uses, 1);

            let log = std::fs::read_to_string(report.log_file.unwrap()).unwrap();
            assert!(log.contains(
                "[stderr] args: -p hello --max-turns 5 --allowedTools Read Bash --output-format stream-json --verbose --model sonnet"
            ));
            assert!(log.contains("not json"));
            assert!(log.contains("Outcome: completed"));
        }

        #[tokio::test]
        async fn environment_is_filtered() {
            let dir = tempfile::tempdir().unwrap();
            // Only PATH is forwarded, so HOME must be unset in the worker.
            let bin = script(dir.path(), r#"[ -z "$HOME" ] || exit 9"#);
            let report = runner(dir.path(), bin)
                .run(request(dir.path(), Duration::from_secs(10)), CancelHandle::new())
                .await
                .unwrap();
            assert_eq!(report.exit_code, Some(0));
        }

        #[tokio::test]
        async fn binary_output_does_not_hide_the_result() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                r#"printf 'tool output \377\376\n'
sleep 0.3
echo '{"type":"result","subtype":"success","result":"all good"}'"#,
            );
            let report = runner(dir.path(), bin)
                .run(request(dir.path(), Duration::from_secs(10)), CancelHandle::new())
                .await
                .unwrap();

            assert_eq!(report.exit_code, Some(0));
            assert_eq!(report.summary, "all good");
            let log = std::fs::read_to_string(report.log_file.unwrap()).unwrap();
            assert!(log.contains("tool output \u{fffd}\u{fffd}"));
        }

        #[tokio::test]
        async fn crash_without_result() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "echo oops >&2\nexit 4");
            let err = runner(dir.path(), bin)
                .run(request(dir.path(), Duration::from_secs(10)), CancelHandle::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RunError::WorkerCrash { .. }));
            assert_eq!(err.report().unwrap().exit_code, Some(4));
        }

        #[tokio::test]
        async fn missing_binary_is_spawn_failure() {
            let dir = tempfile::tempdir().unwrap();
            let err = runner(dir.path(), dir.path().join("nope"))
                .run(request(dir.path(), Duration::from_secs(10)), CancelHandle::new())
                .await
                .unwrap_err();
            assert!(matches!(err, RunError::SpawnFailed { .. }));
            assert_eq!(err.state(), RunState::Failed);
        }

        #[tokio::test]
        async fn timeout_terminates_within_grace() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "trap '' TERM\nwhile true; do sleep 0.1; done");
            let started = Instant::now();
            let err = runner(dir.path(), bin)
                .run(request(dir.path(), Duration::from_millis(300)), CancelHandle::new())
                .await
                .unwrap_err();

            assert!(matches!(err, RunError::Timeout { .. }));
            // timeout + grace, with scheduling slack.
            assert!(started.elapsed() < Duration::from_secs(3));
        }

        #[tokio::test]
        async fn cancellation_stops_the_worker() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(dir.path(), "exec sleep 30");
            let runner = runner(dir.path(), bin);
            let cancel = CancelHandle::new();

            let handle = {
                let cancel = cancel.clone();
                let req = request(dir.path(), Duration::from_secs(30));
                tokio::spawn(async move { runner.run(req, cancel).await })
            };
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel(CancelReason::Requested);

            let err = tokio::time::timeout(Duration::from_secs(3), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap_err();
            assert!(matches!(
                err,
                RunError::Cancelled {
                    reason: CancelReason::Requested,
                    ..
                }
            ));
        }

        #[tokio::test]
        async fn lingering_after_result_is_terminated_but_completes() {
            let dir = tempfile::tempdir().unwrap();
            let bin = script(
                dir.path(),
                r#"echo '{"type":"result","subtype":"success","result":"finished"}'
exec sleep 30"#,
            );
            let started = Instant::now();
            let report = runner(dir.path(), bin)
                .run(request(dir.path(), Duration::from_secs(30)), CancelHandle::new())
                .await
                .unwrap();
            assert_eq!(report.summary, "finished");
            assert!(started.elapsed() < Duration::from_secs(5));
        }
    }
}
