//! Polling scheduler: list, claim, launch, reap.
//!
//! The [`Scheduler`] owns the active-run set and every gate permit. Each
//! tick it lists ready tasks, takes a gate slot *before* claiming, and
//! launches a runner task per claimed task. Runners report back over a
//! completion channel; reaping releases the slot, emits the outcome
//! notification, and closes the task in the queue.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use drover_core::Config;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cancel::CancelRequests;
use super::event_log::prune_logs;
use super::gate::{ConcurrencyGate, GatePermit};
use super::prompt::{build_prompt, display_title};
use super::runner::{
    AgentRunner, CancelHandle, CancelReason, RunError, RunReport, RunRequest, RunState,
    format_duration,
};
use crate::notify::{NotificationEmitter, NotificationRecord, NotificationType};
use crate::queue::{CloseStatus, Task, TaskQueue};

/// Extra time, beyond the grace period, that shutdown waits for runs to report.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(10);

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Model used when a task has no `model:` label.
    pub default_model: Option<String>,
    pub run_timeout: Duration,
    pub grace_period: Duration,
    /// Worker working directory.
    pub agent_dir: PathBuf,
    /// Fallback channel for outcome notifications.
    pub notify_channel: Option<String>,
    pub log_dir: PathBuf,
    pub max_log_files: usize,
    pub cancel_file: PathBuf,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.orchestrator.poll_interval_secs),
            default_model: config.worker.default_model.clone(),
            run_timeout: Duration::from_secs(config.worker.timeout_secs),
            grace_period: Duration::from_secs(config.worker.grace_period_secs),
            agent_dir: config.agent_working_dir(),
            notify_channel: config.orchestrator.notify_channel.clone(),
            log_dir: config.log_dir(),
            max_log_files: config.orchestrator.max_log_files,
            cancel_file: config.cancel_file(),
        }
    }
}

/// Everything the scheduler works with. Passed in explicitly; there is no
/// global state.
pub struct OrchestratorContext {
    pub queue: Arc<dyn TaskQueue>,
    pub runner: AgentRunner,
    pub gate: Arc<ConcurrencyGate>,
    pub emitter: NotificationEmitter,
    pub config: SchedulerConfig,
}

/// Snapshot of one run.
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub task_id: String,
    pub run_id: String,
    pub title: String,
    pub model: Option<String>,
    pub working_directory: PathBuf,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub state: RunState,
}

/// Message a runner task sends when its run is over.
#[derive(Debug)]
pub struct RunCompletion {
    pub task_id: String,
    pub run_id: String,
    pub result: Result<RunReport, RunError>,
}

struct ActiveRun {
    run: AgentRun,
    channel: Option<String>,
    started: Instant,
    cancel: CancelHandle,
    /// Released when the run leaves the active set.
    _permit: GatePermit,
    join: JoinHandle<()>,
}

/// The orchestrator's polling loop.
pub struct Scheduler {
    ctx: OrchestratorContext,
    cancel_requests: CancelRequests,
    active: HashMap<String, ActiveRun>,
    completion_tx: mpsc::UnboundedSender<RunCompletion>,
    completion_rx: mpsc::UnboundedReceiver<RunCompletion>,
}

impl Scheduler {
    pub fn new(ctx: OrchestratorContext) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let cancel_requests = CancelRequests::new(&ctx.config.cancel_file);
        Self {
            ctx,
            cancel_requests,
            active: HashMap::new(),
            completion_tx,
            completion_rx,
        }
    }

    /// Number of runs in flight.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id)
    }

    /// Snapshots of all runs in flight.
    pub fn active_runs(&self) -> Vec<AgentRun> {
        self.active.values().map(|a| a.run.clone()).collect()
    }

    /// Ask the run for `task_id` to stop. Returns `false` if there is none.
    pub fn cancel(&self, task_id: &str, reason: CancelReason) -> bool {
        match self.active.get(task_id) {
            Some(active) => {
                info!(task_id, %reason, "Cancelling run");
                active.cancel.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Run until `shutdown` flips to `true` (or its sender goes away), then
    /// wind down active runs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.ctx.config.poll_interval.as_secs(),
            capacity = self.ctx.gate.capacity(),
            "Scheduler started"
        );

        let mut ticker = tokio::time::interval(self.ctx.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                Some(completion) = self.completion_rx.recv() => {
                    self.reap(completion).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Scheduler stopped");
    }

    /// One polling cycle. Returns the number of runs launched.
    pub async fn tick(&mut self) -> usize {
        self.process_cancel_requests();
        self.prune_logs().await;

        if self.ctx.gate.available() == 0 {
            debug!(active = self.active.len(), "All slots busy, skipping poll");
            return 0;
        }

        let tasks = match self.ctx.queue.list_ready().await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!(error = %e, "Listing ready tasks failed");
                return 0;
            }
        };

        let mut launched = 0;
        for task in tasks {
            if self.active.contains_key(&task.id) {
                continue;
            }
            let Some(permit) = self.ctx.gate.try_acquire() else {
                break;
            };
            match self.ctx.queue.claim(&task.id).await {
                Ok(true) => {
                    self.launch(task, permit).await;
                    launched += 1;
                }
                Ok(false) => {
                    debug!(task_id = %task.id, "Claim lost to another worker");
                }
                Err(e) => {
                    warn!(task_id = %task.id, error = %e, "Claim failed");
                }
            }
        }
        launched
    }

    /// Wait for the next run to finish and reap it. Returns its task ID.
    pub async fn reap_next(&mut self) -> Option<String> {
        let completion = self.completion_rx.recv().await?;
        let task_id = completion.task_id.clone();
        self.reap(completion).await;
        Some(task_id)
    }

    async fn launch(&mut self, listed: Task, permit: GatePermit) {
        let task = match self.ctx.queue.show(&listed.id).await {
            Ok(Some(details)) => merge_details(listed, details),
            Ok(None) => listed,
            Err(e) => {
                debug!(task_id = %listed.id, error = %e, "Task details unavailable");
                listed
            }
        };

        let model = task
            .model()
            .map(String::from)
            .or_else(|| self.ctx.config.default_model.clone());
        let run_id = uuid::Uuid::new_v4().to_string();
        let title = display_title(&task).to_string();
        let timeout = self.ctx.config.run_timeout;
        let started_at = Utc::now();

        let mut run = AgentRun {
            task_id: task.id.clone(),
            run_id: run_id.clone(),
            title: title.clone(),
            model: model.clone(),
            working_directory: self.ctx.config.agent_dir.clone(),
            started_at,
            deadline: chrono::Duration::from_std(timeout)
                .ok()
                .and_then(|d| started_at.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            state: RunState::Claimed,
        };

        let request = RunRequest {
            task_id: task.id.clone(),
            run_id: run_id.clone(),
            title,
            priority: task.priority,
            prompt: build_prompt(&task, &self.ctx.config.agent_dir),
            working_dir: self.ctx.config.agent_dir.clone(),
            model,
            timeout,
        };

        let cancel = CancelHandle::new();
        let runner = self.ctx.runner.clone();
        let tx = self.completion_tx.clone();
        let join = {
            let cancel = cancel.clone();
            let task_id = task.id.clone();
            tokio::spawn(async move {
                let result = runner.run(request, cancel).await;
                let _ = tx.send(RunCompletion {
                    task_id,
                    run_id,
                    result,
                });
            })
        };

        info!(
            task_id = %task.id,
            run_id = %run.run_id,
            title = %run.title,
            model = run.model.as_deref().unwrap_or("default"),
            "Launched worker"
        );

        run.state = RunState::Running;
        self.active.insert(
            task.id.clone(),
            ActiveRun {
                run,
                channel: task.channel_binding,
                started: Instant::now(),
                cancel,
                _permit: permit,
                join,
            },
        );
    }

    async fn reap(&mut self, completion: RunCompletion) {
        let Some(active) = self.active.get(&completion.task_id) else {
            debug!(task_id = %completion.task_id, "Completion for unknown run ignored");
            return;
        };
        if active.run.run_id != completion.run_id {
            debug!(task_id = %completion.task_id, "Completion for stale run ignored");
            return;
        }
        let mut run = active.run.clone();
        let channel = active.channel.clone();
        let started = active.started;

        let (state, close_status, report) = match &completion.result {
            Ok(report) => (RunState::Completed, CloseStatus::Completed, Some(report)),
            Err(e) => {
                let close = match e {
                    RunError::Cancelled {
                        reason: CancelReason::Shutdown,
                        ..
                    } => CloseStatus::Released,
                    _ => CloseStatus::Failed,
                };
                (e.state(), close, e.report())
            }
        };
        run.state = state;

        let summary = match &completion.result {
            Ok(report) => report.summary.clone(),
            Err(RunError::SpawnFailed { reason }) => format!("failed to spawn worker: {reason}"),
            Err(e) => e.report().map_or_else(|| e.to_string(), |r| r.summary.clone()),
        };
        let duration = report.map_or_else(|| started.elapsed(), |r| r.duration);

        info!(
            task_id = %run.task_id,
            run_id = %run.run_id,
            state = state.as_str(),
            close = %close_status,
            duration = %format_duration(duration),
            "Run finished"
        );

        self.ctx
            .emitter
            .emit(self.completion_record(&run, channel, close_status, &summary, duration, report));

        if let Err(e) = self
            .ctx
            .queue
            .close(&run.task_id, close_status, &summary)
            .await
        {
            warn!(task_id = %run.task_id, error = %e, "Closing task failed");
        }

        // The run and its gate slot stay held until the close attempt is over.
        self.active.remove(&run.task_id);
    }

    fn completion_record(
        &self,
        run: &AgentRun,
        channel: Option<String>,
        close_status: CloseStatus,
        summary: &str,
        duration: Duration,
        report: Option<&RunReport>,
    ) -> NotificationRecord {
        let duration_text = format_duration(duration);
        let suffix = match run.state {
            RunState::TimedOut => " (TIMEOUT)",
            RunState::Cancelled => " (CANCELED)",
            _ => "",
        };
        let status = run.state.as_str();
        let mut message = format!(
            "Task `{}` {status}: **{}**\nDuration: {duration_text}{suffix}\n",
            run.task_id, run.title
        );
        message.push_str(match close_status {
            CloseStatus::Completed => "Awaiting review and deployment.",
            CloseStatus::Failed => "Check logs for errors. Use `bd reopen` to retry.",
            CloseStatus::Released => "Returned to the queue.",
        });

        let payload = json!({
            "task_id": run.task_id,
            "run_id": run.run_id,
            "title": run.title,
            "status": status,
            "duration": duration_text,
            "summary": summary,
            "model": run.model,
            "exit_code": report.and_then(|r| r.exit_code),
            "cost_usd": report.and_then(|r| r.cost_usd),
            "num_turns": report.and_then(|r| r.num_turns),
            "log_file": report.and_then(|r| r.log_file.as_ref()).map(|p| p.display().to_string()),
            "message": message,
        });

        NotificationRecord::new(
            NotificationType::TaskCompletion,
            format!("Task {status}: {}", run.title),
            channel.or_else(|| self.ctx.config.notify_channel.clone()),
            payload,
            format!("task_completion:{}", run.run_id),
        )
    }

    fn process_cancel_requests(&self) {
        let pending = self.cancel_requests.pending();
        if pending.is_empty() {
            return;
        }

        let handled: Vec<String> = pending
            .into_iter()
            .filter(|id| self.cancel(id, CancelReason::Requested))
            .collect();

        if let Err(e) = self.cancel_requests.acknowledge(&handled) {
            warn!(error = %e, "Updating cancel file failed");
        }
    }

    async fn prune_logs(&self) {
        match prune_logs(&self.ctx.config.log_dir, self.ctx.config.max_log_files).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => debug!(error = %e, "Log cleanup failed"),
        }
    }

    /// Cancel every active run, wait (bounded) for them to report, release
    /// whatever is left, and flush notifications.
    pub async fn shutdown(&mut self) {
        if !self.active.is_empty() {
            info!(active = self.active.len(), "Stopping active runs");
        }
        for active in self.active.values() {
            active.cancel.cancel(CancelReason::Shutdown);
        }

        let deadline = tokio::time::Instant::now() + self.ctx.config.grace_period + SHUTDOWN_SLACK;
        while !self.active.is_empty() {
            match tokio::time::timeout_at(deadline, self.completion_rx.recv()).await {
                Ok(Some(completion)) => self.reap(completion).await,
                Ok(None) | Err(_) => break,
            }
        }

        for (task_id, active) in self.active.drain() {
            warn!(task_id = %task_id, "Run did not stop in time, releasing task");
            active.join.abort();
            if let Err(e) = self
                .ctx
                .queue
                .close(&task_id, CloseStatus::Released, "orchestrator shutdown")
                .await
            {
                warn!(task_id = %task_id, error = %e, "Releasing task failed");
            }
        }

        self.ctx.emitter.flush().await;
    }
}

/// Prefer the detailed view, keeping listed fields the details lack.
fn merge_details(listed: Task, details: Task) -> Task {
    Task {
        id: listed.id,
        title: if details.title.is_empty() {
            listed.title
        } else {
            details.title
        },
        description: if details.description.is_empty() {
            listed.description
        } else {
            details.description
        },
        priority: details.priority.or(listed.priority),
        labels: if details.labels.is_empty() {
            listed.labels
        } else {
            details.labels
        },
        channel_binding: details.channel_binding.or(listed.channel_binding),
    }
}
